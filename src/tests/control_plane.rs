//! Control-plane functionality: creating endpoints and sessions.

use crate::nexus::{SmPkt, SmPktKind};

use super::*;

/// Test that many `Rpc` endpoints can share one Nexus.
#[test]
fn create_rpcs() {
    let nexus: Arc<Nexus> = Nexus::new(("127.0.0.1", next_port()), 0, 0);
    let handles: Vec<_> = (1..=8)
        .map(|i| {
            let nexus = nexus.clone();
            thread::spawn(move || {
                let _ = Rpc::new(&nexus, i, noop_sm_handler(), 1);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Test session connection and clean disconnection.
#[test]
fn connect_disconnect() {
    let cli_port = next_port();
    let svr_port = next_port();

    let calls = Arc::new(AtomicUsize::new(0));
    let (stop_tx, handle) =
        spawn_echo_server(svr_port, 42, ReqFuncKind::Foreground, 0, calls);

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let connected = Arc::new(AtomicBool::new(false));
    let disconnected = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(
        &nx,
        CLIENT_RPC_ID,
        {
            let connected = connected.clone();
            let disconnected = disconnected.clone();
            Box::new(move |_sess, event| match event {
                SmEventKind::Connected => connected.store(true, Ordering::SeqCst),
                SmEventKind::Disconnected => disconnected.store(true, Ordering::SeqCst),
                other => panic!("unexpected SM event {:?}", other),
            })
        },
        1,
    );

    let sess = client_connect(&rpc, svr_port, &connected);
    assert_eq!(rpc.num_active_sessions(), 1);

    rpc.destroy_session(sess).unwrap();
    loop_until(&rpc, || disconnected.load(Ordering::SeqCst));
    assert_eq!(rpc.num_active_sessions(), 0);
    assert!(!rpc.is_connected(sess));

    // The session number is dead for good.
    assert_eq!(rpc.destroy_session(sess), Err(Error::InvalidSessionNum));

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// Test multiple concurrent sessions to the same server.
#[test]
fn connect_multiple_sessions() {
    let cli_port = next_port();
    let svr_port = next_port();

    let calls = Arc::new(AtomicUsize::new(0));
    let (stop_tx, handle) =
        spawn_echo_server(svr_port, 42, ReqFuncKind::Foreground, 0, calls);

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let connected = Arc::new(AtomicUsize::new(0));
    let rpc = Rpc::new(
        &nx,
        CLIENT_RPC_ID,
        {
            let connected = connected.clone();
            Box::new(move |_sess, event| {
                if event == SmEventKind::Connected {
                    connected.fetch_add(1, Ordering::SeqCst);
                }
            })
        },
        1,
    );

    for i in 0..4 {
        let sess = rpc
            .create_session(("127.0.0.1", svr_port), SERVER_RPC_ID)
            .unwrap();
        assert_eq!(sess, i);
    }
    loop_until(&rpc, || connected.load(Ordering::SeqCst) == 4);
    assert_eq!(rpc.num_active_sessions(), 4);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// A retried connect request (same token, as after a lost response) must
/// collapse onto the session allocated for the first copy instead of
/// leaking a new one.
#[test]
fn duplicate_connect_collapses() {
    let svr_port = next_port();

    let (stop_tx, stop_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (count_tx, count_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", svr_port), 0, 0);
        let rpc = Rpc::new(&nx, SERVER_RPC_ID, noop_sm_handler(), 1);
        ready_tx.send(()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
        count_tx.send(rpc.num_active_sessions()).unwrap();
    });
    ready_rx.recv().unwrap();

    // Pose as a client Nexus whose connect response got lost: the same
    // connect request goes out twice.
    let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(std::time::Duration::from_secs(2)))
        .unwrap();
    let cli_uri = sock.local_addr().unwrap();

    let pkt = SmPkt {
        kind: SmPktKind::ConnectReq,
        err: SmErr::NoError,
        token: 0xDEAD_BEEF,
        cli_rpc_id: CLIENT_RPC_ID,
        svr_rpc_id: SERVER_RPC_ID,
        cli_sess_num: 0,
        svr_sess_num: 0,
        cli_uri,
        ep: rmp_serde::to_vec(&cli_uri).unwrap(),
    };
    let wire = rmp_serde::to_vec(&pkt).unwrap();

    let mut replies = Vec::new();
    for _ in 0..2 {
        sock.send_to(&wire, ("127.0.0.1", svr_port)).unwrap();
        let mut buf = [0u8; 4096];
        let (n, _) = sock.recv_from(&mut buf).unwrap();
        let resp: SmPkt = rmp_serde::from_slice(&buf[..n]).unwrap();
        assert_eq!(resp.kind, SmPktKind::ConnectResp);
        assert_eq!(resp.err, SmErr::NoError);
        assert_eq!(resp.token, pkt.token);
        replies.push(resp.svr_sess_num);
    }

    // Both copies name the same server session.
    assert_eq!(replies[0], replies[1]);

    // And only one session was ever allocated for them.
    stop_tx.send(()).unwrap();
    assert_eq!(count_rx.recv().unwrap(), 1);
    handle.join().unwrap();
}

/// A server that fails routing-info resolution must refuse the connection.
#[test]
fn connect_refused() {
    let cli_port = next_port();
    let svr_port = next_port();

    let (stop_tx, stop_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", svr_port), 0, 0);
        let rpc = Rpc::new(&nx, SERVER_RPC_ID, noop_sm_handler(), 1);
        rpc.fault_inject_fail_resolve_rinfo_st();
        ready_tx.send(()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
    });
    ready_rx.recv().unwrap();

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let failed = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(
        &nx,
        CLIENT_RPC_ID,
        {
            let failed = failed.clone();
            Box::new(move |_sess, event| {
                assert_eq!(
                    event,
                    SmEventKind::ConnectFailed(SmErr::RoutingResolutionFailure)
                );
                failed.store(true, Ordering::SeqCst);
            })
        },
        1,
    );

    let sess = rpc
        .create_session(("127.0.0.1", svr_port), SERVER_RPC_ID)
        .unwrap();
    loop_until(&rpc, || failed.load(Ordering::SeqCst));
    assert!(!rpc.is_connected(sess));
    assert_eq!(rpc.num_active_sessions(), 0);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

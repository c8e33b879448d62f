//! Tests for single-packet RPCs.

use super::*;

const RPC_ECHO: ReqType = 42;

/// A single small echo: byte-exact response, credits restored, nothing
/// retransmitted.
#[test]
fn single_req() {
    let cli_port = next_port();
    let svr_port = next_port();

    let calls = Arc::new(AtomicUsize::new(0));
    let (stop_tx, handle) =
        spawn_echo_server(svr_port, RPC_ECHO, ReqFuncKind::Foreground, 0, calls.clone());

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let connected = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(&nx, CLIENT_RPC_ID, flag_sm_handler(connected.clone()), 1);
    let sess = client_connect(&rpc, svr_port, &connected);

    let mut req_buf = rpc.alloc_msg_buffer(64);
    let mut resp_buf = rpc.alloc_msg_buffer(64);
    fill(&mut req_buf, 0x5a);

    do_rpc(&rpc, sess, RPC_ECHO, &req_buf, &mut resp_buf);

    assert_eq!(resp_buf.len(), 64);
    assert!(check(&resp_buf, 0x5a));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(rpc.available_credits(sess), 8);
    assert_eq!(rpc.get_num_re_tx(sess), 0);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// Many sequential echoes on one session.
#[test]
fn multiple_reqs() {
    let cli_port = next_port();
    let svr_port = next_port();

    let calls = Arc::new(AtomicUsize::new(0));
    let (stop_tx, handle) =
        spawn_echo_server(svr_port, RPC_ECHO, ReqFuncKind::Foreground, 0, calls.clone());

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let connected = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(&nx, CLIENT_RPC_ID, flag_sm_handler(connected.clone()), 1);
    let sess = client_connect(&rpc, svr_port, &connected);

    let mut req_buf = rpc.alloc_msg_buffer(64);
    let mut resp_buf = rpc.alloc_msg_buffer(64);

    const N: usize = 1000;
    for i in 0..N {
        fill(&mut req_buf, i as u8);
        do_rpc(&rpc, sess, RPC_ECHO, &req_buf, &mut resp_buf);
        assert_eq!(resp_buf.len(), 64);
        assert!(check(&resp_buf, i as u8));
    }

    assert_eq!(calls.load(Ordering::SeqCst), N);
    assert_eq!(rpc.available_credits(sess), 8);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// More concurrent requests than session slots: the overflow goes to the
/// backlog and is sent transparently as slots free up.
#[test]
fn concurrent_reqs() {
    let cli_port = next_port();
    let svr_port = next_port();

    let calls = Arc::new(AtomicUsize::new(0));
    let (stop_tx, handle) =
        spawn_echo_server(svr_port, RPC_ECHO, ReqFuncKind::Foreground, 0, calls);

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let connected = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(&nx, CLIENT_RPC_ID, flag_sm_handler(connected.clone()), 1);
    let sess = client_connect(&rpc, svr_port, &connected);

    // Twice the slot count, so half the requests start out backlogged.
    const N: usize = 16;
    let mut req_bufs: Vec<MsgBuf> = (0..N).map(|_| rpc.alloc_msg_buffer(64)).collect();
    let mut resp_bufs: Vec<MsgBuf> = (0..N).map(|_| rpc.alloc_msg_buffer(64)).collect();
    for (i, buf) in req_bufs.iter_mut().enumerate() {
        fill(buf, i as u8);
    }

    let completions = Arc::new(AtomicUsize::new(0));
    for i in 0..N {
        let completions = completions.clone();
        rpc.enqueue_request(
            sess,
            RPC_ECHO,
            &req_bufs[i],
            &mut resp_bufs[i],
            move |rpc, resp_handle, tag| {
                assert_eq!(tag, i);
                rpc.release_response(resp_handle);
                completions.fetch_add(1, Ordering::SeqCst);
            },
            i,
            INVALID_BG_ETID,
        );
    }

    loop_until(&rpc, || completions.load(Ordering::SeqCst) == N);
    for (i, buf) in resp_bufs.iter().enumerate() {
        assert_eq!(buf.len(), 64);
        assert!(check(buf, i as u8));
    }
    assert_eq!(rpc.available_credits(sess), 8);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

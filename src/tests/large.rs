//! Tests for multi-packet RPCs: reassembly, credit returns, and RFRs.

use super::*;

const RPC_ECHO: ReqType = 42;
const RPC_CONSUME: ReqType = 43;
const RPC_PRODUCE: ReqType = 44;

const LARGE_MSG_LEN: usize = 16384; // 4 packets

/// A multi-packet request with a single-packet response.
#[test]
fn large_req() {
    let cli_port = next_port();
    let svr_port = next_port();

    let (stop_tx, stop_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", svr_port), 0, 0);
        nx.set_req_handler(RPC_CONSUME, ReqFuncKind::Foreground, |rpc, mut req| {
            assert_eq!(req.req_msgbuf().len(), LARGE_MSG_LEN);
            assert!(check(req.req_msgbuf(), 0x11));

            let resp = req.pre_resp_msgbuf();
            resp.set_len(8);
            fill(resp, 0x22);
            rpc.enqueue_response(req);
        });

        let rpc = Rpc::new(&nx, SERVER_RPC_ID, noop_sm_handler(), 1);
        ready_tx.send(()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
    });
    ready_rx.recv().unwrap();

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let connected = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(&nx, CLIENT_RPC_ID, flag_sm_handler(connected.clone()), 1);
    let sess = client_connect(&rpc, svr_port, &connected);

    let mut req_buf = rpc.alloc_msg_buffer(LARGE_MSG_LEN);
    let mut resp_buf = rpc.alloc_msg_buffer(64);
    fill(&mut req_buf, 0x11);

    do_rpc(&rpc, sess, RPC_CONSUME, &req_buf, &mut resp_buf);
    assert_eq!(resp_buf.len(), 8);
    assert!(check(&resp_buf, 0x22));
    assert_eq!(rpc.available_credits(sess), 8);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// A single-packet request with a multi-packet response.
#[test]
fn large_resp() {
    let cli_port = next_port();
    let svr_port = next_port();

    let (stop_tx, stop_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", svr_port), 0, 0);
        nx.set_req_handler(RPC_PRODUCE, ReqFuncKind::Foreground, |rpc, mut req| {
            let mut resp = rpc.alloc_msg_buffer(LARGE_MSG_LEN);
            assert!(resp.is_valid());
            resp.set_len(LARGE_MSG_LEN);
            fill(&mut resp, 0x33);
            req.set_dyn_resp_msgbuf(resp);
            rpc.enqueue_response(req);
        });

        let rpc = Rpc::new(&nx, SERVER_RPC_ID, noop_sm_handler(), 1);
        ready_tx.send(()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
    });
    ready_rx.recv().unwrap();

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let connected = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(&nx, CLIENT_RPC_ID, flag_sm_handler(connected.clone()), 1);
    let sess = client_connect(&rpc, svr_port, &connected);

    let mut req_buf = rpc.alloc_msg_buffer(16);
    let mut resp_buf = rpc.alloc_msg_buffer(50000);
    fill(&mut req_buf, 0);

    for _ in 0..100 {
        do_rpc(&rpc, sess, RPC_PRODUCE, &req_buf, &mut resp_buf);
        assert_eq!(resp_buf.len(), LARGE_MSG_LEN);
        assert!(check(&resp_buf, 0x33));
    }
    assert_eq!(rpc.available_credits(sess), 8);
    assert_eq!(rpc.get_num_re_tx(sess), 0);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// Multi-packet in both directions: 4-packet request, 4-packet response.
/// Both sides end with their full wire sequence exchanged and the client's
/// credits restored.
#[test]
fn large_both() {
    let cli_port = next_port();
    let svr_port = next_port();

    let calls = Arc::new(AtomicUsize::new(0));
    let (stop_tx, handle) =
        spawn_echo_server(svr_port, RPC_ECHO, ReqFuncKind::Foreground, 0, calls.clone());

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let connected = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(&nx, CLIENT_RPC_ID, flag_sm_handler(connected.clone()), 1);
    let sess = client_connect(&rpc, svr_port, &connected);

    let mut req_buf = rpc.alloc_msg_buffer(LARGE_MSG_LEN);
    let mut resp_buf = rpc.alloc_msg_buffer(LARGE_MSG_LEN);

    const N: usize = 100;
    for i in 0..N {
        fill(&mut req_buf, i as u8);
        do_rpc(&rpc, sess, RPC_ECHO, &req_buf, &mut resp_buf);
        assert_eq!(resp_buf.len(), LARGE_MSG_LEN);
        assert!(check(&resp_buf, i as u8));
    }

    assert_eq!(calls.load(Ordering::SeqCst), N);
    assert_eq!(rpc.available_credits(sess), 8);
    assert_eq!(rpc.get_num_re_tx(sess), 0);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

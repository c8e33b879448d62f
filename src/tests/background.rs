//! Background-thread handoff: handlers and continuations that run off the
//! dispatch thread.

use super::*;
use std::time::Duration;

const RPC_ECHO: ReqType = 42;
const RPC_SLOW: ReqType = 43;

/// A request handler registered as background runs off the dispatch thread
/// and still produces a byte-exact echo.
#[test]
fn bg_request_handler() {
    let cli_port = next_port();
    let svr_port = next_port();

    let ran_in_bg = Arc::new(AtomicBool::new(false));
    let (stop_tx, stop_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = thread::spawn({
        let ran_in_bg = ran_in_bg.clone();
        move || {
            let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", svr_port), 0, 1);
            nx.set_req_handler(RPC_ECHO, ReqFuncKind::Background, move |rpc, req| {
                if rpc.in_background() {
                    ran_in_bg.store(true, Ordering::SeqCst);
                }
                echo(rpc, req);
            });

            let rpc = Rpc::new(&nx, SERVER_RPC_ID, noop_sm_handler(), 1);
            ready_tx.send(()).unwrap();
            while stop_rx.try_recv().is_err() {
                rpc.run_event_loop_once();
            }
        }
    });
    ready_rx.recv().unwrap();

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let connected = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(&nx, CLIENT_RPC_ID, flag_sm_handler(connected.clone()), 1);
    let sess = client_connect(&rpc, svr_port, &connected);

    let mut req_buf = rpc.alloc_msg_buffer(64);
    let mut resp_buf = rpc.alloc_msg_buffer(64);

    for i in 0..100 {
        fill(&mut req_buf, i as u8);
        do_rpc(&rpc, sess, RPC_ECHO, &req_buf, &mut resp_buf);
        assert!(check(&resp_buf, i as u8));
    }
    assert!(ran_in_bg.load(Ordering::SeqCst));

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// A continuation with an explicit background thread ID runs there, and its
/// deferred `release_response` still frees the slot for the next request.
#[test]
fn bg_continuation() {
    let cli_port = next_port();
    let svr_port = next_port();

    let calls = Arc::new(AtomicUsize::new(0));
    let (stop_tx, handle) =
        spawn_echo_server(svr_port, RPC_ECHO, ReqFuncKind::Foreground, 0, calls);

    // The client Nexus owns the background thread for continuations.
    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 1);
    let connected = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(&nx, CLIENT_RPC_ID, flag_sm_handler(connected.clone()), 1);
    let sess = client_connect(&rpc, svr_port, &connected);

    let mut req_buf = rpc.alloc_msg_buffer(64);
    let mut resp_buf = rpc.alloc_msg_buffer(64);
    fill(&mut req_buf, 0x42);

    let cont_in_bg = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    {
        let cont_in_bg = cont_in_bg.clone();
        let done = done.clone();
        rpc.enqueue_request(
            sess,
            RPC_ECHO,
            &req_buf,
            &mut resp_buf,
            move |rpc, resp_handle, _tag| {
                cont_in_bg.store(rpc.in_background(), Ordering::SeqCst);
                rpc.release_response(resp_handle);
                done.store(true, Ordering::SeqCst);
            },
            0,
            0, // background thread 0
        );
    }
    loop_until(&rpc, || done.load(Ordering::SeqCst));
    assert!(cont_in_bg.load(Ordering::SeqCst));
    assert!(check(&resp_buf, 0x42));

    // The released slot is usable again.
    loop_until(&rpc, || rpc.available_credits(sess) == 8);
    do_rpc(&rpc, sess, RPC_ECHO, &req_buf, &mut resp_buf);
    assert!(check(&resp_buf, 0x42));

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// A slow background handler must not block dispatch: fast foreground
/// requests complete while the slow one is still running.
#[test]
fn dispatch_not_blocked() {
    let cli_port = next_port();
    let svr_port = next_port();

    let (stop_tx, stop_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", svr_port), 0, 1);
        nx.set_req_handler(RPC_SLOW, ReqFuncKind::Background, |rpc, req| {
            thread::sleep(Duration::from_millis(30));
            echo(rpc, req);
        });
        nx.set_req_handler(RPC_ECHO, ReqFuncKind::Foreground, echo);

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

    let mut slow_req = rpc.alloc_msg_buffer(64);
    let mut slow_resp = rpc.alloc_msg_buffer(64);
    fill(&mut slow_req, 1);

    let slow_done = Arc::new(AtomicBool::new(false));
    {
        let slow_done = slow_done.clone();
        rpc.enqueue_request(
            sess,
            RPC_SLOW,
            &slow_req,
            &mut slow_resp,
            move |rpc, resp_handle, _tag| {
                rpc.release_response(resp_handle);
                slow_done.store(true, Ordering::SeqCst);
            },
            0,
            INVALID_BG_ETID,
        );
    }

    // The fast request overtakes the slow one.
    let mut fast_req = rpc.alloc_msg_buffer(64);
    let mut fast_resp = rpc.alloc_msg_buffer(64);
    fill(&mut fast_req, 2);
    do_rpc(&rpc, sess, RPC_ECHO, &fast_req, &mut fast_resp);
    assert!(check(&fast_resp, 2));
    assert!(!slow_done.load(Ordering::SeqCst));

    loop_until(&rpc, || slow_done.load(Ordering::SeqCst));
    assert!(check(&slow_resp, 1));

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

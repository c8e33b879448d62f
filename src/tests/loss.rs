//! Packet-loss recovery: drop injection, retransmission, and the rollback
//! guard against packets still queued in the timing wheel.

use super::*;

const RPC_ECHO: ReqType = 42;
const LARGE_MSG_LEN: usize = 16384; // 4 packets

/// With packet drops injected on both sides, multi-packet RPCs still
/// complete byte-exactly, retransmissions are counted, and the server
/// handler runs exactly once per request.
#[test]
fn drop_and_retransmit() {
    let cli_port = next_port();
    let svr_port = next_port();

    let calls = Arc::new(AtomicUsize::new(0));
    let (stop_tx, stop_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = thread::spawn({
        let calls = calls.clone();
        move || {
            let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", svr_port), 0, 0);
            nx.set_req_handler(RPC_ECHO, ReqFuncKind::Foreground, move |rpc, req| {
                calls.fetch_add(1, Ordering::SeqCst);
                echo(rpc, req);
            });

            let rpc = Rpc::new(&nx, SERVER_RPC_ID, noop_sm_handler(), 1);
            rpc.fault_inject_set_pkt_drop_prob_st(0.25);
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
    rpc.fault_inject_set_pkt_drop_prob_st(0.25);

    let mut req_buf = rpc.alloc_msg_buffer(LARGE_MSG_LEN);
    let mut resp_buf = rpc.alloc_msg_buffer(LARGE_MSG_LEN);

    const N: usize = 10;
    for i in 0..N {
        fill(&mut req_buf, i as u8);
        do_rpc(&rpc, sess, RPC_ECHO, &req_buf, &mut resp_buf);
        assert_eq!(resp_buf.len(), LARGE_MSG_LEN);
        assert!(check(&resp_buf, i as u8));
        assert_eq!(rpc.available_credits(sess), 8);
    }

    // With a quarter of all packets dropped, some retransmission must have
    // happened, and the handler must not have been re-invoked for it.
    assert!(rpc.pkt_loss_stats().num_re_tx >= 1);
    assert_eq!(calls.load(Ordering::SeqCst), N);

    // The counters are user-resettable.
    rpc.reset_num_re_tx(sess);
    assert_eq!(rpc.get_num_re_tx(sess), 0);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

/// Force the retransmission scan to find packets still in the timing wheel:
/// the rollback must be deferred and counted, and the RPC must complete
/// with a single continuation invocation.
#[test]
fn rollback_guarded_by_wheel() {
    let cli_port = next_port();
    let svr_port = next_port();

    let calls = Arc::new(AtomicUsize::new(0));
    let (stop_tx, handle) =
        spawn_echo_server(svr_port, RPC_ECHO, ReqFuncKind::Foreground, 0, calls);

    let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", cli_port), 0, 0);
    let connected = Arc::new(AtomicBool::new(false));
    let rpc = Rpc::new(&nx, CLIENT_RPC_ID, flag_sm_handler(connected.clone()), 1);
    let sess = client_connect(&rpc, svr_port, &connected);

    // Throttle the session so hard that every packet parks in the wheel far
    // beyond the RPC RTO.
    rpc.set_timely_rate(sess, 1.0);

    let mut req_buf = rpc.alloc_msg_buffer(LARGE_MSG_LEN);
    let mut resp_buf = rpc.alloc_msg_buffer(LARGE_MSG_LEN);
    fill(&mut req_buf, 0x77);

    let completions = Arc::new(AtomicUsize::new(0));
    {
        let completions = completions.clone();
        rpc.enqueue_request(
            sess,
            RPC_ECHO,
            &req_buf,
            &mut resp_buf,
            move |rpc, resp_handle, _tag| {
                rpc.release_response(resp_handle);
                completions.fetch_add(1, Ordering::SeqCst);
            },
            0,
            INVALID_BG_ETID,
        );
    }

    // The loss scan must hit the slot while its packets wait in the wheel.
    loop_until(&rpc, || {
        rpc.pkt_loss_stats().still_in_wheel_during_retx >= 1
    });

    // The wheel drains at its horizon and the RPC still completes, exactly
    // once.
    loop_until(&rpc, || completions.load(Ordering::SeqCst) == 1);
    assert_eq!(resp_buf.len(), LARGE_MSG_LEN);
    assert!(check(&resp_buf, 0x77));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(rpc.available_credits(sess), 8);

    stop_tx.send(()).unwrap();
    handle.join().unwrap();
}

#![allow(unused_imports)]

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::{ptr, thread};

use crate::type_alias::*;
use crate::*;

static PORT: AtomicU16 = AtomicU16::new(31850);

/// Every test starts by taking a port, so logging is initialized here.
fn next_port() -> u16 {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init();
    PORT.fetch_add(1, Ordering::SeqCst)
}

const SERVER_RPC_ID: RpcId = 7;
const CLIENT_RPC_ID: RpcId = 1;

/// An SM handler that raises a flag when the session connects.
fn flag_sm_handler(connected: Arc<AtomicBool>) -> SmHandler {
    Box::new(move |_sess, event| {
        if event == SmEventKind::Connected {
            connected.store(true, Ordering::SeqCst);
        }
    })
}

fn noop_sm_handler() -> SmHandler {
    Box::new(|_, _| {})
}

/// Drive the event loop until the condition holds; panic after ~10 s.
fn loop_until(rpc: &Rpc, mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        rpc.run_event_loop(1);
    }
    panic!("event-loop condition not reached in time");
}

/// Fill a MsgBuf with a seed-derived byte pattern.
fn fill(buf: &mut MsgBuf, seed: u8) {
    // SAFETY: the buffer was allocated with at least `len` capacity.
    let data = unsafe { buf.as_mut_slice() };
    for (i, b) in data.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8);
    }
}

/// Check a MsgBuf against the seed-derived byte pattern.
fn check(buf: &MsgBuf, seed: u8) -> bool {
    // SAFETY: only called on buffers with `len` valid bytes.
    let data = unsafe { buf.as_slice() };
    data.iter()
        .enumerate()
        .all(|(i, &b)| b == seed.wrapping_add(i as u8))
}

/// Echo the request back, using the preallocated response buffer when the
/// payload fits in one packet and a dynamic buffer otherwise.
fn echo(rpc: &Rpc, mut req: ReqHandle) {
    let len = req.req_msgbuf().len();
    let src = req.req_msgbuf().as_ptr();

    if len <= UdpTransport::MAX_DATA_PER_PKT {
        let resp = req.pre_resp_msgbuf();
        unsafe { ptr::copy_nonoverlapping(src, resp.as_ptr(), len) };
        resp.set_len(len);
    } else {
        let mut resp = rpc.alloc_msg_buffer(len);
        assert!(resp.is_valid());
        unsafe { ptr::copy_nonoverlapping(src, resp.as_ptr(), len) };
        resp.set_len(len);
        req.set_dyn_resp_msgbuf(resp);
    }
    rpc.enqueue_response(req);
}

/// Spawn an echo server on its own Nexus and dispatch thread.
/// Returns a stop sender and the join handle.
fn spawn_echo_server(
    port: u16,
    req_type: ReqType,
    kind: ReqFuncKind,
    num_bg_threads: usize,
    handler_calls: Arc<AtomicUsize>,
) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
    let (stop_tx, stop_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let nx: Arc<Nexus> = Nexus::new(("127.0.0.1", port), 0, num_bg_threads);
        nx.set_req_handler(req_type, kind, move |rpc, req| {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            echo(rpc, req);
        });

        let rpc = Rpc::new(&nx, SERVER_RPC_ID, noop_sm_handler(), 1);
        ready_tx.send(()).unwrap();
        while stop_rx.try_recv().is_err() {
            rpc.run_event_loop_once();
        }
    });

    ready_rx.recv().unwrap();
    (stop_tx, handle)
}

/// Create a session to the given server port and wait for it to connect.
fn client_connect(rpc: &Rpc, svr_port: u16, connected: &Arc<AtomicBool>) -> SessId {
    let sess = rpc
        .create_session(("127.0.0.1", svr_port), SERVER_RPC_ID)
        .unwrap();
    loop_until(rpc, || connected.load(Ordering::SeqCst));
    assert!(rpc.is_connected(sess));
    sess
}

/// Issue one request and block (polling) until its continuation runs.
fn do_rpc(rpc: &Rpc, sess: SessId, req_type: ReqType, req: &MsgBuf, resp: &mut MsgBuf) {
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    rpc.enqueue_request(
        sess,
        req_type,
        req,
        resp,
        move |rpc, resp_handle, _tag| {
            rpc.release_response(resp_handle);
            d.store(true, Ordering::SeqCst);
        },
        0,
        INVALID_BG_ETID,
    );
    loop_until(rpc, || done.load(Ordering::SeqCst));
}

mod background;
mod control_plane;
mod large;
mod loss;
mod small;

//! Background worker threads shared across a process's endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::handler::{ReqFunc, ReqHandle, RespHandle};
use crate::nexus::TlsRegistry;
use crate::rpc::Rpc;
use crate::session::SSlot;
use crate::transport::UnreliableTransport;
use crate::util::mt_queue::MtQueue;

/// What a background thread should run for a slot.
pub(crate) enum BgWorkItemKind<Tp: UnreliableTransport> {
    /// Run the request handler; the slot holds a complete request.
    Request(ReqFunc<Tp>),

    /// Run the continuation stored in the slot.
    Response,
}

/// A unit of work handed from a dispatch thread to a background thread.
pub(crate) struct BgWorkItem<Tp: UnreliableTransport> {
    pub kind: BgWorkItemKind<Tp>,
    pub rpc: *const Rpc<Tp>,
    pub sslot: *mut SSlot<Tp>,
}

// Work items cross threads by construction. The slot and endpoint outlive
// the item: a slot is not reused until its response/continuation finishes,
// and the endpoint may not be dropped with work outstanding.
unsafe impl<Tp: UnreliableTransport> Send for BgWorkItem<Tp> {}

/// The background worker loop: poll the queue, sleep 1 us when idle, run
/// handlers and continuations otherwise.
pub(crate) fn bg_thread_func<Tp: UnreliableTransport>(
    bg_thread_index: usize,
    queue: Arc<MtQueue<BgWorkItem<Tp>>>,
    tls_registry: Arc<TlsRegistry>,
    kill_switch: Arc<AtomicBool>,
) {
    tls_registry.init();
    log::info!("Nexus: background thread {} running", bg_thread_index);

    while !kill_switch.load(Ordering::Relaxed) {
        if queue.size() == 0 {
            thread::sleep(Duration::from_micros(1));
            continue;
        }

        while let Some(wi) = queue.pop() {
            // SAFETY: see the `Send` impl above.
            let rpc = unsafe { &*wi.rpc };
            match wi.kind {
                BgWorkItemKind::Request(req_func) => {
                    log::trace!(
                        "Nexus: background thread {} running request handler",
                        bg_thread_index
                    );
                    (req_func.func)(rpc, ReqHandle::new(wi.sslot));
                }
                BgWorkItemKind::Response => {
                    log::trace!(
                        "Nexus: background thread {} running continuation",
                        bg_thread_index
                    );
                    // SAFETY: dispatch stopped touching the slot when it
                    // queued this item.
                    let sslot = unsafe { &mut *wi.sslot };
                    let ci = sslot.client_info_mut();
                    let cont = ci.cont.take().expect("continuation already taken");
                    let tag = ci.tag;
                    cont(rpc, RespHandle::new(wi.sslot), tag);
                }
            }
        }
    }

    log::info!("Nexus: background thread {} exiting", bg_thread_index);
}

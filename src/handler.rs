//! Handles and function types exposed to request handlers and continuations.

use std::sync::Arc;

use crate::msgbuf::MsgBuf;
use crate::rpc::Rpc;
use crate::session::SSlot;
use crate::transport::{UdpTransport, UnreliableTransport};
use crate::type_alias::*;

/// RPC request handler function type. Handlers receive the `Rpc` endpoint
/// that accepted the request and a handle to the request state; they respond
/// by filling a response buffer and calling [`Rpc::enqueue_response`].
pub(crate) type ReqHandlerFn<Tp> = Arc<dyn Fn(&Rpc<Tp>, ReqHandle<Tp>) + Send + Sync>;

/// Continuation function type, invoked when a request completes. The last
/// argument is the user's tag.
pub(crate) type ContFn<Tp> = Box<dyn FnOnce(&Rpc<Tp>, RespHandle<Tp>, usize) + Send>;

/// Where a request handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqFuncKind {
    /// Run inline on the dispatch thread. The handler must be short.
    Foreground,
    /// Run on a background thread; the dispatch thread keeps polling.
    Background,
}

/// A registered request handler.
pub(crate) struct ReqFunc<Tp: UnreliableTransport> {
    pub func: ReqHandlerFn<Tp>,
    pub kind: ReqFuncKind,
}

impl<Tp: UnreliableTransport> Clone for ReqFunc<Tp> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            kind: self.kind,
        }
    }
}

impl<Tp: UnreliableTransport> ReqFunc<Tp> {
    #[inline(always)]
    pub fn is_background(&self) -> bool {
        self.kind == ReqFuncKind::Background
    }
}

/// Handle to a received request, passed to the request handler.
///
/// The request buffer of a single-packet foreground request aliases
/// receive-ring memory and is only valid until the handler returns; handlers
/// that need the data later must copy it.
pub struct ReqHandle<Tp: UnreliableTransport = UdpTransport> {
    pub(crate) sslot: *mut SSlot<Tp>,
}

// Handles may be carried to and from background threads; the slot they
// point to is not touched by dispatch until the response is enqueued.
unsafe impl<Tp: UnreliableTransport> Send for ReqHandle<Tp> {}

impl<Tp: UnreliableTransport> ReqHandle<Tp> {
    #[inline(always)]
    pub(crate) fn new(sslot: *mut SSlot<Tp>) -> Self {
        Self { sslot }
    }

    /// Return the type of this request.
    #[inline(always)]
    pub fn req_type(&self) -> ReqType {
        // SAFETY: the slot outlives the handle.
        unsafe { (*self.sslot).server_info().req_type }
    }

    /// Return the request buffer.
    #[inline(always)]
    pub fn req_msgbuf(&self) -> &MsgBuf {
        // SAFETY: the slot outlives the handle.
        unsafe { &(*self.sslot).server_info().req_msgbuf }
    }

    /// Return the preallocated response buffer. It can hold one packet's
    /// worth of data; larger responses need a dynamic buffer.
    #[inline(always)]
    pub fn pre_resp_msgbuf(&mut self) -> &mut MsgBuf {
        // SAFETY: the slot outlives the handle.
        unsafe { &mut (*self.sslot).server_info_mut().pre_resp_msgbuf }
    }

    /// Install a dynamic response buffer, used instead of the preallocated
    /// one by the next [`Rpc::enqueue_response`] for this handle.
    #[inline]
    pub fn set_dyn_resp_msgbuf(&mut self, msgbuf: MsgBuf) {
        // SAFETY: the slot outlives the handle.
        unsafe { (*self.sslot).server_info_mut().dyn_resp_msgbuf = msgbuf };
    }
}

/// Handle to a completed response, passed to the continuation. Ownership is
/// returned to the runtime with [`Rpc::release_response`].
pub struct RespHandle<Tp: UnreliableTransport = UdpTransport> {
    pub(crate) sslot: *mut SSlot<Tp>,
}

unsafe impl<Tp: UnreliableTransport> Send for RespHandle<Tp> {}

impl<Tp: UnreliableTransport> RespHandle<Tp> {
    #[inline(always)]
    pub(crate) fn new(sslot: *mut SSlot<Tp>) -> Self {
        Self { sslot }
    }
}

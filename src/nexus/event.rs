use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::type_alias::*;

/// Session-management error codes carried in SM packets and surfaced to the
/// application's SM handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SmErr {
    #[error("no error")]
    NoError,

    #[error("invalid remote Rpc ID")]
    InvalidRemoteRpcId,

    #[error("no RX ring entries available for a new session")]
    NoRingEntries,

    #[error("routing info resolution failed")]
    RoutingResolutionFailure,

    #[error("session management request timed out")]
    SmTimeout,
}

/// Session-management packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum SmPktKind {
    ConnectReq,
    ConnectResp,
    DisconnectReq,
    DisconnectResp,
    /// Abortive teardown of a session with in-flight RPCs.
    Reset,
}

/// A session-management packet, exchanged over the Nexus's UDP channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SmPkt {
    pub kind: SmPktKind,
    pub err: SmErr,

    /// Client-generated token that makes connect requests idempotent.
    pub token: u64,

    pub cli_rpc_id: RpcId,
    pub svr_rpc_id: RpcId,
    pub cli_sess_num: SessId,
    pub svr_sess_num: SessId,

    /// The client Nexus's SM address, for server replies.
    pub cli_uri: SocketAddr,

    /// Sender's transport endpoint, as an opaque routing-info blob.
    pub ep: Vec<u8>,
}

impl SmPkt {
    /// The Rpc that should receive this packet.
    #[inline]
    pub fn dst_rpc_id(&self) -> RpcId {
        match self.kind {
            SmPktKind::ConnectReq | SmPktKind::DisconnectReq | SmPktKind::Reset => self.svr_rpc_id,
            SmPktKind::ConnectResp | SmPktKind::DisconnectResp => self.cli_rpc_id,
        }
    }
}

/// Session-management event kinds reported to the application through the
/// `sm_handler` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventKind {
    /// The session is connected and ready for requests.
    Connected,

    /// Session connection failed; the session number is dead.
    ConnectFailed(SmErr),

    /// The session disconnected cleanly.
    Disconnected,

    /// The session is being torn down with RPCs still in flight; their
    /// continuations will never run.
    Reset,

    /// Abortive teardown finished; the session number is dead.
    ResetComplete,
}

/// The application's session-management callback. Runs on the dispatch
/// thread only.
pub type SmHandler = Box<dyn FnMut(SessId, SmEventKind)>;

/// Per-`Rpc` mailbox through which the Nexus delivers SM packets to the
/// dispatch thread.
pub(crate) struct SmHook {
    rx: Mutex<Vec<SmPkt>>,
    count: AtomicUsize,
}

impl SmHook {
    pub fn new() -> Self {
        Self {
            rx: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        }
    }

    /// Deposit a packet. Called from the Nexus's SM listener thread.
    pub fn push(&self, pkt: SmPkt) {
        let mut rx = self.rx.lock().unwrap();
        rx.push(pkt);
        self.count.store(rx.len(), Ordering::Release);
    }

    /// Cheap emptiness check for the event loop.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }

    /// Take all deposited packets. Called from the dispatch thread.
    pub fn drain(&self) -> Vec<SmPkt> {
        let mut rx = self.rx.lock().unwrap();
        self.count.store(0, Ordering::Release);
        std::mem::take(&mut *rx)
    }
}

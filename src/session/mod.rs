mod sslot;

use std::collections::VecDeque;
use std::net::SocketAddr;

pub(crate) use self::sslot::*;
use crate::cc::timely::Timely;
use crate::handler::ContFn;
use crate::msgbuf::MsgBuf;
use crate::transport::UnreliableTransport;
use crate::type_alias::*;

/// Credits per session: the cap on outstanding packets per direction.
/// Also the number of session slots, so `req_num % SESSION_CREDITS` locates
/// a slot.
pub(crate) const SESSION_CREDITS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    ConnectInProgress,
    Connected,
    DisconnectInProgress,
    ResetInProgress,
    Disconnected,
}

/// Arguments of one `enqueue_request` call, kept whole so calls can be
/// deferred (session backlog, background handoff).
pub(crate) struct EnqReqArgs<Tp: UnreliableTransport> {
    pub sess_num: SessId,
    pub req_type: ReqType,
    pub req_msgbuf: *const MsgBuf,
    pub resp_msgbuf: *mut MsgBuf,
    pub cont: ContFn<Tp>,
    pub tag: usize,
    pub cont_etid: ETid,
}

// Request arguments cross from background threads to dispatch through the
// MPSC queue. The buffers they point to stay owned by the user for the
// duration of the RPC.
unsafe impl<Tp: UnreliableTransport> Send for EnqReqArgs<Tp> {}

/// A bidirectional association with a remote endpoint.
pub(crate) struct Session<Tp: UnreliableTransport> {
    /// Role of this session.
    pub role: SessionRole,

    /// Connection state.
    pub state: SessionState,

    /// Local session number.
    pub local_sess_num: SessId,

    /// Remote peer's session number.
    pub remote_sess_num: SessId,

    /// Remote peer's Rpc ID.
    pub remote_rpc_id: RpcId,

    /// Remote peer's Nexus URI, for session-management packets.
    pub remote_uri: SocketAddr,

    /// Resolved remote routing information.
    pub peer: Option<Tp::Peer>,

    /// Session request slots.
    pub slots: Box<[SSlot<Tp>]>,

    /// Send credits (client side). One packet transmission costs one credit.
    pub credits: usize,

    /// Indices of free slots.
    pub sslot_free_vec: Vec<usize>,

    /// Requests deferred until a slot frees up.
    pub enq_req_backlog: VecDeque<EnqReqArgs<Tp>>,

    /// Congestion-control state.
    pub cc: Timely,

    /// Retransmissions on this session. User-readable and resettable.
    pub num_re_tx: usize,

    /// Client-generated token identifying this session's connect request.
    pub conn_token: u64,

    /// Whether a session-management request is outstanding.
    pub sm_req_pending: bool,

    /// Timestamp of the last session-management request transmission.
    pub sm_req_tsc: u64,

    /// Session-management retransmissions so far.
    pub sm_retries: usize,
}

impl<Tp: UnreliableTransport> Session<Tp> {
    /// Create a new client session. The caller links `slots[i].session`
    /// back to the boxed session once its address is stable.
    pub fn new_client(
        local_sess_num: SessId,
        remote_rpc_id: RpcId,
        remote_uri: SocketAddr,
        conn_token: u64,
        cc: Timely,
    ) -> Self {
        let slots = (0..SESSION_CREDITS).map(SSlot::new_client).collect();
        Self {
            role: SessionRole::Client,
            state: SessionState::ConnectInProgress,
            local_sess_num,
            remote_sess_num: 0,
            remote_rpc_id,
            remote_uri,
            peer: None,
            slots,
            credits: SESSION_CREDITS,
            sslot_free_vec: (0..SESSION_CREDITS).rev().collect(),
            enq_req_backlog: VecDeque::new(),
            cc,
            num_re_tx: 0,
            conn_token,
            sm_req_pending: false,
            sm_req_tsc: 0,
            sm_retries: 0,
        }
    }

    /// Create a new server session. `pre_resp_msgbufs` provides one
    /// preallocated response buffer per slot.
    pub fn new_server(
        local_sess_num: SessId,
        remote_sess_num: SessId,
        remote_rpc_id: RpcId,
        remote_uri: SocketAddr,
        peer: Tp::Peer,
        pre_resp_msgbufs: Vec<MsgBuf>,
        cc: Timely,
    ) -> Self {
        debug_assert_eq!(pre_resp_msgbufs.len(), SESSION_CREDITS);
        let slots = pre_resp_msgbufs
            .into_iter()
            .enumerate()
            .map(|(i, pre_resp)| SSlot::new_server(i, pre_resp))
            .collect();
        Self {
            role: SessionRole::Server,
            state: SessionState::Connected,
            local_sess_num,
            remote_sess_num,
            remote_rpc_id,
            remote_uri,
            peer: Some(peer),
            slots,
            credits: SESSION_CREDITS,
            sslot_free_vec: Vec::new(),
            enq_req_backlog: VecDeque::new(),
            cc,
            num_re_tx: 0,
            conn_token: 0,
            sm_req_pending: false,
            sm_req_tsc: 0,
            sm_retries: 0,
        }
    }

    /// Return `true` if this session is a client, otherwise server.
    #[inline(always)]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    /// Return `true` if this session is connected.
    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Return `true` if no RPC is in flight on this session.
    #[inline]
    pub fn is_quiescent(&self) -> bool {
        !self.is_client() || self.sslot_free_vec.len() == SESSION_CREDITS
    }
}

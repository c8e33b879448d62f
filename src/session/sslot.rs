use std::ptr;

use crate::handler::ContFn;
use crate::msgbuf::MsgBuf;
use crate::session::{Session, SESSION_CREDITS};
use crate::transport::UnreliableTransport;
use crate::type_alias::*;

/// Client-side state of a session slot.
pub(crate) struct ClientInfo<Tp: UnreliableTransport> {
    /// Packets transmitted for this RPC's wire sequence.
    /// Packets sitting in the timing wheel are not counted.
    pub num_tx: usize,

    /// Packets received for this RPC's wire sequence (CRs and response data).
    pub num_rx: usize,

    /// The user's request buffer. Owned by the user until completion.
    pub req_msgbuf: *const MsgBuf,

    /// The user's response buffer. Owned by the user until completion.
    pub resp_msgbuf: *mut MsgBuf,

    /// Continuation to invoke on completion.
    pub cont: Option<ContFn<Tp>>,

    /// Tag passed back to the continuation.
    pub tag: usize,

    /// Background thread for the continuation; `INVALID_BG_ETID` runs it
    /// inline on dispatch.
    pub cont_etid: ETid,

    /// Per-packet TX timestamps for RTT measurement, indexed by
    /// `pkt_num % SESSION_CREDITS`.
    pub tx_ts: [u64; SESSION_CREDITS],

    /// Which of this RPC's packets still sit in the timing wheel, indexed by
    /// `pkt_num % SESSION_CREDITS`.
    pub in_wheel: [bool; SESSION_CREDITS],

    /// Number of set bits in `in_wheel`.
    pub wheel_count: usize,

    /// Timestamp of the last forward progress, for RTO detection.
    pub progress_tsc: u64,

    /// Active-RPC list links.
    pub prev: *mut SSlot<Tp>,
    pub next: *mut SSlot<Tp>,
}

impl<Tp: UnreliableTransport> ClientInfo<Tp> {
    fn new() -> Self {
        Self {
            num_tx: 0,
            num_rx: 0,
            req_msgbuf: ptr::null(),
            resp_msgbuf: ptr::null_mut(),
            cont: None,
            tag: 0,
            cont_etid: INVALID_BG_ETID,
            tx_ts: [0; SESSION_CREDITS],
            in_wheel: [false; SESSION_CREDITS],
            wheel_count: 0,
            progress_tsc: 0,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }
}

/// Server-side state of a session slot.
pub(crate) struct ServerInfo {
    /// The current request: a fake buffer aliasing RX-ring bytes for
    /// single-packet foreground requests, a dynamic buffer otherwise.
    /// Invalid when no request is held.
    pub req_msgbuf: MsgBuf,

    /// In-order datapath packets received for the current request
    /// (request packets, then RFRs).
    pub num_rx: usize,

    /// Number of packets of the current request, saved because the request
    /// buffer is buried before the response finishes transmitting.
    pub sav_num_req_pkts: usize,

    /// Request type of the current request.
    pub req_type: ReqType,

    /// Preallocated single-packet response buffer.
    pub pre_resp_msgbuf: MsgBuf,

    /// Dynamic response buffer installed by the handler; invalid if unused.
    pub dyn_resp_msgbuf: MsgBuf,
}

/// Role-dependent half of a session slot. The variant is fixed at session
/// creation and never changes.
pub(crate) enum SSlotInfo<Tp: UnreliableTransport> {
    Client(ClientInfo<Tp>),
    Server(ServerInfo),
}

/// Session slot: per-in-flight-RPC state. At most one RPC occupies a slot
/// at any time; slots are reused upon release.
pub(crate) struct SSlot<Tp: UnreliableTransport> {
    /// Owning session. Null only for the active-list sentinels.
    pub session: *mut Session<Tp>,

    /// Index of this slot within the session.
    pub index: usize,

    /// Request number of the current (or last) RPC in this slot.
    /// Strides by `SESSION_CREDITS` per reuse, so that
    /// `cur_req_num % SESSION_CREDITS == index`.
    pub cur_req_num: ReqNum,

    /// Current transmit MsgBuf: the request (client) or the response
    /// (server). Null when there is nothing to transmit.
    pub tx_msgbuf: *mut MsgBuf,

    /// Server only: whether the response uses the preallocated buffer.
    pub prealloc_used: bool,

    /// Role-dependent state.
    pub info: SSlotInfo<Tp>,
}

impl<Tp: UnreliableTransport> SSlot<Tp> {
    /// Create a client-side slot.
    pub fn new_client(index: usize) -> Self {
        Self {
            session: ptr::null_mut(),
            index,
            cur_req_num: index as ReqNum,
            tx_msgbuf: ptr::null_mut(),
            prealloc_used: false,
            info: SSlotInfo::Client(ClientInfo::new()),
        }
    }

    /// Create a server-side slot with its preallocated response buffer.
    pub fn new_server(index: usize, pre_resp_msgbuf: MsgBuf) -> Self {
        Self {
            session: ptr::null_mut(),
            index,
            cur_req_num: index as ReqNum,
            tx_msgbuf: ptr::null_mut(),
            prealloc_used: false,
            info: SSlotInfo::Server(ServerInfo {
                req_msgbuf: MsgBuf::invalid(),
                num_rx: 0,
                sav_num_req_pkts: 0,
                req_type: 0,
                pre_resp_msgbuf,
                dyn_resp_msgbuf: MsgBuf::invalid(),
            }),
        }
    }

    /// Create a sentinel node for the active-RPC list.
    pub fn sentinel() -> Self {
        Self::new_client(0)
    }

    #[inline(always)]
    pub fn client_info(&self) -> &ClientInfo<Tp> {
        match &self.info {
            SSlotInfo::Client(ci) => ci,
            SSlotInfo::Server(_) => unreachable!("server sslot used as client"),
        }
    }

    #[inline(always)]
    pub fn client_info_mut(&mut self) -> &mut ClientInfo<Tp> {
        match &mut self.info {
            SSlotInfo::Client(ci) => ci,
            SSlotInfo::Server(_) => unreachable!("server sslot used as client"),
        }
    }

    #[inline(always)]
    pub fn server_info(&self) -> &ServerInfo {
        match &self.info {
            SSlotInfo::Server(si) => si,
            SSlotInfo::Client(_) => unreachable!("client sslot used as server"),
        }
    }

    #[inline(always)]
    pub fn server_info_mut(&mut self) -> &mut ServerInfo {
        match &mut self.info {
            SSlotInfo::Server(si) => si,
            SSlotInfo::Client(_) => unreachable!("client sslot used as server"),
        }
    }
}

mod pkt_loss;
mod queues;
mod rx;
mod sm;
mod tx;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::UdpSocket;
use std::sync::Arc;
use std::{mem, ptr};

use ahash::RandomState;
use quanta::Clock;
use thiserror::Error;

use crate::handler::{ReqFunc, ReqHandle, RespHandle};
use crate::msgbuf::{data_size_to_num_pkts, MsgBuf};
use crate::nexus::{Nexus, SmHandler, SmHook};
use crate::pkthdr::PacketHeader;
use crate::session::*;
use crate::transport::{TxItem, UnreliableTransport};
use crate::type_alias::*;
use crate::util::buddy::BuddyAllocator;
use crate::util::likely::*;
use crate::util::mt_queue::MtQueue;
use crate::util::rand::{FastRand, SlowRand};

/// RPC retransmission timeout in microseconds.
const RPC_RTO_US: u64 = 5_000;

/// Session-management request timeout in milliseconds.
const SM_TIMEOUT_MS: u64 = if cfg!(test) { 10 } else { 100 };

/// Session-management retransmissions before the operation is failed.
const SM_MAX_RETRIES: usize = 10;

/// Errors returned by session-setup APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("remote URI did not resolve")]
    InvalidUri,

    #[error("invalid session number")]
    InvalidSessionNum,

    #[error("session is not in the right state for this operation")]
    InvalidSessionState,

    #[error("session has RPCs in flight")]
    SessionBusy,

    #[error("no RX ring entries available for a new session")]
    NoRingEntries,

    #[error("session numbers exhausted")]
    TooManySessions,

    #[error("not called from the dispatch thread")]
    NotDispatchThread,
}

/// An entry waiting in the timing wheel: one packet of one RPC.
pub(crate) struct WheelEnt<Tp: UnreliableTransport> {
    pub sslot: *mut SSlot<Tp>,
    pub pkt_num: PktNum,
}

/// Fault-injection state, settable from the dispatch thread only.
pub(crate) struct Faults {
    /// Fail all routing-info resolution for incoming connect requests.
    pub fail_resolve_rinfo: bool,

    /// Probability of discarding an outgoing datapath packet.
    pub pkt_drop_prob: f64,

    /// Derived: drop iff `urand[0, 1e9)` is smaller than this.
    pub pkt_drop_thresh_billion: u32,

    /// Bypass the timing wheel regardless of congestion.
    pub hard_wheel_bypass: bool,
}

/// Packet-loss statistics. User-readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct PktLossStats {
    /// Total retransmissions across all sessions.
    pub num_re_tx: usize,

    /// Number of times a suspected-lost RPC could not be retransmitted
    /// because one of its packets was still queued in the timing wheel.
    pub still_in_wheel_during_retx: usize,
}

/// Datapath statistics. User-readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct DpathStats {
    pub ev_loop_calls: usize,
    pub pkts_tx: usize,
    pub tx_burst_calls: usize,
    pub pkts_rx: usize,
    pub rx_burst_calls: usize,
}

/// Interior-mutable state of an [`Rpc`] instance, owned exclusively by its
/// dispatch thread.
pub(crate) struct RpcInterior<Tp: UnreliableTransport> {
    /// The append-only session vector, indexed by session number.
    /// Disconnected sessions leave a `None` that is never reused.
    pub sessions: Vec<Option<Box<Session<Tp>>>>,

    /// The unreliable transport.
    pub tp: Tp,

    /// The timing-wheel rate limiter. Packets in the wheel have consumed
    /// credits, but not bumped the `num_tx` counter.
    pub wheel: crate::cc::timing_wheel::TimingWheel<WheelEnt<Tp>>,

    /// Scratch buffer for wheel reaping.
    pub wheel_ready: Vec<WheelEnt<Tp>>,

    /// Request sslots stalled for credits.
    pub stallq: VecDeque<*mut SSlot<Tp>>,

    /// The TX batch, flushed at `Tp::POSTLIST` entries or at loop epilogue.
    pub tx_burst_arr: Vec<TxItem<Tp>>,

    /// Permanent sentinels of the doubly-linked active-RPC list, so slot
    /// insertion and removal need no conditionals.
    pub active_rpcs_root_sentinel: Box<SSlot<Tp>>,
    pub active_rpcs_tail_sentinel: Box<SSlot<Tp>>,

    /// Buffers for control packets (CRs and RFRs), reused in a ring.
    pub ctrl_msgbufs: Vec<MsgBuf>,
    pub ctrl_msgbuf_head: usize,

    /// RX ring entries not yet claimed by a session.
    pub ring_entries_available: usize,

    pub fast_rand: FastRand,
    pub slow_rand: SlowRand,

    /// Maps connect-request tokens to allocated session numbers, collapsing
    /// retried connects onto the same session.
    pub conn_req_token_map: HashMap<u64, SessId, RandomState>,

    /// TSC taken at the start of each event-loop iteration.
    pub ev_loop_tsc: u64,

    /// Timestamp of the previous scan for lost packets.
    pub pkt_loss_scan_tsc: u64,

    pub faults: Faults,
    pub pkt_loss_stats: PktLossStats,
    pub dpath_stats: DpathStats,
}

impl<Tp: UnreliableTransport> RpcInterior<Tp> {
    /// Return true iff there are sufficient ring entries for a new session.
    #[inline]
    pub fn have_ring_entries(&self) -> bool {
        self.ring_entries_available >= SESSION_CREDITS
    }

    /// Claim ring entries for one session.
    #[inline]
    pub fn alloc_ring_entries(&mut self) {
        debug_assert!(self.have_ring_entries());
        self.ring_entries_available -= SESSION_CREDITS;
    }

    /// Return ring entries claimed by one session.
    #[inline]
    pub fn free_ring_entries(&mut self) {
        self.ring_entries_available += SESSION_CREDITS;
        debug_assert!(self.ring_entries_available <= Tp::NUM_RX_RING_ENTRIES);
    }

    /// Append a slot to the active-RPC list.
    pub fn add_to_active_rpc_list(&mut self, sslot: *mut SSlot<Tp>) {
        let tail: *mut SSlot<Tp> = &mut *self.active_rpcs_tail_sentinel;
        // SAFETY: list nodes are sentinel boxes or slots of boxed sessions,
        // all address-stable and owned by this dispatch thread.
        unsafe {
            let prev_tail = (*tail).client_info().prev;
            (*prev_tail).client_info_mut().next = sslot;
            (*sslot).client_info_mut().prev = prev_tail;
            (*sslot).client_info_mut().next = tail;
            (*tail).client_info_mut().prev = sslot;
        }
    }

    /// Unlink a slot from the active-RPC list. Branch-free thanks to the
    /// sentinels.
    pub fn delete_from_active_rpc_list(&mut self, sslot: *mut SSlot<Tp>) {
        // SAFETY: as above; the slot is linked.
        unsafe {
            let prev = (*sslot).client_info().prev;
            let next = (*sslot).client_info().next;
            (*prev).client_info_mut().next = next;
            (*next).client_info_mut().prev = prev;
        }
    }

    /// Remove every stall-queue entry belonging to the given session.
    pub fn purge_stallq(&mut self, sess: *const Session<Tp>) {
        self.stallq
            .retain(|&sslot| unsafe { (*sslot).session as *const _ } != sess);
    }
}

/// Wrapper making slot pointers queueable across threads.
pub(crate) struct SSlotPtr<Tp: UnreliableTransport>(pub *mut SSlot<Tp>);

unsafe impl<Tp: UnreliableTransport> Send for SSlotPtr<Tp> {}

/// Queues for datapath API calls issued from background threads, drained by
/// the dispatch thread every event-loop iteration.
pub(crate) struct BgQueues<Tp: UnreliableTransport> {
    pub enqueue_request: MtQueue<EnqReqArgs<Tp>>,
    pub enqueue_response: MtQueue<SSlotPtr<Tp>>,
    pub release_response: MtQueue<SSlotPtr<Tp>>,
}

/// An RPC endpoint: one polling event loop, pinned to the thread that
/// created it (its dispatch thread).
///
/// All datapath state is owned by the dispatch thread. The only methods
/// callable from other threads are `enqueue_request`, `enqueue_response`,
/// `release_response` (which detect the foreign thread and defer through
/// MPSC queues) and `alloc_msg_buffer`/`free_msg_buffer` (which take the
/// allocator lock).
pub struct Rpc<Tp: UnreliableTransport = crate::transport::UdpTransport> {
    /// ID of this endpoint, unique within its Nexus.
    id: RpcId,

    /// The Nexus this endpoint is bound to.
    nexus: Arc<Nexus<Tp>>,

    /// Endpoint thread ID of the dispatch thread.
    creator_etid: ETid,

    /// True iff background threads exist in this process.
    multi_threaded: bool,

    /// Shared TSC reader; TSC is the clock of record on the datapath.
    clock: Clock,
    freq_ghz: f64,
    creation_tsc: u64,

    /// RPC RTO in TSC cycles.
    rto_cycles: u64,

    /// Packet-loss scan period in TSC cycles.
    pkt_loss_scan_cycles: u64,

    /// Session-management timeout in TSC cycles.
    sm_timeout_cycles: u64,

    /// Handler table snapshot taken from the Nexus at construction.
    req_funcs: Box<[Option<ReqFunc<Tp>>]>,

    /// This endpoint's serialized transport endpoint, sent in SM packets.
    local_ep_blob: Vec<u8>,

    /// Socket for sending session-management packets.
    sm_tx: UdpSocket,

    /// Mailbox through which the Nexus delivers SM packets.
    hook: Arc<SmHook>,

    /// The application's session-management callback.
    sm_handler: RefCell<SmHandler>,

    /// Hugepage-backed message-buffer allocator, shared with background
    /// threads that call allocation helpers.
    allocator: Arc<BuddyAllocator>,

    /// Dispatch-thread-owned datapath state.
    state: RefCell<RpcInterior<Tp>>,

    /// Handoff queues fed by background threads.
    bg_queues: BgQueues<Tp>,
}

// `Rpc` is shared with background threads by reference. The `RefCell`'d
// interior is only ever touched after an `in_dispatch()` check proves the
// caller is the dispatch thread; every cross-thread entry point routes
// through `bg_queues` or the allocator lock instead.
unsafe impl<Tp: UnreliableTransport> Sync for Rpc<Tp> {}

impl<Tp: UnreliableTransport> Rpc<Tp> {
    /// Create a new `Rpc` endpoint bound to a [`Nexus`], pinned to the
    /// calling thread. The ID must be unique among the Nexus's endpoints.
    ///
    /// # Panics
    ///
    /// - Panic if the given ID is already used.
    /// - Panic if the transport cannot be brought up on `phy_port`.
    pub fn new(nexus: &Arc<Nexus<Tp>>, id: RpcId, sm_handler: SmHandler, phy_port: u8) -> Self {
        // Create the SM hook first: it panics if the ID is taken.
        let hook = nexus.register_hook(id);

        let creator_etid = nexus.tls_registry().init();
        let clock = nexus.clock().clone();
        let freq_ghz = nexus.freq_ghz();
        let creation_tsc = clock.raw();

        let tp = Tp::new(phy_port);
        let local_ep_blob =
            rmp_serde::to_vec(&tp.endpoint()).expect("failed to serialize local endpoint");
        let allocator = Arc::new(BuddyAllocator::new(nexus.numa_node(), tp.mem_registrar()));

        let ctrl_msgbufs = (0..2 * Tp::UNSIG_BATCH)
            .map(|_| {
                let buf = allocator
                    .alloc(mem::size_of::<PacketHeader>())
                    .expect("failed to allocate control buffers");
                MsgBuf::owned(buf, 0, Tp::MAX_DATA_PER_PKT)
            })
            .collect();

        // Wire up the active-RPC list sentinels.
        let mut root = Box::new(SSlot::<Tp>::sentinel());
        let mut tail = Box::new(SSlot::<Tp>::sentinel());
        root.client_info_mut().next = &mut *tail;
        tail.client_info_mut().prev = &mut *root;

        let us_to_cycles = |us: u64| (us as f64 * freq_ghz * 1000.0) as u64;
        let rto_cycles = us_to_cycles(RPC_RTO_US);

        Self {
            id,
            nexus: nexus.clone(),
            creator_etid,
            multi_threaded: nexus.num_bg_threads() > 0,
            clock,
            freq_ghz,
            creation_tsc,
            rto_cycles,
            pkt_loss_scan_cycles: rto_cycles / 10,
            sm_timeout_cycles: us_to_cycles(SM_TIMEOUT_MS * 1000),
            req_funcs: nexus.req_func_snapshot(),
            local_ep_blob,
            sm_tx: UdpSocket::bind("0.0.0.0:0").expect("failed to bind SM socket"),
            hook,
            sm_handler: RefCell::new(sm_handler),
            allocator,
            state: RefCell::new(RpcInterior {
                sessions: Vec::new(),
                tp,
                wheel: crate::cc::timing_wheel::TimingWheel::new(freq_ghz, creation_tsc),
                wheel_ready: Vec::new(),
                stallq: VecDeque::new(),
                tx_burst_arr: Vec::with_capacity(Tp::POSTLIST),
                active_rpcs_root_sentinel: root,
                active_rpcs_tail_sentinel: tail,
                ctrl_msgbufs,
                ctrl_msgbuf_head: 0,
                ring_entries_available: Tp::NUM_RX_RING_ENTRIES,
                fast_rand: FastRand::new(),
                slow_rand: SlowRand::new(),
                conn_req_token_map: HashMap::with_hasher(RandomState::new()),
                ev_loop_tsc: creation_tsc,
                pkt_loss_scan_tsc: creation_tsc,
                faults: Faults {
                    fail_resolve_rinfo: false,
                    pkt_drop_prob: 0.0,
                    pkt_drop_thresh_billion: 0,
                    hard_wheel_bypass: false,
                },
                pkt_loss_stats: PktLossStats::default(),
                dpath_stats: DpathStats::default(),
            }),
            bg_queues: BgQueues {
                enqueue_request: MtQueue::new(),
                enqueue_response: MtQueue::new(),
                release_response: MtQueue::new(),
            },
        }
    }

    /// Return the ID of this endpoint.
    #[inline(always)]
    pub fn id(&self) -> RpcId {
        self.id
    }

    /// Return true iff the caller is running on this endpoint's dispatch
    /// thread.
    #[inline]
    pub fn in_dispatch(&self) -> bool {
        self.nexus.tls_registry().etid() == Some(self.creator_etid)
    }

    /// Return true iff the caller is running in a background thread.
    #[inline]
    pub fn in_background(&self) -> bool {
        !self.in_dispatch()
    }

    #[inline]
    pub(crate) fn us_to_cycles(&self, us: u64) -> u64 {
        (us as f64 * self.freq_ghz * 1000.0) as u64
    }

    /// Seconds elapsed since this endpoint was created.
    pub fn sec_since_creation(&self) -> f64 {
        (self.clock.raw() - self.creation_tsc) as f64 / (self.freq_ghz * 1e9)
    }
}

// MsgBuffer management.
impl<Tp: UnreliableTransport> Rpc<Tp> {
    /// Allocate a message buffer that can hold `max_data_size` bytes of
    /// application data, surrounded by packet headers that the user must not
    /// modify. The returned buffer is invalid (`!is_valid()`) if the
    /// allocator is exhausted.
    pub fn alloc_msg_buffer(&self, max_data_size: usize) -> MsgBuf {
        let max_pkts = data_size_to_num_pkts(max_data_size, Tp::MAX_DATA_PER_PKT);
        let overall = mem::size_of::<PacketHeader>()
            + crate::util::math::roundup(max_data_size, 8)
            + (max_pkts - 1) * mem::size_of::<PacketHeader>();

        match self.allocator.alloc(overall) {
            Some(buf) => MsgBuf::owned(buf, max_data_size, Tp::MAX_DATA_PER_PKT),
            None => MsgBuf::invalid(),
        }
    }

    /// Resize a message buffer to a smaller size than its allocation,
    /// including zero. Does not modify packet headers.
    pub fn resize_msg_buffer(msg_buffer: &mut MsgBuf, new_data_size: usize) {
        msg_buffer.set_len(new_data_size);
    }

    /// Free a message buffer created by [`Rpc::alloc_msg_buffer`].
    pub fn free_msg_buffer(&self, msg_buffer: MsgBuf) {
        drop(msg_buffer);
    }

    /// The number of packets required for `data_size` bytes of data.
    #[inline]
    pub fn data_size_to_num_pkts(data_size: usize) -> usize {
        data_size_to_num_pkts(data_size, Tp::MAX_DATA_PER_PKT)
    }

    /// Maximum message data size supported by the allocator.
    pub fn max_msg_size() -> usize {
        let max = BuddyAllocator::MAX_ALLOC_SIZE;
        max - (max / Tp::MAX_DATA_PER_PKT + 1) * mem::size_of::<PacketHeader>()
    }

    /// Maximum data bytes in one packet.
    #[inline]
    pub fn max_data_per_pkt() -> usize {
        Tp::MAX_DATA_PER_PKT
    }
}

// The event loop.
impl<Tp: UnreliableTransport> Rpc<Tp> {
    /// Run the event loop for `timeout_ms` milliseconds.
    pub fn run_event_loop(&self, timeout_ms: u64) {
        let deadline = self.clock.raw() + self.us_to_cycles(timeout_ms * 1000);
        loop {
            self.run_event_loop_do_one_st();
            if self.clock.raw() >= deadline {
                break;
            }
        }
    }

    /// Run one iteration of the event loop.
    #[inline]
    pub fn run_event_loop_once(&self) {
        self.run_event_loop_do_one_st();
    }

    fn run_event_loop_do_one_st(&self) {
        debug_assert!(self.in_dispatch(), "event loop run from a foreign thread");

        {
            let state = &mut *self.state.borrow_mut();
            state.ev_loop_tsc = self.clock.raw();
            state.dpath_stats.ev_loop_calls += 1;
        }

        // Order matters: SM first (may connect sessions the datapath needs),
        // then RX, then the send-side queues, then one TX flush.
        if unlikely(!self.hook.is_empty()) {
            self.handle_sm_rx_st();
        }

        self.process_comps_st();
        self.process_credit_stall_queue_st();
        self.process_wheel_st();
        self.process_bg_queues_st();

        {
            let state = &mut *self.state.borrow_mut();
            if !state.tx_burst_arr.is_empty() {
                self.do_tx_burst_st(state);
            }
        }

        let scan_due = {
            let state = self.state.borrow();
            state.ev_loop_tsc.wrapping_sub(state.pkt_loss_scan_tsc) > self.pkt_loss_scan_cycles
        };
        if unlikely(scan_due) {
            self.pkt_loss_scan_st();
        }
    }
}

// The request/response API.
impl<Tp: UnreliableTransport> Rpc<Tp> {
    /// Enqueue a request for transmission on a connected session.
    ///
    /// The runtime owns `req_msgbuf` and `resp_msgbuf` until the
    /// continuation is invoked; the caller must keep both alive and
    /// unmodified. If no session slot is free, the request is queued
    /// transparently and sent when a slot opens up.
    ///
    /// `cont_etid` selects the background thread that runs the continuation;
    /// [`INVALID_BG_ETID`] runs it inline on the dispatch thread.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_request<F>(
        &self,
        sess_num: SessId,
        req_type: ReqType,
        req_msgbuf: &MsgBuf,
        resp_msgbuf: &mut MsgBuf,
        cont_func: F,
        tag: usize,
        cont_etid: ETid,
    ) where
        F: FnOnce(&Rpc<Tp>, RespHandle<Tp>, usize) + Send + 'static,
    {
        assert!(req_msgbuf.is_valid() && resp_msgbuf.is_valid());
        self.enqueue_request_boxed(EnqReqArgs {
            sess_num,
            req_type,
            req_msgbuf,
            resp_msgbuf,
            cont: Box::new(cont_func),
            tag,
            cont_etid,
        });
    }

    pub(crate) fn enqueue_request_boxed(&self, args: EnqReqArgs<Tp>) {
        // From a background thread, defer to the dispatch thread.
        if unlikely(!self.in_dispatch()) {
            self.bg_queues.enqueue_request.push(args);
            return;
        }

        let state = &mut *self.state.borrow_mut();
        let now = self.clock.raw();

        let sess = state.sessions[args.sess_num as usize]
            .as_mut()
            .expect("enqueue_request on a dead session");
        assert!(sess.is_client(), "enqueue_request on a server session");
        assert!(
            sess.is_connected(),
            "enqueue_request on a non-connected session"
        );

        let Some(sslot_idx) = sess.sslot_free_vec.pop() else {
            // All slots busy: defer until release_response frees one.
            sess.enq_req_backlog.push_back(args);
            return;
        };

        let remote_sess_num = sess.remote_sess_num;
        let remote_rpc_id = sess.remote_rpc_id;
        let credits_available = sess.credits > 0;
        let sslot: *mut SSlot<Tp> = &mut sess.slots[sslot_idx];

        // SAFETY: `sslot` points into the boxed session just looked up.
        let sslot_ref = unsafe { &mut *sslot };
        sslot_ref.cur_req_num += SESSION_CREDITS as ReqNum;
        sslot_ref.tx_msgbuf = args.req_msgbuf as *mut MsgBuf;
        let req_num = sslot_ref.cur_req_num;

        let ci = sslot_ref.client_info_mut();
        ci.num_tx = 0;
        ci.num_rx = 0;
        ci.req_msgbuf = args.req_msgbuf;
        ci.resp_msgbuf = args.resp_msgbuf;
        ci.cont = Some(args.cont);
        ci.tag = args.tag;
        ci.cont_etid = args.cont_etid;
        ci.progress_tsc = now;
        debug_assert_eq!(ci.wheel_count, 0);

        // Fill in every request packet's header; retransmissions reuse them.
        // SAFETY: the user's request buffer is valid for the RPC's lifetime.
        let req_msgbuf = unsafe { &*args.req_msgbuf };
        for i in 0..req_msgbuf.num_pkts() {
            unsafe {
                ptr::write(
                    req_msgbuf.pkt_hdr(i),
                    PacketHeader::new(
                        args.req_type,
                        req_msgbuf.len() as u32,
                        remote_sess_num,
                        crate::pkthdr::PktType::Req,
                        i as PktNum,
                        req_num,
                        self.id,
                        remote_rpc_id,
                    ),
                );
            }
        }

        state.add_to_active_rpc_list(sslot);

        if likely(credits_available) {
            self.kick_req_st(state, sslot, false);
        } else {
            state.stallq.push_back(sslot);
        }
    }

    /// Enqueue a response for transmission at the server. Consumes the
    /// request handle given to the request handler.
    pub fn enqueue_response(&self, req_handle: ReqHandle<Tp>) {
        if unlikely(!self.in_dispatch()) {
            self.bg_queues
                .enqueue_response
                .push(SSlotPtr(req_handle.sslot));
            return;
        }

        let state = &mut *self.state.borrow_mut();
        self.enqueue_response_st(state, req_handle.sslot);
    }

    /// From a continuation, release ownership of a response handle, freeing
    /// the session slot for the next request.
    pub fn release_response(&self, resp_handle: RespHandle<Tp>) {
        // When called from a background thread, hand over to dispatch to
        // avoid concurrent slot-free-vector mutation.
        if unlikely(!self.in_dispatch()) {
            self.bg_queues
                .release_response
                .push(SSlotPtr(resp_handle.sslot));
            return;
        }

        self.release_response_st(resp_handle.sslot);
    }

    pub(crate) fn release_response_st(&self, sslot: *mut SSlot<Tp>) {
        let backlogged = {
            // Hold the state borrow: the free vector and backlog are
            // dispatch-owned state even though they are reached through the
            // slot's session pointer.
            let _state = self.state.borrow_mut();

            // SAFETY: the slot stays valid until its session is destroyed,
            // which requires quiescence.
            let sslot_ref = unsafe { &mut *sslot };
            debug_assert!(sslot_ref.tx_msgbuf.is_null(), "response not yet received");

            let sess = unsafe { &mut *sslot_ref.session };
            debug_assert!(sess.is_client());
            sess.sslot_free_vec.push(sslot_ref.index);

            if likely(sess.enq_req_backlog.is_empty()) {
                None
            } else {
                // We just freed a slot, and it must be the only free one.
                debug_assert_eq!(sess.sslot_free_vec.len(), 1);
                sess.enq_req_backlog.pop_front()
            }
        };

        // Re-enqueue the backlog head outside the state borrow.
        if let Some(args) = backlogged {
            self.enqueue_request_boxed(args);
        }
    }
}

// Expert APIs.
impl<Tp: UnreliableTransport> Rpc<Tp> {
    /// Number of active (non-destroyed) sessions.
    pub fn num_active_sessions(&self) -> usize {
        let state = self.state.borrow();
        state.sessions.iter().filter(|s| s.is_some()).count()
    }

    /// Return true iff the given session is connected.
    pub fn is_connected(&self, sess_num: SessId) -> bool {
        let state = self.state.borrow();
        state
            .sessions
            .get(sess_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    /// Retransmission count of a connected session.
    pub fn get_num_re_tx(&self, sess_num: SessId) -> usize {
        let state = self.state.borrow();
        state.sessions[sess_num as usize].as_ref().unwrap().num_re_tx
    }

    /// Reset the retransmission count of a connected session.
    pub fn reset_num_re_tx(&self, sess_num: SessId) {
        let mut state = self.state.borrow_mut();
        state.sessions[sess_num as usize].as_mut().unwrap().num_re_tx = 0;
    }

    /// Available send credits of a connected client session.
    pub fn available_credits(&self, sess_num: SessId) -> usize {
        let state = self.state.borrow();
        state.sessions[sess_num as usize].as_ref().unwrap().credits
    }

    /// Physical link bandwidth, bytes per second.
    pub fn get_bandwidth(&self) -> usize {
        self.state.borrow().tp.bandwidth()
    }

    /// The Timely rate of a connected session, bytes per second.
    pub fn get_timely_rate(&self, sess_num: SessId) -> f64 {
        let state = self.state.borrow();
        state.sessions[sess_num as usize].as_ref().unwrap().cc.rate()
    }

    /// Force the Timely rate of a connected session. Expert use only.
    pub fn set_timely_rate(&self, sess_num: SessId, rate: f64) {
        let mut state = self.state.borrow_mut();
        state.sessions[sess_num as usize]
            .as_mut()
            .unwrap()
            .cc
            .set_rate(rate);
    }

    /// Number of entries currently queued in the timing wheel.
    pub fn wheel_len(&self) -> usize {
        self.state.borrow().wheel.len()
    }

    /// Packet-loss statistics.
    pub fn pkt_loss_stats(&self) -> PktLossStats {
        self.state.borrow().pkt_loss_stats
    }

    /// Datapath statistics.
    pub fn dpath_stats(&self) -> DpathStats {
        self.state.borrow().dpath_stats
    }

    /// Reset datapath statistics to zero.
    pub fn reset_dpath_stats(&self) {
        self.state.borrow_mut().dpath_stats = DpathStats::default();
    }

    /// Average packets received per `rx_burst` call, or -1 if none.
    pub fn get_avg_rx_batch(&self) -> f64 {
        let stats = self.state.borrow().dpath_stats;
        if stats.rx_burst_calls == 0 {
            return -1.0;
        }
        stats.pkts_rx as f64 / stats.rx_burst_calls as f64
    }

    /// Average packets sent per `tx_burst` call, or -1 if none.
    pub fn get_avg_tx_batch(&self) -> f64 {
        let stats = self.state.borrow().dpath_stats;
        if stats.tx_burst_calls == 0 {
            return -1.0;
        }
        stats.pkts_tx as f64 / stats.tx_burst_calls as f64
    }

    /// TSC frequency in GHz, as measured by the Nexus.
    #[inline]
    pub fn get_freq_ghz(&self) -> f64 {
        self.freq_ghz
    }
}

// Fault injection.
impl<Tp: UnreliableTransport> Rpc<Tp> {
    fn fault_inject_check_ok(&self) {
        assert!(
            self.in_dispatch(),
            "faults can only be injected from the dispatch thread"
        );
    }

    /// Fail all routing-info resolution for incoming connect requests.
    ///
    /// # Panics
    ///
    /// Panic if not called from the dispatch thread.
    pub fn fault_inject_fail_resolve_rinfo_st(&self) {
        self.fault_inject_check_ok();
        self.state.borrow_mut().faults.fail_resolve_rinfo = true;
    }

    /// Set the probability of dropping an outgoing datapath packet.
    ///
    /// # Panics
    ///
    /// Panic if not called from the dispatch thread, or if the probability
    /// is out of `[0, 1)`.
    pub fn fault_inject_set_pkt_drop_prob_st(&self, pkt_drop_prob: f64) {
        self.fault_inject_check_ok();
        assert!((0.0..1.0).contains(&pkt_drop_prob));
        let mut state = self.state.borrow_mut();
        state.faults.pkt_drop_prob = pkt_drop_prob;
        state.faults.pkt_drop_thresh_billion = (pkt_drop_prob * 1_000_000_000.0) as u32;
    }

    /// Bypass the timing wheel unconditionally. Testing only.
    ///
    /// # Panics
    ///
    /// Panic if not called from the dispatch thread.
    pub fn fault_inject_hard_wheel_bypass_st(&self, enable: bool) {
        self.fault_inject_check_ok();
        self.state.borrow_mut().faults.hard_wheel_bypass = enable;
    }
}

impl<Tp: UnreliableTransport> Drop for Rpc<Tp> {
    fn drop(&mut self) {
        // Outstanding TX must not reference freed sessions.
        {
            let state = &mut *self.state.borrow_mut();
            self.drain_tx_batch_and_dma_queue_st(state);
        }
        self.nexus.destroy_hook(self.id);
    }
}

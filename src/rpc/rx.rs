//! The RX pipeline: burst receive, packet classification, and the per-slot
//! state machines for requests, responses, credit returns, and RFRs.

use std::ptr::{self, NonNull};

use super::tx::{resp_ntoi, wire_pkts};
use super::{PktLossStats, RpcInterior};
use crate::handler::{ReqFunc, ReqHandle, RespHandle};
use crate::msgbuf::MsgBuf;
use crate::nexus::{BgWorkItem, BgWorkItemKind};
use crate::pkthdr::{PacketHeader, PktType};
use crate::rpc::Rpc;
use crate::session::{SSlot, Session, SESSION_CREDITS};
use crate::transport::UnreliableTransport;
use crate::type_alias::*;
use crate::util::likely::*;

/// A user callback that became runnable while the datapath state was
/// borrowed; invoked once the borrow is released.
pub(crate) enum Completion<Tp: UnreliableTransport> {
    /// Run a foreground request handler.
    ReqHandler {
        sslot: *mut SSlot<Tp>,
        func: ReqFunc<Tp>,
    },

    /// Run a continuation inline on the dispatch thread.
    Continuation { sslot: *mut SSlot<Tp> },
}

impl<Tp: UnreliableTransport> Rpc<Tp> {
    /// Drain the receive ring and drive the slot state machines. Ring
    /// buffers are released back to the transport only after every handler
    /// that may alias them has run.
    pub(crate) fn process_comps_st(&self) {
        let mut completions: Vec<Completion<Tp>> = Vec::new();
        let mut rx_items: Vec<MsgBuf> = Vec::new();

        {
            let state = &mut *self.state.borrow_mut();
            state.dpath_stats.rx_burst_calls += 1;

            let n = state.tp.rx_burst();
            if n == 0 {
                return;
            }
            state.dpath_stats.pkts_rx += n;
            let rx_tsc = self.clock.raw();

            for _ in 0..n {
                let item = state.tp.rx_next().expect("failed to fetch received packet");
                self.process_one_pkt_st(state, &item, rx_tsc, &mut completions);
                rx_items.push(item);
            }
        }

        // Run handlers and continuations without holding the state borrow;
        // they may re-enter the datapath API.
        for completion in completions {
            self.run_completion(completion);
        }

        // Now the ring entries can be recycled.
        let state = &mut *self.state.borrow_mut();
        // SAFETY: fetched from `rx_next` above, released exactly once.
        unsafe { state.tp.rx_release(&rx_items) };
    }

    /// Classify one received packet and dispatch it.
    fn process_one_pkt_st(
        &self,
        state: &mut RpcInterior<Tp>,
        item: &MsgBuf,
        rx_tsc: u64,
        completions: &mut Vec<Completion<Tp>>,
    ) {
        // SAFETY: the ring guarantees a header-sized prefix.
        let hdr = unsafe { &mut *item.pkt_hdr(0) };
        if unlikely(!hdr.check_magic()) {
            log::debug!("Rpc {}: dropping packet with bad magic", self.id());
            return;
        }

        // Session-management payloads bypass the session state machines.
        if unlikely(hdr.pkt_type() == PktType::Sm) {
            self.process_sm_on_datapath(hdr, item);
            return;
        }

        let sess_num = hdr.dst_sess_id();
        let Some(Some(sess)) = state.sessions.get_mut(sess_num as usize) else {
            log::warn!(
                "Rpc {}: dropping packet for non-existent session {}",
                self.id(),
                sess_num
            );
            return;
        };
        if unlikely(!sess.is_connected()) {
            log::warn!(
                "Rpc {}: dropping packet for non-connected session {}",
                self.id(),
                sess_num
            );
            return;
        }

        let is_client = sess.is_client();
        let sslot_idx = (hdr.req_num() % SESSION_CREDITS as ReqNum) as usize;
        let sslot: *mut SSlot<Tp> = &mut sess.slots[sslot_idx];

        match hdr.pkt_type() {
            PktType::Req if !is_client => {
                if likely(hdr.msg_size() as usize <= Tp::MAX_DATA_PER_PKT) {
                    self.process_small_req_st(state, sslot, hdr, completions);
                } else {
                    self.process_large_req_one_st(state, sslot, hdr, completions);
                }
            }
            PktType::Resp if is_client => {
                self.process_resp_one_st(state, sslot, hdr, rx_tsc, completions)
            }
            PktType::ExplCR if is_client => self.process_expl_cr_st(state, sslot, hdr, rx_tsc),
            PktType::Rfr if !is_client => self.process_rfr_st(state, sslot, hdr),
            other => {
                log::warn!(
                    "Rpc {}: dropping {:?} packet on wrong-role session {}",
                    self.id(),
                    other,
                    sess_num
                );
            }
        }
    }

    /// Session-management payloads occasionally arrive on the datapath;
    /// hand them to the SM subsystem via the hook.
    fn process_sm_on_datapath(&self, hdr: &PacketHeader, item: &MsgBuf) {
        let payload = unsafe {
            std::slice::from_raw_parts(item.as_ptr(), (hdr.msg_size() as usize).min(item.len()))
        };
        match rmp_serde::from_slice(payload) {
            Ok(pkt) => self.hook.push(pkt),
            Err(_) => log::debug!("Rpc {}: malformed SM payload on datapath", self.id()),
        }
    }

    /// Return true iff a packet received by a client is in order.
    /// This must be only a few instructions.
    fn in_order_client(
        stats: &mut PktLossStats,
        sslot: &SSlot<Tp>,
        hdr: &PacketHeader,
    ) -> bool {
        // Counters in the header are valid only if request numbers match.
        if unlikely(hdr.req_num() != sslot.cur_req_num) {
            return false;
        }

        let ci = sslot.client_info();
        if unlikely((hdr.pkt_num() as usize) != ci.num_rx) {
            return false;
        }

        // Ignore spurious packets received as a consequence of rollback:
        // we have only sent packets up to num_tx - 1, and a still-wheeled
        // copy means this arrival races a pending retransmission.
        if unlikely((hdr.pkt_num() as usize) >= ci.num_tx) {
            return false;
        }
        if unlikely(ci.in_wheel[hdr.pkt_num() as usize % SESSION_CREDITS]) {
            stats.still_in_wheel_during_retx += 1;
            return false;
        }

        true
    }

    /// Copy one packet's payload into a message buffer at a packet index.
    #[inline]
    fn copy_data_to_msgbuf(msgbuf: &mut MsgBuf, pkt_idx: usize, hdr: &PacketHeader) {
        let offset = pkt_idx * Tp::MAX_DATA_PER_PKT;
        let to_copy = Tp::MAX_DATA_PER_PKT.min(hdr.msg_size() as usize - offset);
        // SAFETY: the destination was sized from msg_size; the source is the
        // packet payload right after the header.
        unsafe {
            ptr::copy_nonoverlapping(
                (hdr as *const PacketHeader).add(1) as *const u8,
                msgbuf.as_ptr().add(offset),
                to_copy,
            );
        }
    }

    /// Process a single-packet incoming request.
    fn process_small_req_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        hdr: &mut PacketHeader,
        completions: &mut Vec<Completion<Tp>>,
    ) {
        // SAFETY: the slot belongs to the session just looked up.
        let sslot_ref = unsafe { &mut *sslot };
        let req_num = hdr.req_num();

        if unlikely(req_num < sslot_ref.cur_req_num) {
            log::trace!("Rpc {}: dropping stale request {}", self.id(), req_num);
            return;
        }
        if unlikely(req_num == sslot_ref.cur_req_num) {
            // Client retransmission. If the response went out, resend it
            // without re-invoking the handler; otherwise the handler is
            // still running and the retransmission can be ignored.
            if !sslot_ref.tx_msgbuf.is_null() {
                self.enqueue_pkt_tx_burst_st(state, sslot, 0, ptr::null_mut());
            }
            return;
        }

        // A new request; the previous one on this slot is fully retired.
        Self::bury_resp_msgbuf_server(sslot_ref);
        Self::bury_req_msgbuf_server(sslot_ref);
        sslot_ref.cur_req_num = req_num;

        let req_type = hdr.req_type();
        let si = sslot_ref.server_info_mut();
        si.req_type = req_type;
        si.sav_num_req_pkts = 1;
        si.num_rx = 1;

        let Some(req_func) = self.req_funcs[req_type as usize].clone() else {
            log::warn!(
                "Rpc {}: received request for unknown request type {}",
                self.id(),
                req_type
            );
            return;
        };

        if unlikely(req_func.is_background()) {
            // The handler outlives this event-loop iteration: copy the
            // request out of the RX ring first.
            let mut req_msgbuf = self.alloc_msg_buffer(hdr.msg_size() as usize);
            assert!(req_msgbuf.is_valid(), "out of memory for request copy");
            // SAFETY: source is the packet payload; destination was just
            // allocated with msg_size capacity.
            unsafe {
                ptr::copy_nonoverlapping(
                    (hdr as *const PacketHeader).add(1) as *const u8,
                    req_msgbuf.as_ptr(),
                    hdr.msg_size() as usize,
                );
            }
            req_msgbuf.set_len(hdr.msg_size() as usize);
            si.req_msgbuf = req_msgbuf;
            self.submit_background_st(state, sslot, BgWorkItemKind::Request(req_func));
        } else {
            // Zero-copy: alias the RX-ring bytes for the handler's duration.
            si.req_msgbuf = unsafe {
                MsgBuf::borrowed(
                    NonNull::new_unchecked(hdr as *mut PacketHeader as *mut u8),
                    hdr.msg_size() as usize,
                    0,
                )
            };
            completions.push(Completion::ReqHandler {
                sslot,
                func: req_func,
            });
        }
    }

    /// Process one packet of a multi-packet request.
    fn process_large_req_one_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        hdr: &mut PacketHeader,
        completions: &mut Vec<Completion<Tp>>,
    ) {
        // SAFETY: as in `process_small_req_st`.
        let sslot_ref = unsafe { &mut *sslot };
        let req_num = hdr.req_num();
        let pkt_num = hdr.pkt_num() as usize;

        if unlikely(req_num < sslot_ref.cur_req_num) {
            log::trace!("Rpc {}: dropping stale request pkt {}", self.id(), req_num);
            return;
        }

        if req_num == sslot_ref.cur_req_num {
            let (num_rx, sav_num_req_pkts) = {
                let si = sslot_ref.server_info();
                (si.num_rx, si.sav_num_req_pkts)
            };

            if unlikely(pkt_num < num_rx) {
                // Duplicate after client retransmission: re-ack so the
                // client makes progress, idempotently.
                if pkt_num != sav_num_req_pkts - 1 {
                    self.enqueue_cr_st(state, sslot, hdr);
                } else if !sslot_ref.tx_msgbuf.is_null() {
                    self.enqueue_pkt_tx_burst_st(state, sslot, 0, ptr::null_mut());
                }
                return;
            }
            if unlikely(pkt_num != num_rx || num_rx >= sav_num_req_pkts) {
                // Out-of-order future packet, or a data packet after the
                // request completed (only RFRs are expected then).
                return;
            }

            // The expected next packet.
            let si = sslot_ref.server_info_mut();
            Self::copy_data_to_msgbuf(&mut si.req_msgbuf, pkt_num, hdr);
            si.num_rx += 1;

            if pkt_num != sav_num_req_pkts - 1 {
                self.enqueue_cr_st(state, sslot, hdr);
            } else {
                self.invoke_req_handler_st(state, sslot, completions);
            }
            return;
        }

        // A new multi-packet request must start with packet 0; later packets
        // of a not-yet-seen request are reordered and dropped.
        if unlikely(pkt_num != 0) {
            return;
        }
        let msg_size = hdr.msg_size() as usize;
        if unlikely(msg_size > Self::max_msg_size()) {
            log::warn!("Rpc {}: dropping oversized request", self.id());
            return;
        }

        Self::bury_resp_msgbuf_server(sslot_ref);
        Self::bury_req_msgbuf_server(sslot_ref);
        sslot_ref.cur_req_num = req_num;

        let req_type = hdr.req_type();
        let si = sslot_ref.server_info_mut();
        si.req_type = req_type;
        si.sav_num_req_pkts = Self::data_size_to_num_pkts(msg_size);
        si.num_rx = 1;

        let mut req_msgbuf = self.alloc_msg_buffer(msg_size);
        assert!(req_msgbuf.is_valid(), "out of memory for request reassembly");
        req_msgbuf.set_len(msg_size);
        si.req_msgbuf = req_msgbuf;
        Self::copy_data_to_msgbuf(&mut si.req_msgbuf, 0, hdr);

        self.enqueue_cr_st(state, sslot, hdr);
    }

    /// The request is fully reassembled: run its handler inline or hand it
    /// to a background thread.
    fn invoke_req_handler_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        completions: &mut Vec<Completion<Tp>>,
    ) {
        // SAFETY: as in `process_small_req_st`.
        let req_type = unsafe { (*sslot).server_info().req_type };
        let Some(req_func) = self.req_funcs[req_type as usize].clone() else {
            log::warn!(
                "Rpc {}: received request for unknown request type {}",
                self.id(),
                req_type
            );
            return;
        };

        if unlikely(req_func.is_background()) {
            self.submit_background_st(state, sslot, BgWorkItemKind::Request(req_func));
        } else {
            completions.push(Completion::ReqHandler {
                sslot,
                func: req_func,
            });
        }
    }

    /// Process a single response packet.
    fn process_resp_one_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        hdr: &PacketHeader,
        rx_tsc: u64,
        completions: &mut Vec<Completion<Tp>>,
    ) {
        // SAFETY: as in `process_small_req_st`.
        let sslot_ref = unsafe { &mut *sslot };
        if unlikely(!Self::in_order_client(&mut state.pkt_loss_stats, sslot_ref, hdr)) {
            log::trace!(
                "Rpc {}: dropping out-of-order response pkt {} of req {}",
                self.id(),
                hdr.pkt_num(),
                hdr.req_num()
            );
            return;
        }

        let sess = unsafe { &mut *sslot_ref.session };
        sess.credits += 1;
        debug_assert!(sess.credits <= SESSION_CREDITS);

        let pkt_num = hdr.pkt_num() as usize;
        let ci = sslot_ref.client_info_mut();
        ci.num_rx += 1;
        ci.progress_tsc = state.ev_loop_tsc;
        sess.cc
            .update_rate(rx_tsc.wrapping_sub(ci.tx_ts[pkt_num % SESSION_CREDITS]));

        // SAFETY: the user's buffers live until the continuation runs.
        let num_req_pkts = unsafe { (*ci.req_msgbuf).num_pkts() };
        let resp_msgbuf = unsafe { &mut *ci.resp_msgbuf };

        if pkt_num == num_req_pkts - 1 {
            // First response packet: it announces the response size.
            let msg_size = hdr.msg_size() as usize;
            assert!(
                msg_size <= resp_msgbuf.capacity(),
                "response ({} B) does not fit the response buffer ({} B)",
                msg_size,
                resp_msgbuf.capacity()
            );
            resp_msgbuf.set_len(msg_size);
        }

        Self::copy_data_to_msgbuf(resp_msgbuf, resp_ntoi(pkt_num, num_req_pkts), hdr);

        if ci.num_rx == wire_pkts(num_req_pkts, resp_msgbuf.num_pkts()) {
            // The RPC is complete.
            state.delete_from_active_rpc_list(sslot);
            sslot_ref.tx_msgbuf = ptr::null_mut();

            let cont_etid = sslot_ref.client_info().cont_etid;
            if likely(cont_etid == INVALID_BG_ETID) {
                completions.push(Completion::Continuation { sslot });
            } else {
                self.submit_background_st(state, sslot, BgWorkItemKind::Response);
            }
        } else {
            self.kick_rfr_st(state, sslot, false);
        }
    }

    /// Process an explicit credit return.
    fn process_expl_cr_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        hdr: &PacketHeader,
        rx_tsc: u64,
    ) {
        // SAFETY: as in `process_small_req_st`.
        let sslot_ref = unsafe { &mut *sslot };
        if unlikely(!Self::in_order_client(&mut state.pkt_loss_stats, sslot_ref, hdr)) {
            log::trace!(
                "Rpc {}: dropping out-of-order CR pkt {} of req {}",
                self.id(),
                hdr.pkt_num(),
                hdr.req_num()
            );
            return;
        }

        let sess = unsafe { &mut *sslot_ref.session };
        sess.credits += 1;
        debug_assert!(sess.credits <= SESSION_CREDITS);

        let ci = sslot_ref.client_info_mut();
        ci.num_rx += 1;
        ci.progress_tsc = state.ev_loop_tsc;
        sess.cc
            .update_rate(rx_tsc.wrapping_sub(ci.tx_ts[hdr.pkt_num() as usize % SESSION_CREDITS]));

        if Self::req_pkts_pending(sslot_ref) {
            self.kick_req_st(state, sslot, false);
        }
    }

    /// Process a request-for-response: (re)send the solicited response
    /// packet. Duplicates are answered idempotently.
    fn process_rfr_st(&self, state: &mut RpcInterior<Tp>, sslot: *mut SSlot<Tp>, hdr: &PacketHeader) {
        // SAFETY: as in `process_small_req_st`.
        let sslot_ref = unsafe { &mut *sslot };
        if unlikely(hdr.req_num() != sslot_ref.cur_req_num) {
            return;
        }
        if unlikely(sslot_ref.tx_msgbuf.is_null()) {
            // The response is not ready; a spurious RFR after rollback.
            return;
        }

        let pkt_num = hdr.pkt_num() as usize;
        let (num_rx, sav_num_req_pkts) = {
            let si = sslot_ref.server_info();
            (si.num_rx, si.sav_num_req_pkts)
        };
        // SAFETY: tx_msgbuf checked non-null above.
        let num_resp_pkts = unsafe { (*sslot_ref.tx_msgbuf).num_pkts() };

        if unlikely(pkt_num < sav_num_req_pkts || pkt_num >= sav_num_req_pkts + num_resp_pkts - 1) {
            return;
        }
        let resp_pkt_idx = resp_ntoi(pkt_num, sav_num_req_pkts);

        if pkt_num == num_rx {
            sslot_ref.server_info_mut().num_rx += 1;
            self.enqueue_pkt_tx_burst_st(state, sslot, resp_pkt_idx, ptr::null_mut());
        } else if pkt_num < num_rx {
            // Duplicate RFR after client retransmission.
            self.enqueue_pkt_tx_burst_st(state, sslot, resp_pkt_idx, ptr::null_mut());
        }
        // Future RFRs are reordered and dropped.
    }

    /// Submit a work item to a background thread. Request handlers go to a
    /// random worker; continuations go to the thread the user chose.
    pub(crate) fn submit_background_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        kind: BgWorkItemKind<Tp>,
    ) {
        debug_assert!(self.multi_threaded, "no background threads exist");
        let bg_etid = match &kind {
            BgWorkItemKind::Request(_) => {
                state.fast_rand.next_u32() as usize % self.nexus.num_bg_threads()
            }
            // SAFETY: as in `process_small_req_st`.
            BgWorkItemKind::Response => unsafe { (*sslot).client_info().cont_etid },
        };
        debug_assert!(bg_etid < self.nexus.num_bg_threads());

        self.nexus.submit_bg(
            bg_etid,
            BgWorkItem {
                kind,
                rpc: self,
                sslot,
            },
        );
    }

    /// Run a deferred user callback. No datapath borrow may be held.
    pub(crate) fn run_completion(&self, completion: Completion<Tp>) {
        match completion {
            Completion::ReqHandler { sslot, func } => {
                (func.func)(self, ReqHandle::new(sslot));
            }
            Completion::Continuation { sslot } => {
                // SAFETY: the slot is idle between completion and release.
                let sslot_ref = unsafe { &mut *sslot };
                let ci = sslot_ref.client_info_mut();
                let cont = ci.cont.take().expect("continuation already taken");
                let tag = ci.tag;
                cont(self, RespHandle::new(sslot), tag);
            }
        }
    }

    /// Bury a server slot's response buffer: dynamic responses return to
    /// the allocator, the preallocated one stays.
    pub(crate) fn bury_resp_msgbuf_server(sslot: &mut SSlot<Tp>) {
        sslot.tx_msgbuf = ptr::null_mut();
        sslot.server_info_mut().dyn_resp_msgbuf = MsgBuf::invalid();
    }

    /// Bury a server slot's request buffer.
    pub(crate) fn bury_req_msgbuf_server(sslot: &mut SSlot<Tp>) {
        sslot.server_info_mut().req_msgbuf = MsgBuf::invalid();
    }

    /// Enqueue a response for transmission: install the response buffer,
    /// write its packet headers, and send the first response packet. The
    /// rest are pulled by RFRs.
    pub(crate) fn enqueue_response_st(&self, state: &mut RpcInterior<Tp>, sslot: *mut SSlot<Tp>) {
        // SAFETY: as in `process_small_req_st`.
        let sslot_ref = unsafe { &mut *sslot };
        let sess: &mut Session<Tp> = unsafe { &mut *sslot_ref.session };
        debug_assert!(!sess.is_client());

        if unlikely(!sess.is_connected()) {
            // The session died while the handler ran; drop the response.
            Self::bury_req_msgbuf_server(sslot_ref);
            return;
        }

        Self::bury_req_msgbuf_server(sslot_ref);

        let req_num = sslot_ref.cur_req_num;
        let remote_sess_num = sess.remote_sess_num;
        let remote_rpc_id = sess.remote_rpc_id;
        let prealloc_used = !sslot_ref.server_info().dyn_resp_msgbuf.is_valid();
        sslot_ref.prealloc_used = prealloc_used;

        let si = sslot_ref.server_info_mut();
        let sav_num_req_pkts = si.sav_num_req_pkts;
        let req_type = si.req_type;
        let resp_msgbuf: *mut MsgBuf = if prealloc_used {
            &mut si.pre_resp_msgbuf
        } else {
            &mut si.dyn_resp_msgbuf
        };

        // Response packet i occupies wire number (num_req_pkts - 1) + i.
        // SAFETY: the response buffer is slot-owned and address-stable.
        let resp_ref = unsafe { &*resp_msgbuf };
        for i in 0..resp_ref.num_pkts() {
            unsafe {
                ptr::write(
                    resp_ref.pkt_hdr(i),
                    PacketHeader::new(
                        req_type,
                        resp_ref.len() as u32,
                        remote_sess_num,
                        PktType::Resp,
                        (sav_num_req_pkts - 1 + i) as PktNum,
                        req_num,
                        self.id(),
                        remote_rpc_id,
                    ),
                );
            }
        }

        sslot_ref.tx_msgbuf = resp_msgbuf;
        self.enqueue_pkt_tx_burst_st(state, sslot, 0, ptr::null_mut());
    }
}

//! TX batching, credit-consuming kicks, and timing-wheel insertion.

use std::ptr;

use super::{RpcInterior, WheelEnt};
use crate::pkthdr::{PacketHeader, PktType};
use crate::rpc::Rpc;
use crate::session::{SSlot, SESSION_CREDITS};
use crate::transport::{TxItem, UnreliableTransport};
use crate::type_alias::*;
use crate::util::likely::*;

/// Convert a response packet's wire number to its index in the response
/// message buffer.
#[inline(always)]
pub(crate) fn resp_ntoi(pkt_num: usize, num_req_pkts: usize) -> usize {
    pkt_num - (num_req_pkts - 1)
}

/// Total wire packets of one RPC: request packets plus response packets,
/// minus the overlap of the last request packet's slot with the first
/// response packet.
#[inline(always)]
pub(crate) fn wire_pkts(num_req_pkts: usize, num_resp_pkts: usize) -> usize {
    num_req_pkts + num_resp_pkts - 1
}

impl<Tp: UnreliableTransport> Rpc<Tp> {
    /// Return true iff a packet should be dropped (fault injection).
    #[inline]
    pub(crate) fn roll_pkt_drop(state: &mut RpcInterior<Tp>) -> bool {
        const BILLION: u32 = 1_000_000_000;
        state.faults.pkt_drop_thresh_billion != 0
            && (state.fast_rand.next_u32() % BILLION) < state.faults.pkt_drop_thresh_billion
    }

    /// Return true iff this request sslot needs to send more request packets.
    #[inline]
    pub(crate) fn req_pkts_pending(sslot: &SSlot<Tp>) -> bool {
        let ci = sslot.client_info();
        // SAFETY: the request buffer lives until the continuation runs.
        let num_req_pkts = unsafe { (*ci.req_msgbuf).num_pkts() };
        ci.num_tx + ci.wheel_count < num_req_pkts
    }

    /// Return true iff it is currently OK to bypass the wheel for this slot.
    /// Bypass conserves the rate budget: it requires that no other packet of
    /// this slot waits in the wheel and that the session is uncongested.
    #[inline]
    pub(crate) fn can_bypass_wheel(state: &RpcInterior<Tp>, sslot: &SSlot<Tp>) -> bool {
        if state.faults.hard_wheel_bypass {
            return true;
        }
        // SAFETY: the slot's session outlives it.
        let sess = unsafe { &*sslot.session };
        sslot.client_info().wheel_count == 0 && sess.cc.is_uncongested()
    }

    /// Enqueue a data packet from the sslot's `tx_msgbuf` for TX burst.
    /// `pkt_idx` is the index of the packet in the message buffer, not its
    /// wire number.
    pub(crate) fn enqueue_pkt_tx_burst_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        pkt_idx: usize,
        tx_ts: *mut u64,
    ) {
        debug_assert!(self.in_dispatch());
        // SAFETY: slots and their sessions are address-stable and alive.
        let sslot_ref = unsafe { &*sslot };
        let sess = unsafe { &*sslot_ref.session };
        debug_assert!(!sslot_ref.tx_msgbuf.is_null());

        let drop = Self::roll_pkt_drop(state);
        log::trace!(
            "Rpc {}, lsn {}: TX data pkt_idx {} of req {}.{}",
            self.id(),
            sess.local_sess_num,
            pkt_idx,
            sslot_ref.cur_req_num,
            if drop { " Drop." } else { "" }
        );

        state.tx_burst_arr.push(TxItem {
            peer: sess.peer.as_ref().unwrap(),
            msgbuf: sslot_ref.tx_msgbuf,
            pkt_idx,
            tx_ts,
            drop,
        });
        if state.tx_burst_arr.len() == Tp::POSTLIST {
            self.do_tx_burst_st(state);
        }
    }

    /// Enqueue a control packet (CR or RFR) for TX burst. Control buffers
    /// come from a ring that is safe to reuse after `2 * UNSIG_BATCH`
    /// enqueues.
    fn enqueue_ctrl_tx_burst_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        hdr: PacketHeader,
        tx_ts: *mut u64,
    ) {
        debug_assert!(self.in_dispatch());
        let head = state.ctrl_msgbuf_head;
        state.ctrl_msgbuf_head = (head + 1) % state.ctrl_msgbufs.len();

        let ctrl_msgbuf: *const crate::msgbuf::MsgBuf = &state.ctrl_msgbufs[head];
        // SAFETY: the zeroth header slot of an owned MsgBuf.
        unsafe { ptr::write(state.ctrl_msgbufs[head].pkt_hdr(0), hdr) };

        // SAFETY: as in `enqueue_pkt_tx_burst_st`.
        let sess = unsafe { &*(*sslot).session };
        let drop = Self::roll_pkt_drop(state);
        log::trace!(
            "Rpc {}, lsn {}: TX {:?} pkt_num {} req {}.{}",
            self.id(),
            sess.local_sess_num,
            hdr.pkt_type(),
            hdr.pkt_num(),
            hdr.req_num(),
            if drop { " Drop." } else { "" }
        );

        state.tx_burst_arr.push(TxItem {
            peer: sess.peer.as_ref().unwrap(),
            msgbuf: ctrl_msgbuf,
            pkt_idx: 0,
            tx_ts,
            drop,
        });
        if state.tx_burst_arr.len() == Tp::POSTLIST {
            self.do_tx_burst_st(state);
        }
    }

    /// Enqueue an explicit credit return for a received request packet.
    /// The CR mirrors the request packet's wire number.
    pub(crate) fn enqueue_cr_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        req_pkthdr: &PacketHeader,
    ) {
        // SAFETY: as in `enqueue_pkt_tx_burst_st`.
        let sess = unsafe { &*(*sslot).session };
        let hdr = PacketHeader::new(
            req_pkthdr.req_type(),
            0,
            sess.remote_sess_num,
            PktType::ExplCR,
            req_pkthdr.pkt_num(),
            req_pkthdr.req_num(),
            self.id(),
            sess.remote_rpc_id,
        );
        self.enqueue_ctrl_tx_burst_st(state, sslot, hdr, ptr::null_mut());
    }

    /// Enqueue a request-for-response with the given wire number.
    /// This modifies neither credits nor `num_tx`; the kick does.
    pub(crate) fn enqueue_rfr_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        pkt_num: PktNum,
        tx_ts: *mut u64,
    ) {
        // SAFETY: as in `enqueue_pkt_tx_burst_st`.
        let sslot_ref = unsafe { &*sslot };
        let sess = unsafe { &*sslot_ref.session };
        let ci = sslot_ref.client_info();
        // SAFETY: the request buffer lives until the continuation runs.
        let req_type = unsafe { (*(*ci.req_msgbuf).pkt_hdr(0)).req_type() };

        let hdr = PacketHeader::new(
            req_type,
            0,
            sess.remote_sess_num,
            PktType::Rfr,
            pkt_num,
            sslot_ref.cur_req_num,
            self.id(),
            sess.remote_rpc_id,
        );
        self.enqueue_ctrl_tx_burst_st(state, sslot, hdr, tx_ts);
    }

    /// Send request packets for a slot that has credits and request packets
    /// to send. Packets go to the TX batch or the timing wheel; credits are
    /// consumed either way. `force_bypass` is used by retransmission, which
    /// must not wait behind the pacer.
    pub(crate) fn kick_req_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        force_bypass: bool,
    ) {
        // SAFETY: as in `enqueue_pkt_tx_burst_st`.
        let sslot_ref = unsafe { &mut *sslot };
        let bypass = force_bypass || Self::can_bypass_wheel(state, sslot_ref);
        let num_req_pkts = unsafe { (*sslot_ref.client_info().req_msgbuf).num_pkts() };

        loop {
            let sess = unsafe { &mut *sslot_ref.session };
            let ci = sslot_ref.client_info_mut();
            let scheduled = ci.num_tx + ci.wheel_count;
            if scheduled >= num_req_pkts || sess.credits == 0 {
                break;
            }
            sess.credits -= 1;

            let tx_ts: *mut u64 = &mut ci.tx_ts[scheduled % SESSION_CREDITS];
            if likely(bypass) {
                ci.num_tx += 1;
                self.enqueue_pkt_tx_burst_st(state, sslot, scheduled, tx_ts);
            } else {
                let pkt_size = unsafe { (*ci.req_msgbuf).pkt_size(scheduled) };
                let ref_tsc = self.clock.raw();
                let desired_tx_tsc = sess.cc.desired_tx_tsc(ref_tsc, pkt_size);

                ci.in_wheel[scheduled % SESSION_CREDITS] = true;
                ci.wheel_count += 1;
                state.wheel.insert(
                    WheelEnt {
                        sslot,
                        pkt_num: scheduled as PktNum,
                    },
                    ref_tsc,
                    desired_tx_tsc,
                );
                log::trace!(
                    "Rpc {}: REQ pkt {} of req {} wheeled",
                    self.id(),
                    scheduled,
                    sslot_ref.cur_req_num
                );
            }
        }
    }

    /// Send RFRs for a slot that has credits and response packets left to
    /// pull. Symmetric to `kick_req_st`.
    pub(crate) fn kick_rfr_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sslot: *mut SSlot<Tp>,
        force_bypass: bool,
    ) {
        // SAFETY: as in `enqueue_pkt_tx_burst_st`.
        let sslot_ref = unsafe { &mut *sslot };
        let bypass = force_bypass || Self::can_bypass_wheel(state, sslot_ref);
        let (num_req_pkts, num_resp_pkts) = {
            let ci = sslot_ref.client_info();
            unsafe { ((*ci.req_msgbuf).num_pkts(), (*ci.resp_msgbuf).num_pkts()) }
        };
        let wire_total = wire_pkts(num_req_pkts, num_resp_pkts);

        loop {
            let sess = unsafe { &mut *sslot_ref.session };
            let ci = sslot_ref.client_info_mut();
            let scheduled = ci.num_tx + ci.wheel_count;
            if scheduled >= wire_total || sess.credits == 0 {
                break;
            }
            sess.credits -= 1;

            let tx_ts: *mut u64 = &mut ci.tx_ts[scheduled % SESSION_CREDITS];
            if likely(bypass) {
                ci.num_tx += 1;
                self.enqueue_rfr_st(state, sslot, scheduled as PktNum, tx_ts);
            } else {
                // Pace by the size of the solicited response packet.
                let resp_pkt_idx = resp_ntoi(scheduled, num_req_pkts);
                let pkt_size = unsafe { (*ci.resp_msgbuf).pkt_size(resp_pkt_idx) };
                let ref_tsc = self.clock.raw();
                let desired_tx_tsc = sess.cc.desired_tx_tsc(ref_tsc, pkt_size);

                ci.in_wheel[scheduled % SESSION_CREDITS] = true;
                ci.wheel_count += 1;
                state.wheel.insert(
                    WheelEnt {
                        sslot,
                        pkt_num: scheduled as PktNum,
                    },
                    ref_tsc,
                    desired_tx_tsc,
                );
                log::trace!(
                    "Rpc {}: RFR pkt {} of req {} wheeled",
                    self.id(),
                    scheduled,
                    sslot_ref.cur_req_num
                );
            }
        }
    }

    /// Transmit the packets in the TX batch.
    pub(crate) fn do_tx_burst_st(&self, state: &mut RpcInterior<Tp>) {
        debug_assert!(self.in_dispatch());
        debug_assert!(!state.tx_burst_arr.is_empty());

        state.dpath_stats.tx_burst_calls += 1;
        state.dpath_stats.pkts_tx += state.tx_burst_arr.len();

        // One TSC read per batch serves every RTT measurement in it.
        let batch_tsc = self.clock.raw();
        for item in &state.tx_burst_arr {
            if !item.tx_ts.is_null() {
                // SAFETY: points into a live slot's timestamp ring.
                unsafe { *item.tx_ts = batch_tsc };
            }
        }

        // SAFETY: every item references live peers and message buffers.
        unsafe { state.tp.tx_burst(&state.tx_burst_arr) };
        state.tx_burst_arr.clear();
    }

    /// Complete transmission of the TX batch and the transport's DMA queue.
    /// Used before any action that must observe TX completion.
    pub(crate) fn drain_tx_batch_and_dma_queue_st(&self, state: &mut RpcInterior<Tp>) {
        if !state.tx_burst_arr.is_empty() {
            self.do_tx_burst_st(state);
        }
        state.tp.tx_flush();
    }
}

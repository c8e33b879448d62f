//! Event-loop queue handlers: the credit stall queue, the timing wheel, and
//! the background-thread handoff queues.

use std::mem;

use crate::rpc::Rpc;
use crate::session::SESSION_CREDITS;
use crate::transport::UnreliableTransport;

impl<Tp: UnreliableTransport> Rpc<Tp> {
    /// Retry senders that stalled for credits, round-robin.
    pub(crate) fn process_credit_stall_queue_st(&self) {
        let state = &mut *self.state.borrow_mut();
        let n = state.stallq.len();
        for _ in 0..n {
            let sslot = state.stallq.pop_front().unwrap();
            // SAFETY: stalled slots are purged before their session dies.
            let has_credits = unsafe { (*(*sslot).session).credits > 0 };
            if has_credits {
                self.kick_req_st(state, sslot, false);
            } else {
                state.stallq.push_back(sslot);
            }
        }
    }

    /// Move due wheel entries into the TX batch. Wheel entries have already
    /// consumed credits; `num_tx` is bumped here, on emission.
    pub(crate) fn process_wheel_st(&self) {
        let state = &mut *self.state.borrow_mut();
        if state.wheel.len() == 0 {
            return;
        }

        let now = state.ev_loop_tsc;
        let mut ready = mem::take(&mut state.wheel_ready);
        state.wheel.reap(now, &mut ready);

        for ent in ready.drain(..) {
            let sslot = ent.sslot;
            let pkt_num = ent.pkt_num as usize;

            // SAFETY: a session with wheeled packets cannot be destroyed.
            let sslot_ref = unsafe { &mut *sslot };
            let ci = sslot_ref.client_info_mut();
            debug_assert!(ci.in_wheel[pkt_num % SESSION_CREDITS]);
            debug_assert_eq!(pkt_num, ci.num_tx);
            ci.in_wheel[pkt_num % SESSION_CREDITS] = false;
            ci.wheel_count -= 1;
            ci.num_tx += 1;

            let tx_ts: *mut u64 = &mut ci.tx_ts[pkt_num % SESSION_CREDITS];
            let num_req_pkts = unsafe { (*ci.req_msgbuf).num_pkts() };

            if pkt_num < num_req_pkts {
                self.enqueue_pkt_tx_burst_st(state, sslot, pkt_num, tx_ts);
            } else {
                self.enqueue_rfr_st(state, sslot, ent.pkt_num, tx_ts);
            }
        }
        state.wheel_ready = ready;
    }

    /// Drain the three queues fed by background threads. Each drained call
    /// re-enters the corresponding dispatch-side entry point.
    pub(crate) fn process_bg_queues_st(&self) {
        if self.bg_queues.enqueue_request.size() > 0 {
            for args in self.bg_queues.enqueue_request.drain() {
                self.enqueue_request_boxed(args);
            }
        }

        if self.bg_queues.enqueue_response.size() > 0 {
            for sslot in self.bg_queues.enqueue_response.drain() {
                let state = &mut *self.state.borrow_mut();
                self.enqueue_response_st(state, sslot.0);
            }
        }

        if self.bg_queues.release_response.size() > 0 {
            for sslot in self.bg_queues.release_response.drain() {
                self.release_response_st(sslot.0);
            }
        }
    }
}

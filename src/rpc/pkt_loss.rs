//! Packet-loss detection and recovery: the periodic scan over active RPCs,
//! rollback-aware retransmission, and session-management retransmission.

use super::{RpcInterior, SM_MAX_RETRIES};
use crate::nexus::{SmErr, SmEventKind};
use crate::rpc::Rpc;
use crate::session::{SessionState, SSlot};
use crate::transport::UnreliableTransport;
use crate::type_alias::*;

impl<Tp: UnreliableTransport> Rpc<Tp> {
    /// Scan active RPCs and pending session-management requests for losses.
    pub(crate) fn pkt_loss_scan_st(&self) {
        let mut sm_events: Vec<(SessId, SmEventKind)> = Vec::new();

        {
            let state = &mut *self.state.borrow_mut();
            state.pkt_loss_scan_tsc = state.ev_loop_tsc;

            // Datapath: walk the active-RPC list. Retransmission does not
            // unlink, so a plain traversal is safe.
            let root: *mut SSlot<Tp> = &mut *state.active_rpcs_root_sentinel;
            let tail: *mut SSlot<Tp> = &mut *state.active_rpcs_tail_sentinel;
            // SAFETY: list nodes are address-stable; see RpcInterior.
            let mut cur = unsafe { (*root).client_info().next };
            while cur != tail {
                let next = unsafe { (*cur).client_info().next };
                let stale = state
                    .ev_loop_tsc
                    .saturating_sub(unsafe { (*cur).client_info().progress_tsc })
                    > self.rto_cycles;
                if stale {
                    self.pkt_loss_retransmit_st(state, cur);
                }
                cur = next;
            }

            // Control plane: retransmit or fail timed-out SM requests.
            self.sm_timeout_scan_st(state, &mut sm_events);
        }

        let mut sm_handler = self.sm_handler.borrow_mut();
        for (sess_num, event) in sm_events {
            (*sm_handler)(sess_num, event);
        }
    }

    /// Retransmit packets for an sslot for which we suspect a packet loss.
    ///
    /// Rollback sets `num_tx := num_rx` and refunds the credits of unacked
    /// packets. Packets still queued in the timing wheel will be sent by the
    /// wheel; resending them here would corrupt the wire sequence, so the
    /// retransmission is deferred to a later scan and counted.
    pub(crate) fn pkt_loss_retransmit_st(&self, state: &mut RpcInterior<Tp>, sslot: *mut SSlot<Tp>) {
        // SAFETY: active slots belong to live sessions.
        let sslot_ref = unsafe { &mut *sslot };
        let sess = unsafe { &mut *sslot_ref.session };
        let cur_req_num = sslot_ref.cur_req_num;
        let ci = sslot_ref.client_info_mut();

        if ci.wheel_count > 0 {
            state.pkt_loss_stats.still_in_wheel_during_retx += 1;
            return;
        }

        let delta = ci.num_tx - ci.num_rx;
        if delta == 0 {
            // Nothing sent and unacked; the slot is waiting in the stall
            // queue for credits.
            ci.progress_tsc = state.ev_loop_tsc;
            return;
        }

        log::debug!(
            "Rpc {}, lsn {}: retransmitting req {}, rolling back num_tx {} -> {}",
            self.id(),
            sess.local_sess_num,
            cur_req_num,
            ci.num_rx + delta,
            ci.num_rx
        );

        sess.credits += delta;
        ci.num_tx = ci.num_rx;
        ci.progress_tsc = state.ev_loop_tsc;
        sess.num_re_tx += 1;
        state.pkt_loss_stats.num_re_tx += 1;

        // Retransmissions skip the pacer.
        if Self::req_pkts_pending(sslot_ref) {
            self.kick_req_st(state, sslot, true);
        } else {
            self.kick_rfr_st(state, sslot, true);
        }
    }

    /// Retransmit pending session-management requests whose response is
    /// overdue; fail the session after `SM_MAX_RETRIES`.
    fn sm_timeout_scan_st(
        &self,
        state: &mut RpcInterior<Tp>,
        sm_events: &mut Vec<(SessId, SmEventKind)>,
    ) {
        let mut to_bury: Vec<(SessId, SmEventKind)> = Vec::new();

        let ev_loop_tsc = state.ev_loop_tsc;
        for sess_num in 0..state.sessions.len() {
            let Some(sess) = state.sessions[sess_num].as_mut() else {
                continue;
            };
            if !sess.sm_req_pending
                || ev_loop_tsc.saturating_sub(sess.sm_req_tsc) <= self.sm_timeout_cycles
            {
                continue;
            }

            if sess.sm_retries < SM_MAX_RETRIES {
                sess.sm_retries += 1;
                sess.sm_req_tsc = ev_loop_tsc;
                self.send_sm_req_st(sess);
                continue;
            }

            // Retries exhausted: fail the operation.
            match sess.state {
                SessionState::ConnectInProgress => {
                    to_bury.push((
                        sess_num as SessId,
                        SmEventKind::ConnectFailed(SmErr::SmTimeout),
                    ));
                }
                SessionState::DisconnectInProgress => {
                    // The server is unresponsive: fall back to an abortive
                    // reset, best-effort notifying the peer.
                    sess.state = SessionState::ResetInProgress;
                    self.send_sm_req_st(sess);
                    to_bury.push((sess_num as SessId, SmEventKind::ResetComplete));
                }
                other => {
                    log::error!(
                        "Rpc {}: SM timeout in unexpected session state {:?}",
                        self.id(),
                        other
                    );
                    sess.sm_req_pending = false;
                }
            }
        }

        for (sess_num, event) in to_bury {
            self.bury_session_st(state, sess_num);
            sm_events.push((sess_num, event));
        }
    }
}

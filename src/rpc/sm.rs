//! The session-management side of the endpoint: session creation and
//! teardown, and the handlers for SM packets delivered through the hook.
//! Each SM packet type is routed to its own handler.

use std::net::{SocketAddr, ToSocketAddrs};

use super::{Error, RpcInterior};
use crate::cc::timely::Timely;
use crate::nexus::{SmErr, SmEventKind, SmPkt, SmPktKind};
use crate::rpc::Rpc;
use crate::session::{Session, SessionState, SESSION_CREDITS};
use crate::transport::UnreliableTransport;
use crate::type_alias::*;

impl<Tp: UnreliableTransport> Rpc<Tp> {
    /// Create a client session to the remote endpoint and send the connect
    /// request. On success, the application's SM handler later receives
    /// either `Connected` or `ConnectFailed` for the returned session
    /// number. Callable only from the dispatch thread.
    pub fn create_session(
        &self,
        remote_uri: impl ToSocketAddrs,
        remote_rpc_id: RpcId,
    ) -> Result<SessId, Error> {
        if !self.in_dispatch() {
            return Err(Error::NotDispatchThread);
        }
        let remote_uri = remote_uri
            .to_socket_addrs()
            .map_err(|_| Error::InvalidUri)?
            .next()
            .ok_or(Error::InvalidUri)?;

        let state = &mut *self.state.borrow_mut();
        if !state.have_ring_entries() {
            return Err(Error::NoRingEntries);
        }
        if state.sessions.len() > SessId::MAX as usize {
            return Err(Error::TooManySessions);
        }

        let sess_num = state.sessions.len() as SessId;
        let token = state.slow_rand.next_u64();
        let cc = Timely::new(self.freq_ghz, state.tp.bandwidth());
        let mut sess = Box::new(Session::<Tp>::new_client(
            sess_num,
            remote_rpc_id,
            remote_uri,
            token,
            cc,
        ));

        // Fix up the slots' back-pointers now that the session is boxed.
        let sess_ptr: *mut Session<Tp> = &mut *sess;
        for slot in sess.slots.iter_mut() {
            slot.session = sess_ptr;
        }

        state.alloc_ring_entries();
        sess.sm_req_pending = true;
        sess.sm_req_tsc = self.clock.raw();
        self.send_sm_req_st(&sess);
        state.sessions.push(Some(sess));

        log::debug!(
            "Rpc {}: created session {} to {} (Rpc {})",
            self.id(),
            sess_num,
            remote_uri,
            remote_rpc_id
        );
        Ok(sess_num)
    }

    /// Disconnect and destroy a connected client session with no RPCs in
    /// flight. The SM handler receives `Disconnected` once the server
    /// acknowledges, or `ResetComplete` if it never does. Callable only
    /// from the dispatch thread.
    pub fn destroy_session(&self, sess_num: SessId) -> Result<(), Error> {
        if !self.in_dispatch() {
            return Err(Error::NotDispatchThread);
        }

        let state = &mut *self.state.borrow_mut();
        {
            let sess = state
                .sessions
                .get(sess_num as usize)
                .and_then(|s| s.as_ref())
                .ok_or(Error::InvalidSessionNum)?;
            if !sess.is_client() || sess.state != SessionState::Connected {
                return Err(Error::InvalidSessionState);
            }
            if !sess.is_quiescent() {
                return Err(Error::SessionBusy);
            }
        }

        // Nothing of this session may linger in the NIC queues once it is
        // torn down.
        self.drain_tx_batch_and_dma_queue_st(state);

        let sess = state.sessions[sess_num as usize].as_mut().unwrap();
        sess.state = SessionState::DisconnectInProgress;
        sess.sm_req_pending = true;
        sess.sm_req_tsc = self.clock.raw();
        sess.sm_retries = 0;
        self.send_sm_req_st(sess);
        Ok(())
    }

    /// Process all session-management packets deposited into the hook.
    pub(crate) fn handle_sm_rx_st(&self) {
        let pkts = self.hook.drain();
        let mut sm_events: Vec<(SessId, SmEventKind)> = Vec::new();

        {
            let state = &mut *self.state.borrow_mut();
            for pkt in pkts {
                log::trace!("Rpc {}: received SM packet {:?}", self.id(), pkt);
                match pkt.kind {
                    SmPktKind::ConnectReq => self.handle_connect_req_st(state, &pkt),
                    SmPktKind::ConnectResp => {
                        self.handle_connect_resp_st(state, &pkt, &mut sm_events)
                    }
                    SmPktKind::DisconnectReq => {
                        self.handle_disconnect_req_st(state, &pkt, &mut sm_events)
                    }
                    SmPktKind::DisconnectResp => {
                        self.handle_disconnect_resp_st(state, &pkt, &mut sm_events)
                    }
                    SmPktKind::Reset => self.handle_reset_st(state, &pkt, &mut sm_events),
                }
            }
        }

        let mut sm_handler = self.sm_handler.borrow_mut();
        for (sess_num, event) in sm_events {
            (*sm_handler)(sess_num, event);
        }
    }

    /// Handle a connect request at the server. Duplicate requests (same
    /// token) collapse onto the already-allocated session.
    fn handle_connect_req_st(&self, state: &mut RpcInterior<Tp>, pkt: &SmPkt) {
        if pkt.svr_rpc_id != self.id() {
            self.send_sm_pkt(&self.connect_resp(pkt, SmErr::InvalidRemoteRpcId, 0), pkt.cli_uri);
            return;
        }

        // A retried connect request must map to the same session.
        if let Some(&existing) = state.conn_req_token_map.get(&pkt.token) {
            log::debug!(
                "Rpc {}: duplicate connect request (token {:#x}), reusing session {}",
                self.id(),
                pkt.token,
                existing
            );
            self.send_sm_pkt(&self.connect_resp(pkt, SmErr::NoError, existing), pkt.cli_uri);
            return;
        }

        if !state.have_ring_entries() || state.sessions.len() > SessId::MAX as usize {
            self.send_sm_pkt(&self.connect_resp(pkt, SmErr::NoRingEntries, 0), pkt.cli_uri);
            return;
        }

        let peer = if state.faults.fail_resolve_rinfo {
            None
        } else {
            rmp_serde::from_slice::<Tp::Endpoint>(&pkt.ep)
                .ok()
                .and_then(|ep| state.tp.resolve_peer(ep))
        };
        let Some(peer) = peer else {
            log::warn!(
                "Rpc {}: failed to resolve routing info of connect request from {}",
                self.id(),
                pkt.cli_uri
            );
            self.send_sm_pkt(
                &self.connect_resp(pkt, SmErr::RoutingResolutionFailure, 0),
                pkt.cli_uri,
            );
            return;
        };

        let sess_num = state.sessions.len() as SessId;
        let pre_resp_msgbufs = (0..SESSION_CREDITS)
            .map(|_| {
                let buf = self.alloc_msg_buffer(Tp::MAX_DATA_PER_PKT);
                assert!(buf.is_valid(), "out of memory for response buffers");
                buf
            })
            .collect();
        let cc = Timely::new(self.freq_ghz, state.tp.bandwidth());
        let mut sess = Box::new(Session::<Tp>::new_server(
            sess_num,
            pkt.cli_sess_num,
            pkt.cli_rpc_id,
            pkt.cli_uri,
            peer,
            pre_resp_msgbufs,
            cc,
        ));
        let sess_ptr: *mut Session<Tp> = &mut *sess;
        for slot in sess.slots.iter_mut() {
            slot.session = sess_ptr;
        }

        state.alloc_ring_entries();
        state.sessions.push(Some(sess));
        state.conn_req_token_map.insert(pkt.token, sess_num);

        log::debug!(
            "Rpc {}: accepted session {} from {} (Rpc {})",
            self.id(),
            sess_num,
            pkt.cli_uri,
            pkt.cli_rpc_id
        );
        self.send_sm_pkt(&self.connect_resp(pkt, SmErr::NoError, sess_num), pkt.cli_uri);
    }

    /// Handle a connect response at the client.
    fn handle_connect_resp_st(
        &self,
        state: &mut RpcInterior<Tp>,
        pkt: &SmPkt,
        sm_events: &mut Vec<(SessId, SmEventKind)>,
    ) {
        let sess_num = pkt.cli_sess_num;
        let Some(Some(sess)) = state.sessions.get_mut(sess_num as usize) else {
            log::warn!(
                "Rpc {}: ignoring ConnectResp for non-existent session {}",
                self.id(),
                sess_num
            );
            return;
        };
        if sess.state != SessionState::ConnectInProgress || sess.conn_token != pkt.token {
            // Duplicate or late response.
            return;
        }

        if pkt.err != SmErr::NoError {
            log::warn!(
                "Rpc {}: session {} refused by remote peer: {}",
                self.id(),
                sess_num,
                pkt.err
            );
            let err = pkt.err;
            self.bury_session_st(state, sess_num);
            sm_events.push((sess_num, SmEventKind::ConnectFailed(err)));
            return;
        }

        // A decode failure here means a severe control-plane problem or a
        // peer bug; fail the session rather than ignore it.
        let peer = rmp_serde::from_slice::<Tp::Endpoint>(&pkt.ep)
            .ok()
            .and_then(|ep| state.tp.resolve_peer(ep));
        let Some(peer) = peer else {
            log::error!(
                "Rpc {}: invalid server endpoint in ConnectResp for session {}",
                self.id(),
                sess_num
            );
            self.bury_session_st(state, sess_num);
            sm_events.push((
                sess_num,
                SmEventKind::ConnectFailed(SmErr::RoutingResolutionFailure),
            ));
            return;
        };

        let sess = state.sessions[sess_num as usize].as_mut().unwrap();
        sess.remote_sess_num = pkt.svr_sess_num;
        sess.peer = Some(peer);
        sess.state = SessionState::Connected;
        sess.sm_req_pending = false;
        sm_events.push((sess_num, SmEventKind::Connected));
    }

    /// Handle a disconnect request at the server. The reply is sent even if
    /// the session is already gone, so client retries converge.
    fn handle_disconnect_req_st(
        &self,
        state: &mut RpcInterior<Tp>,
        pkt: &SmPkt,
        sm_events: &mut Vec<(SessId, SmEventKind)>,
    ) {
        let sess_num = pkt.svr_sess_num;
        let matches = state
            .sessions
            .get(sess_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| {
                !s.is_client()
                    && s.remote_rpc_id == pkt.cli_rpc_id
                    && s.remote_sess_num == pkt.cli_sess_num
            })
            .unwrap_or(false);

        if matches {
            self.bury_session_st(state, sess_num);
            sm_events.push((sess_num, SmEventKind::Disconnected));
        }

        let mut resp = pkt.clone();
        resp.kind = SmPktKind::DisconnectResp;
        resp.err = SmErr::NoError;
        resp.ep = self.local_ep_blob.clone();
        self.send_sm_pkt(&resp, pkt.cli_uri);
    }

    /// Handle a disconnect response at the client.
    fn handle_disconnect_resp_st(
        &self,
        state: &mut RpcInterior<Tp>,
        pkt: &SmPkt,
        sm_events: &mut Vec<(SessId, SmEventKind)>,
    ) {
        let sess_num = pkt.cli_sess_num;
        let in_disconnect = state
            .sessions
            .get(sess_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.state == SessionState::DisconnectInProgress)
            .unwrap_or(false);
        if !in_disconnect {
            return;
        }

        self.bury_session_st(state, sess_num);
        sm_events.push((sess_num, SmEventKind::Disconnected));
    }

    /// Handle an abortive reset at the server: tear the session down
    /// without a reply.
    fn handle_reset_st(
        &self,
        state: &mut RpcInterior<Tp>,
        pkt: &SmPkt,
        sm_events: &mut Vec<(SessId, SmEventKind)>,
    ) {
        let sess_num = pkt.svr_sess_num;
        let matches = state
            .sessions
            .get(sess_num as usize)
            .and_then(|s| s.as_ref())
            .map(|s| !s.is_client() && s.remote_rpc_id == pkt.cli_rpc_id)
            .unwrap_or(false);
        if !matches {
            return;
        }

        log::warn!("Rpc {}: session {} reset by remote peer", self.id(), sess_num);
        self.bury_session_st(state, sess_num);
        sm_events.push((sess_num, SmEventKind::Reset));
    }

    /// Send the session-management request matching the session's state.
    /// Also used for retransmission from the packet-loss scan.
    pub(crate) fn send_sm_req_st(&self, sess: &Session<Tp>) {
        let kind = match sess.state {
            SessionState::ConnectInProgress => SmPktKind::ConnectReq,
            SessionState::DisconnectInProgress => SmPktKind::DisconnectReq,
            SessionState::ResetInProgress => SmPktKind::Reset,
            other => unreachable!("no SM request for session state {:?}", other),
        };
        let pkt = SmPkt {
            kind,
            err: SmErr::NoError,
            token: sess.conn_token,
            cli_rpc_id: self.id(),
            svr_rpc_id: sess.remote_rpc_id,
            cli_sess_num: sess.local_sess_num,
            svr_sess_num: sess.remote_sess_num,
            cli_uri: self.nexus.uri(),
            ep: self.local_ep_blob.clone(),
        };
        self.send_sm_pkt(&pkt, sess.remote_uri);
    }

    /// Build a connect response echoing the request's identifiers.
    fn connect_resp(&self, req: &SmPkt, err: SmErr, svr_sess_num: SessId) -> SmPkt {
        SmPkt {
            kind: SmPktKind::ConnectResp,
            err,
            token: req.token,
            cli_rpc_id: req.cli_rpc_id,
            svr_rpc_id: self.id(),
            cli_sess_num: req.cli_sess_num,
            svr_sess_num,
            cli_uri: req.cli_uri,
            ep: self.local_ep_blob.clone(),
        }
    }

    /// Serialize and transmit one SM packet over UDP.
    fn send_sm_pkt(&self, pkt: &SmPkt, dest: SocketAddr) {
        let buf = rmp_serde::to_vec(pkt).expect("failed to serialize SM packet");
        // UDP loss here is recovered by the SM retransmission scan.
        if let Err(e) = self.sm_tx.send_to(&buf, dest) {
            log::debug!("Rpc {}: SM TX to {} failed: {}", self.id(), dest, e);
        }
    }

    /// Free a session's resources and null its slot in the session vector.
    /// The session must be quiescent: nothing on the wire, in the wheel, or
    /// on a background thread may reference it.
    pub(crate) fn bury_session_st(&self, state: &mut RpcInterior<Tp>, sess_num: SessId) {
        let sess = state.sessions[sess_num as usize]
            .take()
            .expect("burying a dead session");
        state.purge_stallq(&*sess as *const Session<Tp>);
        state.free_ring_entries();
        log::debug!("Rpc {}: buried session {}", self.id(), sess_num);
    }
}

//! Priority-ordered inbound-frame dispatch.
//!
//! Grounded on the fan-in router discipline of the astrid gateway's
//! `run_inbound_router`/`forward_inbound`: one function per frame kind,
//! never a lock held across an `.await`, and each branch either resolves
//! a pending future, forwards a frame, or logs-and-discards.
//!
//! Registration (priority 1 in the design notes) is handled once, at
//! connection setup, by the WebSocket loop in `gateway::ws` — by the
//! time a frame reaches [`Dispatcher::route`] the peer's role is already
//! fixed, so only priorities 2–7 live here.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::correlator::{RequestCorrelator, RouteTarget};
use crate::http::sse::SessionManager;
use crate::peer::{PeerRole, PeerTable};
use crate::protocol::{classify, Frame, FrameKind};
use crate::session::SessionRegistry;

pub struct Dispatcher {
    pub peers: Arc<PeerTable>,
    pub sessions: Arc<SessionRegistry>,
    pub correlator: Arc<RequestCorrelator>,
    pub driver_streams: Arc<SessionManager>,
    pub instance_id: String,
}

impl Dispatcher {
    pub fn new(
        peers: Arc<PeerTable>,
        sessions: Arc<SessionRegistry>,
        correlator: Arc<RequestCorrelator>,
        driver_streams: Arc<SessionManager>,
        instance_id: String,
    ) -> Self {
        Self { peers, sessions, correlator, driver_streams, instance_id }
    }

    /// Route one inbound frame arriving from peer `from`.
    pub async fn route(&self, from: &PeerRole, frame: Frame) {
        self.peers.touch(from).await;
        match classify(&frame) {
            FrameKind::RegisterController
            | FrameKind::RegisterPageAgent { .. }
            | FrameKind::RegisterPeerBridge { .. } => {
                debug!(?from, "ignoring re-registration on an already-registered socket");
            }
            FrameKind::Response => self.handle_response(frame).await,
            FrameKind::HealthCheck => { /* lastSeen already touched above */ }
            FrameKind::Ping => self.handle_ping(from, frame).await,
            FrameKind::Pong => {}
            FrameKind::DialogOpened
            | FrameKind::TabAdded
            | FrameKind::ActiveTabChanged
            | FrameKind::NavigationCompleted => self.forward_session_event(frame).await,
            FrameKind::WindowClosed => self.handle_window_closed(frame).await,
            FrameKind::ControllerCommand(_) | FrameKind::UnrecognizedCommand => {
                self.handle_command_forward(from, frame).await
            }
            FrameKind::RouteToSession => self.handle_route_to_session(from, frame).await,
            FrameKind::Other => debug!(kind = %frame.kind, "dispatcher: unrecognized frame, discarding"),
        }
    }

    async fn handle_response(&self, frame: Frame) {
        if let Some(target) = frame.mcp_instance_id.clone() {
            if target != self.instance_id {
                if self.peers.send_to_peer_bridge(&target, frame).await.is_err() {
                    warn!(instance_id = %target, "response targeted an unreachable peer-bridge");
                }
                return;
            }
        }
        let Some(request_id) = frame.request_id.clone() else {
            debug!("response frame missing requestId, discarding");
            return;
        };
        self.correlator.resolve(&request_id, frame).await;
    }

    async fn handle_ping(&self, from: &PeerRole, frame: Frame) {
        let pong = Frame { kind: "pong".into(), request_id: frame.request_id, ..Default::default() };
        let send_result = match from {
            PeerRole::Controller => self.peers.send_to_controller(pong).await,
            PeerRole::PageAgent(sid) => self.peers.send_to_page_agent(sid, pong).await,
            PeerRole::PeerBridge(id) => self.peers.send_to_peer_bridge(id, pong).await,
        };
        if send_result.is_err() {
            warn!(?from, "failed to answer ping, outbound queue unavailable");
        }
    }

    /// Forward a controller-originated, session-scoped event (dialog,
    /// tab-added, active-tab-changed, navigation-completed) to the driver
    /// that owns `sessionId` — strict ownership, not "last driver to call
    /// a tool".
    async fn forward_session_event(&self, frame: Frame) {
        let Some(session_id) = frame.session_id.clone() else {
            debug!(kind = %frame.kind, "session event missing sessionId, discarding");
            return;
        };
        match self.sessions.transport_for_session(&session_id).await {
            Some(transport_id) => {
                let payload = serde_json::to_string(&frame).unwrap_or_default();
                if !self.driver_streams.send_to(&transport_id, &payload).await {
                    debug!(%transport_id, kind = %frame.kind, "no driver stream open for event");
                }
            }
            None => debug!(%session_id, kind = %frame.kind, "event for a session with no owning driver"),
        }
    }

    /// The controller reports a window closed: forward the event, then
    /// drop the session — it no longer exists on the controller side.
    async fn handle_window_closed(&self, frame: Frame) {
        let session_id = frame.session_id.clone();
        self.forward_session_event(frame).await;
        if let Some(session_id) = session_id {
            self.sessions.drop_session(&session_id).await;
            debug!(%session_id, "session dropped: controller reported window closed");
        }
    }

    /// `*_command` frames arriving from a peer-bridge are forwarded to
    /// the controller verbatim; the controller's eventual `response`
    /// frame carries the same `mcpInstanceId` back to the right bridge.
    async fn handle_command_forward(&self, from: &PeerRole, frame: Frame) {
        match from {
            PeerRole::PeerBridge(_) => {
                if self.peers.send_to_controller(frame).await.is_err() {
                    warn!("no controller connected to forward command to");
                }
            }
            _ => debug!(kind = %frame.kind, ?from, "command frame from unexpected peer, discarding"),
        }
    }

    /// Routed request targeting a specific automation session's page
    /// agent, arriving from a peer-bridge. On success, forward rewritten
    /// back to `original_type`; on failure, synthesize a response frame
    /// back to the originating peer-bridge.
    async fn handle_route_to_session(&self, from: &PeerRole, frame: Frame) {
        let PeerRole::PeerBridge(origin) = from.clone() else {
            debug!(?from, "route_to_session frame from unexpected peer, discarding");
            return;
        };

        let Some(session_id) = frame.session_id.clone() else {
            self.reject_route(&origin, &frame, "route_to_session missing sessionId").await;
            return;
        };

        let forward = Frame {
            kind: frame.original_type.clone().unwrap_or_else(|| frame.kind.clone()),
            request_id: frame.request_id.clone(),
            session_id: Some(session_id.clone()),
            mcp_instance_id: frame.mcp_instance_id.clone(),
            data: frame.data.clone(),
            ..Default::default()
        };

        if self.peers.send_to_page_agent(&session_id, forward).await.is_err() {
            self.reject_route(&origin, &frame, &format!("no route to session '{session_id}'")).await;
        }
    }

    async fn reject_route(&self, origin: &str, frame: &Frame, error: &str) {
        let Some(request_id) = frame.request_id.clone() else { return };
        let response = Frame::route_failure_err(request_id, error);
        if self.peers.send_to_peer_bridge(origin, response).await.is_err() {
            warn!(%origin, "could not deliver route-failure response, origin peer-bridge gone");
        }
    }

    /// Called when a peer disconnects: reject its in-flight pendings and
    /// remove it from the peer table.
    pub async fn handle_disconnect(&self, role: PeerRole) {
        let route = match &role {
            PeerRole::Controller => RouteTarget::Controller,
            PeerRole::PageAgent(sid) => RouteTarget::PageAgent(sid.clone()),
            PeerRole::PeerBridge(id) => RouteTarget::PeerBridge(id.clone()),
        };
        self.correlator.reject_route(&route, "peer disconnected").await;
        self.peers.remove(&role).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerTable;

    fn new_dispatcher() -> (Dispatcher, Arc<PeerTable>) {
        let peers = Arc::new(PeerTable::new());
        let sessions = Arc::new(SessionRegistry::new());
        let correlator = Arc::new(RequestCorrelator::new());
        let driver_streams = Arc::new(SessionManager::new(sessions.clone()));
        let dispatcher = Dispatcher::new(peers.clone(), sessions, correlator, driver_streams, "inst-test".into());
        (dispatcher, peers)
    }

    #[tokio::test]
    async fn route_to_session_for_unconnected_session_reports_route_failure() {
        let (dispatcher, peers) = new_dispatcher();
        let (tx, mut rx) = PeerTable::new_outbound_channel();
        peers.register(PeerRole::PeerBridge("inst-b".into()), tx).await;

        let frame = Frame {
            kind: "route_to_session".into(),
            request_id: Some("req_1".into()),
            session_id: Some("session_missing".into()),
            ..Default::default()
        };
        dispatcher.route(&PeerRole::PeerBridge("inst-b".into()), frame).await;

        let response = rx.recv().await.expect("expected a synthesized failure frame");
        assert_eq!(response.success, Some(false));
        assert_eq!(response.error_kind.as_deref(), Some("routeFailure"));
    }
}

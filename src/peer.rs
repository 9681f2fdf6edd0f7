//! Peer table: every live WebSocket, typed by role.
//!
//! Cross-component references are by id only (transport id, session id,
//! instance id), never by pointer — other modules never see the
//! `RwLock<HashMap<..>>` this hides.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::protocol::Frame;

/// Outbound channel capacity per peer. Back-pressure beyond this rejects
/// rather than blocks (see dispatcher).
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerRole {
    Controller,
    PageAgent(String),
    PeerBridge(String),
}

pub struct Peer {
    pub role: PeerRole,
    pub last_seen: u64,
    pub outbound: mpsc::Sender<Frame>,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[derive(Default)]
struct Inner {
    controller: Option<Peer>,
    page_agents: HashMap<String, Peer>,
    peer_bridges: HashMap<String, Peer>,
}

/// Outcome of registering a peer: whether an existing peer of the same
/// identity was replaced (and its outbound sender, so the caller can send
/// it a best-effort close frame before dropping it).
pub enum Registered {
    Fresh,
    Replaced(mpsc::Sender<Frame>),
}

pub struct PeerTable {
    inner: RwLock<Inner>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::default()) }
    }

    pub fn new_outbound_channel() -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
    }

    /// Register a peer under its role. Second registration of a
    /// single-slot role (controller, or page-agent for a given sid)
    /// replaces the previous occupant.
    pub async fn register(&self, role: PeerRole, outbound: mpsc::Sender<Frame>) -> Registered {
        let peer = Peer { role: role.clone(), last_seen: now_secs(), outbound };
        let mut inner = self.inner.write().await;
        match role {
            PeerRole::Controller => {
                let prev = inner.controller.replace(peer);
                match prev {
                    Some(p) => Registered::Replaced(p.outbound),
                    None => Registered::Fresh,
                }
            }
            PeerRole::PageAgent(sid) => {
                let prev = inner.page_agents.insert(sid, peer);
                match prev {
                    Some(p) => Registered::Replaced(p.outbound),
                    None => Registered::Fresh,
                }
            }
            PeerRole::PeerBridge(id) => {
                let prev = inner.peer_bridges.insert(id, peer);
                match prev {
                    Some(p) => Registered::Replaced(p.outbound),
                    None => Registered::Fresh,
                }
            }
        }
    }

    pub async fn remove(&self, role: &PeerRole) {
        let mut inner = self.inner.write().await;
        match role {
            PeerRole::Controller => {
                inner.controller = None;
            }
            PeerRole::PageAgent(sid) => {
                inner.page_agents.remove(sid);
            }
            PeerRole::PeerBridge(id) => {
                inner.peer_bridges.remove(id);
            }
        }
        debug!(?role, "peer removed");
    }

    pub async fn has_controller(&self) -> bool {
        self.inner.read().await.controller.is_some()
    }

    pub async fn send_to_controller(&self, frame: Frame) -> Result<(), Frame> {
        let sender = {
            let inner = self.inner.read().await;
            inner.controller.as_ref().map(|p| p.outbound.clone())
        };
        match sender {
            Some(tx) => tx.try_send(frame).map_err(|e| e.into_inner()),
            None => Err(frame),
        }
    }

    pub async fn send_to_page_agent(&self, session_id: &str, frame: Frame) -> Result<(), Frame> {
        let sender = {
            let inner = self.inner.read().await;
            inner.page_agents.get(session_id).map(|p| p.outbound.clone())
        };
        match sender {
            Some(tx) => tx.try_send(frame).map_err(|e| e.into_inner()),
            None => Err(frame),
        }
    }

    pub async fn send_to_peer_bridge(&self, instance_id: &str, frame: Frame) -> Result<(), Frame> {
        let sender = {
            let inner = self.inner.read().await;
            inner.peer_bridges.get(instance_id).map(|p| p.outbound.clone())
        };
        match sender {
            Some(tx) => tx.try_send(frame).map_err(|e| e.into_inner()),
            None => Err(frame),
        }
    }

    pub async fn touch(&self, role: &PeerRole) {
        let mut inner = self.inner.write().await;
        let peer = match role {
            PeerRole::Controller => inner.controller.as_mut(),
            PeerRole::PageAgent(sid) => inner.page_agents.get_mut(sid),
            PeerRole::PeerBridge(id) => inner.peer_bridges.get_mut(id),
        };
        if let Some(peer) = peer {
            peer.last_seen = now_secs();
        }
    }

    pub async fn page_agent_connected(&self, session_id: &str) -> bool {
        self.inner.read().await.page_agents.contains_key(session_id)
    }

    pub async fn peer_bridge_ids(&self) -> Vec<String> {
        self.inner.read().await.peer_bridges.keys().cloned().collect()
    }

    pub async fn counts(&self) -> (bool, usize, usize) {
        let inner = self.inner.read().await;
        (inner.controller.is_some(), inner.page_agents.len(), inner.peer_bridges.len())
    }

    /// Every live peer's role and `lastSeen`, for the ping-liveness sweep.
    pub async fn snapshot(&self) -> Vec<(PeerRole, u64)> {
        let inner = self.inner.read().await;
        let mut out = Vec::with_capacity(1 + inner.page_agents.len() + inner.peer_bridges.len());
        if let Some(p) = &inner.controller {
            out.push((p.role.clone(), p.last_seen));
        }
        out.extend(inner.page_agents.values().map(|p| (p.role.clone(), p.last_seen)));
        out.extend(inner.peer_bridges.values().map(|p| (p.role.clone(), p.last_seen)));
        out
    }

    /// `lastSeen` for one role, if still registered — used to tell whether
    /// a pong arrived since a ping was sent.
    pub async fn last_seen(&self, role: &PeerRole) -> Option<u64> {
        let inner = self.inner.read().await;
        match role {
            PeerRole::Controller => inner.controller.as_ref().map(|p| p.last_seen),
            PeerRole::PageAgent(sid) => inner.page_agents.get(sid).map(|p| p.last_seen),
            PeerRole::PeerBridge(id) => inner.peer_bridges.get(id).map(|p| p.last_seen),
        }
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn controller_replace_returns_old_sender() {
        let table = PeerTable::new();
        let (tx1, _rx1) = PeerTable::new_outbound_channel();
        let (tx2, _rx2) = PeerTable::new_outbound_channel();
        assert!(matches!(table.register(PeerRole::Controller, tx1).await, Registered::Fresh));
        assert!(matches!(table.register(PeerRole::Controller, tx2).await, Registered::Replaced(_)));
    }

    #[tokio::test]
    async fn single_page_agent_per_session() {
        let table = PeerTable::new();
        let (tx1, _rx1) = PeerTable::new_outbound_channel();
        table.register(PeerRole::PageAgent("session_a".into()), tx1).await;
        assert!(table.page_agent_connected("session_a").await);
        assert!(!table.page_agent_connected("session_b").await);
    }
}

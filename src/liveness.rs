//! Ping-liveness sweep: periodically pings idle peers and tears down any
//! that miss their pong, exactly as if the socket had closed.
//!
//! Shaped like the stale-request sweep in `correlator.rs` — a ticker task
//! holding no state of its own beyond what the peer table and dispatcher
//! already expose.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::dispatcher::Dispatcher;
use crate::peer::PeerTable;
use crate::protocol::Frame;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Spawn the periodic ping sweep. Runs every `ping_interval` until
/// `cancel` fires; peers idle for at least `ping_interval` are pinged,
/// and torn down if no frame (a pong or anything else) arrives from them
/// within `pong_grace`.
pub fn spawn_ping_sweeper(
    peers: Arc<PeerTable>,
    dispatcher: Arc<Dispatcher>,
    ping_interval: Duration,
    pong_grace: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(ping_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = peers.snapshot().await;
                    for (role, last_seen) in snapshot {
                        if now_secs().saturating_sub(last_seen) < ping_interval.as_secs() {
                            continue;
                        }
                        let ping = Frame { kind: "ping".into(), ..Default::default() };
                        let sent = match &role {
                            crate::peer::PeerRole::Controller => peers.send_to_controller(ping).await,
                            crate::peer::PeerRole::PageAgent(sid) => peers.send_to_page_agent(sid, ping).await,
                            crate::peer::PeerRole::PeerBridge(id) => peers.send_to_peer_bridge(id, ping).await,
                        };
                        if sent.is_err() {
                            continue;
                        }

                        let peers = peers.clone();
                        let dispatcher = dispatcher.clone();
                        let role = role.clone();
                        let pong_grace = pong_grace;
                        tokio::spawn(async move {
                            tokio::time::sleep(pong_grace).await;
                            if peers.last_seen(&role).await == Some(last_seen) {
                                warn!(?role, "peer missed pong, tearing down");
                                dispatcher.handle_disconnect(role).await;
                            }
                        });
                    }
                }
            }
        }
    })
}

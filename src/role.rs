//! Bridge role selector: bind-or-become-peer-client, decided once at
//! start-up.
//!
//! Built around a `TcpListener::bind` + match on `AddrInUse`: instead of
//! retrying on an incrementing port, a bind failure here means a
//! *different role on the same port* — a one-shot selector whose result
//! the rest of the system consumes identically either way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::peer::PeerRole;
use crate::protocol::Frame;

pub enum BridgeRole {
    /// This process won the bind race; it owns the peer-facing listener.
    Server { listener: TcpListener },
    /// Another instance is already listening; this process forwards
    /// everything it needs through a single outbound channel to that
    /// instance's listener.
    PeerClient { outbound: mpsc::Sender<Frame> },
}

impl std::fmt::Debug for BridgeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeRole::Server { .. } => write!(f, "BridgeRole::Server"),
            BridgeRole::PeerClient { .. } => write!(f, "BridgeRole::PeerClient"),
        }
    }
}

/// Attempt to bind the peer-facing WebSocket listener; on `AddrInUse`,
/// become a peer-client of whatever is already bound there instead. No
/// further role transitions happen after this call returns.
pub async fn select_role(
    ws_addr: SocketAddr,
    instance_id: String,
    dispatcher: Arc<Dispatcher>,
    max_attempts: u32,
    reconnect_cap: Duration,
) -> anyhow::Result<BridgeRole> {
    match TcpListener::bind(ws_addr).await {
        Ok(listener) => {
            info!(%ws_addr, "bound peer-facing listener, acting as server");
            Ok(BridgeRole::Server { listener })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            info!(%ws_addr, "port already in use, acting as peer-client");
            let outbound =
                connect_peer_client(ws_addr, instance_id, dispatcher, max_attempts, reconnect_cap).await?;
            Ok(BridgeRole::PeerClient { outbound })
        }
        Err(e) => Err(e.into()),
    }
}

/// Establish (and keep re-establishing) the peer-client connection to an
/// existing server instance. Returns a channel the tool surface adapter
/// writes outbound frames to; a background task owns the socket.
async fn connect_peer_client(
    ws_addr: SocketAddr,
    instance_id: String,
    dispatcher: Arc<Dispatcher>,
    max_attempts: u32,
    reconnect_cap: Duration,
) -> anyhow::Result<mpsc::Sender<Frame>> {
    let url = format!("ws://{ws_addr}/");
    let (tx, rx) = mpsc::channel::<Frame>(crate::peer::OUTBOUND_QUEUE_CAPACITY);

    // Establish the first connection synchronously so callers can tell
    // startup failure apart from a transient hiccup.
    let first = dial_once(&url).await?;
    info!(%url, "peer-client connected to existing bridge instance");

    tokio::spawn(peer_client_loop(url, instance_id, dispatcher, rx, first, max_attempts, reconnect_cap));
    Ok(tx)
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn dial_once(url: &str) -> anyhow::Result<WsStream> {
    let (stream, _) = tokio_tungstenite::connect_async(url).await?;
    Ok(stream)
}

async fn peer_client_loop(
    url: String,
    instance_id: String,
    dispatcher: Arc<Dispatcher>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    mut socket: WsStream,
    max_attempts: u32,
    reconnect_cap: Duration,
) {
    let register = Frame {
        kind: "mcp_client_ready".into(),
        mcp_instance_id: Some(instance_id.clone()),
        ..Default::default()
    };
    if let Ok(text) = serde_json::to_string(&register) {
        let _ = socket.send(Message::Text(text)).await;
    }

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            warn!("peer-client write failed, reconnecting");
                            match reconnect(&url, max_attempts, reconnect_cap).await {
                                Some(s) => socket = s,
                                None => { error!("peer-client giving up after max reconnect attempts"); return; }
                            }
                        }
                    }
                    None => {
                        debug!("peer-client outbound channel closed, shutting down");
                        return;
                    }
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => dispatcher.route(&PeerRole::PeerBridge(instance_id.clone()), frame).await,
                            Err(e) => warn!(error = %e, "peer-client: malformed frame from server"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("peer-client connection closed, reconnecting");
                        match reconnect(&url, max_attempts, reconnect_cap).await {
                            Some(s) => socket = s,
                            None => { error!("peer-client giving up after max reconnect attempts"); return; }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "peer-client read error, reconnecting");
                        match reconnect(&url, max_attempts, reconnect_cap).await {
                            Some(s) => socket = s,
                            None => { error!("peer-client giving up after max reconnect attempts"); return; }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn reconnect(url: &str, max_attempts: u32, cap: Duration) -> Option<WsStream> {
    let mut backoff = Duration::from_millis(250);
    for attempt in 1..=max_attempts {
        tokio::time::sleep(backoff).await;
        match dial_once(url).await {
            Ok(s) => {
                info!(attempt, "peer-client reconnected");
                return Some(s);
            }
            Err(e) => {
                debug!(attempt, error = %e, "peer-client reconnect attempt failed");
                backoff = (backoff * 2).min(cap);
            }
        }
    }
    None
}

//! Per-connection peer WebSocket handling.
//!
//! Each socket gets exactly one reader and one writer task, wired
//! through the peer's bounded outbound channel — a single `tokio::select!`
//! over the outbound receiver and `socket.recv()`, with per-peer channels
//! instead of one shared broadcast channel.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::{debug, warn};

use super::GatewayState;
use crate::peer::{PeerRole, PeerTable, Registered};
use crate::protocol::{classify, Frame, FrameKind};

pub(crate) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_peer_socket(socket, state))
}

async fn handle_peer_socket(mut socket: WebSocket, state: GatewayState) {
    let peers = &state.dispatcher.peers;

    // The first frame must be a registration envelope; everything else
    // is discarded until we see one.
    let role = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => match classify(&frame) {
                    FrameKind::RegisterController => break PeerRole::Controller,
                    FrameKind::RegisterPageAgent { session_id } if !session_id.is_empty() => {
                        break PeerRole::PageAgent(session_id)
                    }
                    FrameKind::RegisterPeerBridge { instance_id } if !instance_id.is_empty() => {
                        break PeerRole::PeerBridge(instance_id)
                    }
                    _ => {
                        debug!(kind = %frame.kind, "first frame was not a valid registration, dropping socket");
                        return;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "malformed first frame, dropping socket");
                    return;
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(error = %e, "ws recv error before registration");
                return;
            }
        }
    };

    let (outbound_tx, mut outbound_rx) = PeerTable::new_outbound_channel();
    if let Registered::Replaced(old) = peers.register(role.clone(), outbound_tx).await {
        // Best-effort graceful close of the replaced peer (the second
        // `browser_ready`/controller-reconnect case named in the design
        // notes) rather than an abrupt drop.
        let _ = old.try_send(Frame { kind: "replaced".into(), ..Default::default() });
    }
    debug!(?role, "peer registered");

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => state.dispatcher.route(&role, frame).await,
                            Err(e) => warn!(error = %e, ?role, "malformed frame, discarding"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, ?role, "ws recv error");
                        break;
                    }
                    _ => {} // ping/pong/binary frames at the transport level — ignore
                }
            }
        }
    }

    state.dispatcher.handle_disconnect(role).await;
}

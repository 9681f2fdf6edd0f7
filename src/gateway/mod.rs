//! Peer-facing WebSocket gateway: the server side of the bridge role,
//! accepting controller, page-agent, and peer-bridge connections.
//!
//! Split into a handle/per-connection-task/`AppState` shape, with
//! per-peer outbound channels owned by the dispatcher rather than a
//! single broadcast-everything channel.

mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::dispatcher::Dispatcher;

#[derive(Clone)]
pub(crate) struct GatewayState {
    pub(crate) dispatcher: Arc<Dispatcher>,
}

pub struct Gateway {
    pub handle: JoinHandle<()>,
    pub addr: SocketAddr,
}

/// Run the peer-facing WebSocket server on an already-bound listener
/// (bound by the role selector, which needed to know whether the bind
/// itself succeeded before anything else could start).
pub fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Gateway {
    let addr = listener.local_addr().expect("bound listener has a local address");
    let state = GatewayState { dispatcher };

    let app = axum::Router::new().route("/", axum::routing::get(ws::ws_handler)).with_state(state);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("peer gateway server error: {e}");
        }
    });

    info!(%addr, "peer-facing gateway listening");
    Gateway { handle, addr }
}

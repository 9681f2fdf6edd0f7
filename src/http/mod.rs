//! Driver-facing HTTP/SSE front-end: the transport drivers actually
//! speak, sitting in front of the peer-facing WebSocket gateway.
//!
//! Route shape (`GET /sse` opening a session, `POST /messages` carrying
//! a tool call, permissive CORS) follows a `SessionManager`/`handle_sse`
//! split, with `/health` and `/` giving basic role/connection diagnostics.

pub mod sse;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::tool_surface::ToolCatalogue;
use sse::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub tools: Arc<ToolCatalogue>,
    pub dispatcher: Arc<Dispatcher>,
    pub idle_grace: std::time::Duration,
    pub role_name: &'static str,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sse", get(sse_handler))
        .route("/messages", post(messages_handler))
        .route("/health", get(health_handler))
        .route("/", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn sse_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (transport_id, rx) = state.sessions.open().await;
    let stream = sse::build_stream(state.sessions.clone(), transport_id, rx, state.idle_grace);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(sse::SSE_KEEP_ALIVE_SECS)))
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(rename = "transportId")]
    transport_id: Option<String>,
}

#[derive(Deserialize)]
struct ToolCall {
    tool: String,
    #[serde(default)]
    args: Value,
}

async fn messages_handler(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    Json(call): Json<ToolCall>,
) -> impl IntoResponse {
    let Some(transport_id) = query.transport_id else {
        return (axum::http::StatusCode::BAD_REQUEST, Json(json!({"error": "missing transportId"})))
            .into_response();
    };
    if !state.sessions.is_open(&transport_id).await {
        return (axum::http::StatusCode::NOT_FOUND, Json(json!({"error": "unknown transportId"}))).into_response();
    }

    match state.tools.call(&transport_id, &call.tool, call.args).await {
        Ok(data) => Json(json!({"ok": true, "data": data})).into_response(),
        Err(e) => Json(json!({"ok": false, "error": e.to_tool_payload()})).into_response(),
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (has_controller, page_agents, peer_bridges) = state.dispatcher.peers.counts().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "role": state.role_name,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "controllerConnected": has_controller,
        "pageAgentCount": page_agents,
        "peerBridgeCount": peer_bridges,
        "activeSessionCount": state.dispatcher.sessions.active_count().await,
        "openDriverStreams": state.sessions.stream_count().await,
        "pendingRequestCount": state.dispatcher.correlator.len().await,
    }))
}

/// Build the driver-facing router's state from the bridge's shared
/// components.
pub fn build_state(
    sessions: SessionManager,
    tools: Arc<ToolCatalogue>,
    dispatcher: Arc<Dispatcher>,
    config: &BridgeConfig,
    role_name: &'static str,
) -> AppState {
    AppState { sessions, tools, dispatcher, idle_grace: config.idle_grace(), role_name, started_at: Instant::now() }
}

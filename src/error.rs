//! Closed error surface for driver-visible failures.
//!
//! Drivers pattern-match on *kind*, not just message text, so this uses
//! `thiserror` rather than the `anyhow` style the rest of the daemon uses
//! at its bootstrap boundary.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum BridgeError {
    #[error("no automation session bound to this transport — call create_automation_session first")]
    NoSession,

    #[error("Chrome extension not connected — no controller is registered with the bridge")]
    NoController,

    #[error("automation session '{0}' has no connected page agent")]
    SessionNotConnected(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("request rejected by the stale-request sweep")]
    Staleness,

    #[error("back-pressure: {0}")]
    BackPressure(String),

    #[error("no route to session '{0}'")]
    RouteFailure(String),

    #[error("peer gone: {0}")]
    PeerGone(String),

    #[error("{0}")]
    OperationFailed(String),

    #[error("invalid payload: {0}")]
    PayloadInvalid(String),
}

impl BridgeError {
    /// Render as the `Error: …`-prefixed textual payload drivers expect
    /// in tool results (distinct from HTTP status codes, which are
    /// reserved for envelope-level failures at `/messages`).
    pub fn to_tool_payload(&self) -> String {
        format!("Error: {self}")
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

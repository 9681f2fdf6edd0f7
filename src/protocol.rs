//! Peer-facing WebSocket wire protocol.
//!
//! [`Frame`] is the literal wire shape: a flat JSON object, because that's
//! what arrives on the socket. Everything downstream of [`classify`] works
//! with [`FrameKind`] — a closed, typed view of the same data — so no
//! other module ever matches on a raw `type` string again.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const BACKGROUND_SESSION: &str = "__background__";

/// The literal wire envelope. Every peer-facing frame has this shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, rename = "mcpInstanceId", skip_serializing_if = "Option::is_none")]
    pub mcp_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set only on bridge-synthesized failure responses that need a
    /// driver-visible error kind distinct from a generic operation
    /// failure — currently just `"routeFailure"` (see
    /// [`Frame::route_failure_err`]).
    #[serde(default, rename = "errorKind", skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, rename = "originalType", skip_serializing_if = "Option::is_none")]
    pub original_type: Option<String>,
}

impl Frame {
    pub fn response_ok(request_id: impl Into<String>, data: Value) -> Self {
        Frame {
            kind: "response".into(),
            request_id: Some(request_id.into()),
            data: Some(data),
            success: Some(true),
            ..Default::default()
        }
    }

    pub fn response_err(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Frame {
            kind: "response".into(),
            request_id: Some(request_id.into()),
            success: Some(false),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// A failure response synthesized by the bridge itself because a
    /// `route_to_session` frame named a `sessionId` with no connected
    /// page agent — carries `errorKind: "routeFailure"` so the
    /// originating side's correlator can surface `RouteFailure` instead
    /// of mistaking this for a peer disconnect.
    pub fn route_failure_err(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Frame { error_kind: Some("routeFailure".into()), ..Frame::response_err(request_id, error) }
    }
}

/// The closed set of frame kinds the dispatcher acts on. Constructed once
/// by [`classify`]; no other module matches on [`Frame::kind`] directly.
#[derive(Debug, Clone)]
pub enum FrameKind {
    RegisterController,
    RegisterPageAgent { session_id: String },
    RegisterPeerBridge { instance_id: String },
    Response,
    HealthCheck,
    Ping,
    Pong,
    DialogOpened,
    /// Window/tab lifecycle events the controller emits spontaneously;
    /// forwarded verbatim to the driver owning the session.
    WindowClosed,
    TabAdded,
    ActiveTabChanged,
    NavigationCompleted,
    RouteToSession,
    ControllerCommand(ControllerCommand),
    /// A `*_command` frame whose command name isn't one this core knows —
    /// the open extension point named in the design notes. Still routed
    /// to the controller verbatim; the core never inspects its payload.
    UnrecognizedCommand,
    Other,
}

pub fn classify(frame: &Frame) -> FrameKind {
    match frame.kind.as_str() {
        "background_ready" => FrameKind::RegisterController,
        "browser_ready" => FrameKind::RegisterPageAgent {
            session_id: frame.session_id.clone().unwrap_or_default(),
        },
        "mcp_client_ready" => FrameKind::RegisterPeerBridge {
            instance_id: frame.mcp_instance_id.clone().unwrap_or_default(),
        },
        "response" => FrameKind::Response,
        "health_check" => FrameKind::HealthCheck,
        "ping" => FrameKind::Ping,
        "pong" => FrameKind::Pong,
        "dialog_opened" => FrameKind::DialogOpened,
        "window_closed" => FrameKind::WindowClosed,
        "tab_added" => FrameKind::TabAdded,
        "active_tab_changed" => FrameKind::ActiveTabChanged,
        "navigation_completed" => FrameKind::NavigationCompleted,
        "route_to_session" => FrameKind::RouteToSession,
        t if t.ends_with("_command") => {
            match ControllerCommand::from_frame(t, frame.data.as_ref()) {
                Some(cmd) => FrameKind::ControllerCommand(cmd),
                None => FrameKind::UnrecognizedCommand,
            }
        }
        _ => FrameKind::Other,
    }
}

/// Commands addressed to the single controller peer. Replaces
/// string-matched action dispatch with a closed tagged variant; the one
/// remaining extension point is [`FrameKind::UnrecognizedCommand`], which
/// forwards unknown `*_command` frames without the core interpreting them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControllerCommand {
    CreateSession {
        #[serde(rename = "sessionId")]
        session_id: String,
        url: Option<String>,
    },
    CloseSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    GetSessions,
    OpenNewTab {
        #[serde(rename = "sessionId")]
        session_id: String,
        url: String,
        #[serde(rename = "switchTo", default)]
        switch_to: bool,
    },
    GetTabHandles {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SwitchToTab {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "tabHandle")]
        tab_handle: String,
    },
    CloseTab {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "tabHandle")]
        tab_handle: String,
    },
    TakeScreenshot {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        quality: Option<u8>,
    },
    Navigate {
        #[serde(rename = "sessionId")]
        session_id: String,
        url: String,
    },
    Debug(DebugSubCommand),
}

impl ControllerCommand {
    fn from_frame(type_name: &str, data: Option<&Value>) -> Option<Self> {
        let op = type_name.strip_suffix("_command")?;
        if op.starts_with("debug_") {
            let sub = DebugSubCommand::from_op(op, data)?;
            return Some(ControllerCommand::Debug(sub));
        }
        let data = data.cloned().unwrap_or(Value::Null);
        let mut tagged = data;
        if let Value::Object(ref mut map) = tagged {
            map.insert("op".to_string(), Value::String(op.to_string()));
        } else {
            tagged = serde_json::json!({ "op": op });
        }
        serde_json::from_value(tagged).ok()
    }

    /// The session this command operates on, or the background sentinel
    /// for session-less commands like `get_sessions`.
    pub fn target_session(&self) -> &str {
        match self {
            ControllerCommand::CreateSession { session_id, .. }
            | ControllerCommand::CloseSession { session_id }
            | ControllerCommand::OpenNewTab { session_id, .. }
            | ControllerCommand::GetTabHandles { session_id }
            | ControllerCommand::SwitchToTab { session_id, .. }
            | ControllerCommand::CloseTab { session_id, .. }
            | ControllerCommand::TakeScreenshot { session_id, .. }
            | ControllerCommand::Navigate { session_id, .. } => session_id,
            ControllerCommand::GetSessions => BACKGROUND_SESSION,
            ControllerCommand::Debug(d) => d.target_session(),
        }
    }
}

/// Debug-channel sub-commands (attach debugger, toggle capture, fetch
/// logs, evaluate, intercept, perf metrics). The core treats these as
/// opaque pass-through payloads; it never interprets `data` beyond the
/// session it targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subOp", rename_all = "snake_case")]
pub enum DebugSubCommand {
    Attach { #[serde(rename = "sessionId")] session_id: String },
    SetCapture {
        #[serde(rename = "sessionId")]
        session_id: String,
        network: Option<bool>,
        console: Option<bool>,
        websocket: Option<bool>,
    },
    GetLogs {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        filter: Option<Value>,
        #[serde(default)]
        cursor: Option<String>,
    },
    ClearLogs { #[serde(rename = "sessionId")] session_id: String },
    Evaluate {
        #[serde(rename = "sessionId")]
        session_id: String,
        expression: String,
    },
    SetInterception {
        #[serde(rename = "sessionId")]
        session_id: String,
        enabled: bool,
    },
    GetPerformance { #[serde(rename = "sessionId")] session_id: String },
}

impl DebugSubCommand {
    fn from_op(op: &str, data: Option<&Value>) -> Option<Self> {
        let sub_op = op.strip_prefix("debug_")?;
        let data = data.cloned().unwrap_or(Value::Null);
        let mut tagged = data;
        if let Value::Object(ref mut map) = tagged {
            map.insert("subOp".to_string(), Value::String(sub_op.to_string()));
        } else {
            tagged = serde_json::json!({ "subOp": sub_op });
        }
        serde_json::from_value(tagged).ok()
    }

    fn target_session(&self) -> &str {
        match self {
            DebugSubCommand::Attach { session_id }
            | DebugSubCommand::SetCapture { session_id, .. }
            | DebugSubCommand::GetLogs { session_id, .. }
            | DebugSubCommand::ClearLogs { session_id }
            | DebugSubCommand::Evaluate { session_id, .. }
            | DebugSubCommand::SetInterception { session_id, .. }
            | DebugSubCommand::GetPerformance { session_id } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_registration_frames() {
        let f = Frame { kind: "background_ready".into(), ..Default::default() };
        assert!(matches!(classify(&f), FrameKind::RegisterController));

        let f = Frame {
            kind: "browser_ready".into(),
            session_id: Some("session_abc123".into()),
            ..Default::default()
        };
        match classify(&f) {
            FrameKind::RegisterPageAgent { session_id } => assert_eq!(session_id, "session_abc123"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_known_controller_command() {
        let f = Frame {
            kind: "navigate_command".into(),
            data: Some(serde_json::json!({ "sessionId": "session_x", "url": "https://example.com" })),
            ..Default::default()
        };
        match classify(&f) {
            FrameKind::ControllerCommand(ControllerCommand::Navigate { session_id, url }) => {
                assert_eq!(session_id, "session_x");
                assert_eq!(url, "https://example.com");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_extension_point() {
        let f = Frame {
            kind: "future_feature_command".into(),
            data: Some(serde_json::json!({ "sessionId": "session_x" })),
            ..Default::default()
        };
        assert!(matches!(classify(&f), FrameKind::UnrecognizedCommand));
    }

    #[test]
    fn screenshot_quality_field_round_trips() {
        let f = Frame {
            kind: "take_screenshot_command".into(),
            data: Some(serde_json::json!({ "sessionId": "s1", "format": "jpeg", "quality": 40 })),
            ..Default::default()
        };
        match classify(&f) {
            FrameKind::ControllerCommand(ControllerCommand::TakeScreenshot { quality, format, .. }) => {
                assert_eq!(quality, Some(40));
                assert_eq!(format.as_deref(), Some("jpeg"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

//! Tool Surface Adapter: the fixed catalogue of entry points drivers
//! call, each translated into one routed request through the dispatcher.
//!
//! Generalized from a process-global `Lazy<Mutex<Vec<..>>>` registry to
//! an owned [`ToolCatalogue`] built once at startup — there is exactly
//! one bridge instance per process, and tests must not cross-talk
//! through shared global state.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::correlator::{RequestCorrelator, RouteTarget};
use crate::error::{BridgeError, BridgeResult};
use crate::peer::PeerTable;
use crate::protocol::{ControllerCommand, Frame};
use crate::session::SessionRegistry;

/// Metadata describing one tool entry point, for listing/discovery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolMeta {
    pub name: String,
    pub description: String,
    pub args_schema: Value,
}

fn meta(name: &str, description: &str, args_schema: Value) -> ToolMeta {
    ToolMeta { name: name.to_string(), description: description.to_string(), args_schema }
}

/// Where outbound controller/page-agent frames go, independent of
/// whether this process is the bridge server or a peer-client of one.
#[derive(Clone)]
pub enum CommandSink {
    /// This process owns the peer table directly.
    Server(Arc<PeerTable>),
    /// This process forwards through its single upstream connection.
    PeerClient(mpsc::Sender<Frame>),
}

impl CommandSink {
    async fn send_controller(&self, frame: Frame) -> Result<(), Frame> {
        match self {
            CommandSink::Server(peers) => peers.send_to_controller(frame).await,
            CommandSink::PeerClient(tx) => tx.try_send(frame).map_err(|e| e.into_inner()),
        }
    }

    async fn send_page_agent(&self, session_id: &str, frame: Frame) -> Result<(), Frame> {
        match self {
            CommandSink::Server(peers) => peers.send_to_page_agent(session_id, frame).await,
            CommandSink::PeerClient(tx) => {
                let wrapped = Frame {
                    kind: "route_to_session".into(),
                    original_type: Some(frame.kind.clone()),
                    session_id: frame.session_id.clone(),
                    request_id: frame.request_id.clone(),
                    mcp_instance_id: frame.mcp_instance_id.clone(),
                    data: frame.data.clone(),
                    ..Default::default()
                };
                tx.try_send(wrapped).map_err(|e| e.into_inner())
            }
        }
    }
}

/// Per-tool-class timeout. Most commands share a modest default;
/// screenshots get more room for encoding.
fn timeout_for(tool: &str) -> Duration {
    match tool {
        "take_screenshot_command" => Duration::from_secs(20),
        _ => Duration::from_secs(15),
    }
}

/// The adapter's contract: validate, resolve the caller's session,
/// route, and return a textual payload. Built once at startup from the
/// same shared state the dispatcher uses.
pub struct ToolCatalogue {
    sessions: Arc<SessionRegistry>,
    peers: Arc<PeerTable>,
    correlator: Arc<RequestCorrelator>,
    sink: CommandSink,
    instance_id: String,
}

impl ToolCatalogue {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        peers: Arc<PeerTable>,
        correlator: Arc<RequestCorrelator>,
        sink: CommandSink,
        instance_id: String,
    ) -> Self {
        Self { sessions, peers, correlator, sink, instance_id }
    }

    /// Metadata for every tool this catalogue exposes, for discovery.
    pub fn list(&self) -> Vec<ToolMeta> {
        vec![
            meta(
                "create_automation_session",
                "Create a new browser automation session bound to this driver.",
                json!({"type": "object", "properties": {"url": {"type": "string"}}}),
            ),
            meta(
                "close_automation_session",
                "Close the automation session bound to this driver.",
                json!({"type": "object", "properties": {}}),
            ),
            meta(
                "list_automation_sessions",
                "List every live automation session known to the controller.",
                json!({"type": "object", "properties": {}}),
            ),
            meta(
                "navigate_to",
                "Navigate the current session's active tab to a URL.",
                json!({"type": "object", "required": ["url"], "properties": {"url": {"type": "string"}}}),
            ),
            meta(
                "take_screenshot",
                "Capture a screenshot of the current session's active tab.",
                json!({"type": "object", "properties": {"format": {"type": "string"}, "quality": {"type": "integer"}}}),
            ),
            meta(
                "open_new_tab",
                "Open a new tab in the current session.",
                json!({"type": "object", "required": ["url"], "properties": {"url": {"type": "string"}, "switchTo": {"type": "boolean"}}}),
            ),
            meta(
                "switch_to_tab",
                "Switch the current session's active tab.",
                json!({"type": "object", "required": ["tabHandle"], "properties": {"tabHandle": {"type": "string"}}}),
            ),
            meta(
                "close_tab",
                "Close a tab in the current session.",
                json!({"type": "object", "required": ["tabHandle"], "properties": {"tabHandle": {"type": "string"}}}),
            ),
            meta(
                "get_tab_handles",
                "List every open tab handle in the current session.",
                json!({"type": "object", "properties": {}}),
            ),
            meta(
                "get_current_session",
                "Return the automation session currently bound to this driver, answered locally.",
                json!({"type": "object", "properties": {}}),
            ),
            meta(
                "get_automation_status",
                "Return bridge-wide status: controller connectivity and peer counts, answered locally.",
                json!({"type": "object", "properties": {}}),
            ),
            meta(
                "route_page_operation",
                "Forward an opaque operation/payload pair to the current session's page agent.",
                json!({"type": "object", "required": ["operation"], "properties": {"operation": {"type": "string"}, "payload": {}}}),
            ),
        ]
    }

    /// Invoke `tool` with `args` on behalf of the driver bound to
    /// `transport_id`. Returns the tool's result payload, or a
    /// driver-visible `BridgeError` — never panics on malformed input.
    pub async fn call(&self, transport_id: &str, tool: &str, args: Value) -> BridgeResult<Value> {
        match tool {
            "create_automation_session" => self.create_automation_session(transport_id, args).await,
            "close_automation_session" => self.close_automation_session(transport_id).await,
            "list_automation_sessions" => self.send_command(ControllerCommand::GetSessions, false).await,
            "navigate_to" => self.navigate_to(transport_id, args).await,
            "take_screenshot" => self.take_screenshot(transport_id, args).await,
            "open_new_tab" => self.open_new_tab(transport_id, args).await,
            "switch_to_tab" => self.switch_to_tab(transport_id, args).await,
            "close_tab" => self.close_tab(transport_id, args).await,
            "get_tab_handles" => self.get_tab_handles(transport_id).await,
            "get_current_session" => self.get_current_session(transport_id).await,
            "get_automation_status" => self.get_automation_status().await,
            "route_page_operation" => self.route_page_operation(transport_id, args).await,
            other => Err(BridgeError::PayloadInvalid(format!("unknown tool '{other}'"))),
        }
    }

    async fn create_automation_session(&self, transport_id: &str, args: Value) -> BridgeResult<Value> {
        self.sessions.touch_transport(transport_id).await;
        let session_id = self.sessions.new_browser_session(transport_id).await?;
        let url = args.get("url").and_then(Value::as_str).map(str::to_string);
        let command = ControllerCommand::CreateSession { session_id: session_id.clone(), url };
        let response = self.send_command(command, false).await?;
        self.sessions
            .update_session(&session_id, |s| {
                if let Some(handle) = response.get("windowHandle").and_then(Value::as_str) {
                    s.window_handle = Some(handle.to_string());
                }
            })
            .await;
        Ok(json!({ "sessionId": session_id, "controller": response }))
    }

    async fn close_automation_session(&self, transport_id: &str) -> BridgeResult<Value> {
        let session_id = self.sessions.session_or_error(transport_id).await?;
        let response =
            self.send_command(ControllerCommand::CloseSession { session_id: session_id.clone() }, false).await?;
        self.sessions.drop_session(&session_id).await;
        Ok(response)
    }

    async fn navigate_to(&self, transport_id: &str, args: Value) -> BridgeResult<Value> {
        let session_id = self.sessions.session_or_error(transport_id).await?;
        let url = require_str(&args, "url")?;
        self.send_command(ControllerCommand::Navigate { session_id, url }, false).await
    }

    async fn take_screenshot(&self, transport_id: &str, args: Value) -> BridgeResult<Value> {
        let session_id = self.sessions.session_or_error(transport_id).await?;
        let format = args.get("format").and_then(Value::as_str).map(str::to_string);
        let quality = args.get("quality").and_then(Value::as_u64).map(|q| q as u8);
        self.send_command(ControllerCommand::TakeScreenshot { session_id, format, quality }, false).await
    }

    async fn open_new_tab(&self, transport_id: &str, args: Value) -> BridgeResult<Value> {
        let session_id = self.sessions.session_or_error(transport_id).await?;
        let url = require_str(&args, "url")?;
        let switch_to = args.get("switchTo").and_then(Value::as_bool).unwrap_or(false);
        self.send_command(ControllerCommand::OpenNewTab { session_id, url, switch_to }, false).await
    }

    async fn switch_to_tab(&self, transport_id: &str, args: Value) -> BridgeResult<Value> {
        let session_id = self.sessions.session_or_error(transport_id).await?;
        let tab_handle = require_str(&args, "tabHandle")?;
        self.send_command(ControllerCommand::SwitchToTab { session_id, tab_handle }, false).await
    }

    async fn close_tab(&self, transport_id: &str, args: Value) -> BridgeResult<Value> {
        let session_id = self.sessions.session_or_error(transport_id).await?;
        let tab_handle = require_str(&args, "tabHandle")?;
        self.send_command(ControllerCommand::CloseTab { session_id, tab_handle }, false).await
    }

    async fn get_tab_handles(&self, transport_id: &str) -> BridgeResult<Value> {
        let session_id = self.sessions.session_or_error(transport_id).await?;
        self.send_command(ControllerCommand::GetTabHandles { session_id }, false).await
    }

    /// Bridge-local: no round trip, answered straight from the registry.
    async fn get_current_session(&self, transport_id: &str) -> BridgeResult<Value> {
        let session_id = self.sessions.session_or_error(transport_id).await?;
        let session = self.sessions.get_session(&session_id).await.ok_or(BridgeError::NoSession)?;
        Ok(json!({
            "sessionId": session.id,
            "windowHandle": session.window_handle,
            "activeTabHandle": session.active_tab_handle,
            "tabCount": session.tabs.len(),
        }))
    }

    /// Bridge-local: controller connectivity and peer counts, no round trip.
    async fn get_automation_status(&self) -> BridgeResult<Value> {
        let (has_controller, page_agents, peer_bridges) = self.peers.counts().await;
        Ok(json!({
            "instanceId": self.instance_id,
            "controllerConnected": has_controller,
            "pageAgentCount": page_agents,
            "peerBridgeCount": peer_bridges,
            "activeSessionCount": self.sessions.active_count().await,
            "pendingRequestCount": self.correlator.len().await,
        }))
    }

    async fn route_page_operation(&self, transport_id: &str, args: Value) -> BridgeResult<Value> {
        let session_id = self.sessions.session_or_error(transport_id).await?;
        let operation = require_str(&args, "operation")?;
        let payload = args.get("payload").cloned().unwrap_or(Value::Null);

        let (request_id, rx) = self
            .correlator
            .issue(RouteTarget::PageAgent(session_id.clone()), Some(timeout_for("route_page_operation")), false)
            .await;
        let frame = Frame {
            kind: operation,
            request_id: Some(request_id),
            session_id: Some(session_id.clone()),
            mcp_instance_id: Some(self.instance_id.clone()),
            data: Some(payload),
            ..Default::default()
        };
        if self.sink.send_page_agent(&session_id, frame).await.is_err() {
            return Err(BridgeError::SessionNotConnected("no page agent connected for this session".into()));
        }
        await_response(rx).await
    }

    /// Generic controller command: mint a request id, send, await the
    /// response frame, unwrap its `data`.
    async fn send_command(&self, command: ControllerCommand, background: bool) -> BridgeResult<Value> {
        let target_session = command.target_session().to_string();
        let kind = command_frame_kind(&command);
        let data = serde_json::to_value(&command).map_err(|e| BridgeError::PayloadInvalid(e.to_string()))?;

        let (request_id, rx) = self.correlator.issue(RouteTarget::Controller, Some(timeout_for(&kind)), background).await;
        let frame = Frame {
            kind,
            request_id: Some(request_id),
            session_id: if target_session == crate::protocol::BACKGROUND_SESSION {
                None
            } else {
                Some(target_session)
            },
            mcp_instance_id: Some(self.instance_id.clone()),
            data: Some(data),
            ..Default::default()
        };

        if self.sink.send_controller(frame).await.is_err() {
            return Err(BridgeError::NoController);
        }
        await_response(rx).await
    }
}

fn require_str(args: &Value, field: &str) -> BridgeResult<String> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::PayloadInvalid(format!("missing required field '{field}'")))
}

/// `*_command` wire type for an outgoing controller command — the
/// adapter's one place that re-derives a wire string from a typed value
/// (the reverse of `protocol::classify`).
fn command_frame_kind(command: &ControllerCommand) -> String {
    let op = match command {
        ControllerCommand::CreateSession { .. } => "create_session",
        ControllerCommand::CloseSession { .. } => "close_session",
        ControllerCommand::GetSessions => "get_sessions",
        ControllerCommand::OpenNewTab { .. } => "open_new_tab",
        ControllerCommand::GetTabHandles { .. } => "get_tab_handles",
        ControllerCommand::SwitchToTab { .. } => "switch_to_tab",
        ControllerCommand::CloseTab { .. } => "close_tab",
        ControllerCommand::TakeScreenshot { .. } => "take_screenshot",
        ControllerCommand::Navigate { .. } => "navigate",
        ControllerCommand::Debug(_) => "debug",
    };
    format!("{op}_command")
}

async fn await_response(rx: tokio::sync::oneshot::Receiver<Result<Frame, BridgeError>>) -> BridgeResult<Value> {
    match rx.await {
        Ok(Ok(frame)) => Ok(frame.data.unwrap_or(Value::Null)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(BridgeError::PeerGone("response channel dropped".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerRole;

    fn new_catalogue() -> (ToolCatalogue, Arc<PeerTable>) {
        let sessions = Arc::new(SessionRegistry::new());
        let peers = Arc::new(PeerTable::new());
        let correlator = Arc::new(RequestCorrelator::new());
        let sink = CommandSink::Server(peers.clone());
        let catalogue = ToolCatalogue::new(sessions, peers.clone(), correlator, sink, "inst-1".into());
        (catalogue, peers)
    }

    #[tokio::test]
    async fn create_session_without_controller_is_no_controller_error() {
        let (catalogue, _peers) = new_catalogue();
        let result = catalogue.call("t1", "create_automation_session", json!({})).await;
        assert!(matches!(result, Err(BridgeError::NoController)));
    }

    #[tokio::test]
    async fn navigate_without_session_is_no_session_error() {
        let (catalogue, peers) = new_catalogue();
        let (tx, _rx) = PeerTable::new_outbound_channel();
        peers.register(PeerRole::Controller, tx).await;
        let result = catalogue.call("t1", "navigate_to", json!({"url": "https://example.com"})).await;
        assert!(matches!(result, Err(BridgeError::NoSession)));
    }

    #[tokio::test]
    async fn unknown_tool_is_payload_invalid() {
        let (catalogue, _peers) = new_catalogue();
        let result = catalogue.call("t1", "delete_everything", json!({})).await;
        assert!(matches!(result, Err(BridgeError::PayloadInvalid(_))));
    }

    #[tokio::test]
    async fn list_describes_every_catalogue_entry() {
        let (catalogue, _peers) = new_catalogue();
        let names: Vec<String> = catalogue.list().into_iter().map(|m| m.name).collect();
        assert!(names.contains(&"route_page_operation".to_string()));
        assert!(names.contains(&"get_automation_status".to_string()));
        assert_eq!(names.len(), 12);
    }
}

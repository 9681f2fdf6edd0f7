//! End-to-end tests over real WebSocket connections: peer registration,
//! controller command round trips, and the controller-gone / peer-bridge
//! fallback scenarios.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use browser_bridge::correlator::RequestCorrelator;
use browser_bridge::dispatcher::Dispatcher;
use browser_bridge::error::BridgeError;
use browser_bridge::http::sse::SessionManager;
use browser_bridge::peer::PeerTable;
use browser_bridge::session::SessionRegistry;
use browser_bridge::tool_surface::{CommandSink, ToolCatalogue};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

async fn free_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

struct Harness {
    tools: Arc<ToolCatalogue>,
    ws_addr: SocketAddr,
}

async fn spawn_bridge() -> Harness {
    let sessions = Arc::new(SessionRegistry::new());
    let peers = Arc::new(PeerTable::new());
    let correlator = Arc::new(RequestCorrelator::new());
    let driver_streams = Arc::new(SessionManager::new(sessions.clone()));
    let dispatcher =
        Arc::new(Dispatcher::new(peers.clone(), sessions.clone(), correlator.clone(), driver_streams, "inst-test".into()));

    let ws_addr = free_addr().await;
    let listener = tokio::net::TcpListener::bind(ws_addr).await.unwrap();
    let gateway = browser_bridge::gateway::serve(listener, dispatcher.clone());

    let tools =
        Arc::new(ToolCatalogue::new(sessions, peers.clone(), correlator, CommandSink::Server(peers), "inst-test".into()));

    Harness { tools, ws_addr: gateway.addr }
}

#[tokio::test]
async fn create_session_without_controller_mentions_chrome_extension() {
    let harness = spawn_bridge().await;
    let result = harness.tools.call("driver-1", "create_automation_session", json!({})).await;
    let err = result.expect_err("expected NoController");
    assert!(matches!(err, BridgeError::NoController));
    assert!(err.to_tool_payload().contains("Chrome extension not connected"));
}

#[tokio::test]
async fn create_and_navigate_round_trips_through_a_fake_controller() {
    let harness = spawn_bridge().await;
    let url = format!("ws://{}/", harness.ws_addr);
    let (mut controller, _) = connect_async(&url).await.expect("controller connect failed");
    controller.send(Message::Text(json!({"type": "background_ready"}).to_string())).await.unwrap();

    // Give the gateway a moment to register the controller before the tool call races it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let call = tokio::spawn({
        let tools = harness.tools.clone();
        async move { tools.call("driver-1", "create_automation_session", json!({"url": "https://example.com"})).await }
    });

    // Respond as the controller: read the forwarded create_session_command, reply success.
    let msg = tokio::time::timeout(Duration::from_secs(2), controller.next())
        .await
        .expect("timeout waiting for create_session_command")
        .expect("stream ended")
        .expect("ws error");
    let frame: serde_json::Value = serde_json::from_str(msg.into_text().unwrap().as_str()).unwrap();
    assert_eq!(frame["type"], "create_session_command");
    let request_id = frame["requestId"].as_str().unwrap().to_string();

    let response = json!({
        "type": "response",
        "requestId": request_id,
        "success": true,
        "data": {"windowHandle": "win-1"},
    });
    controller.send(Message::Text(response.to_string())).await.unwrap();

    let result = call.await.unwrap().expect("create_automation_session should succeed");
    assert!(result["sessionId"].as_str().unwrap().starts_with("session_"));

    // navigate_to round trip against the same session
    let nav_call = tokio::spawn({
        let tools = harness.tools.clone();
        async move { tools.call("driver-1", "navigate_to", json!({"url": "https://example.com"})).await }
    });
    let msg = tokio::time::timeout(Duration::from_secs(2), controller.next())
        .await
        .expect("timeout waiting for navigate_command")
        .expect("stream ended")
        .expect("ws error");
    let frame: serde_json::Value = serde_json::from_str(msg.into_text().unwrap().as_str()).unwrap();
    assert_eq!(frame["type"], "navigate_command");
    let request_id = frame["requestId"].as_str().unwrap().to_string();
    controller
        .send(Message::Text(json!({"type": "response", "requestId": request_id, "success": true, "data": {}}).to_string()))
        .await
        .unwrap();
    nav_call.await.unwrap().expect("navigate_to should succeed");
}

#[tokio::test]
async fn peer_bridge_fallback_routes_through_the_first_instance() {
    // First process binds the shared ws port and owns the real peer table.
    let harness_a = spawn_bridge().await;

    // Second process tries the same port, loses the race, and becomes a peer-client.
    // Its dispatcher and the tool catalogue built on top of it must share the
    // same correlator — incoming `response` frames are resolved through the
    // dispatcher, not the catalogue directly.
    let sessions_b = Arc::new(SessionRegistry::new());
    let peers_b = Arc::new(PeerTable::new());
    let correlator_b = Arc::new(RequestCorrelator::new());
    let dispatcher_b = {
        let driver_streams = Arc::new(SessionManager::new(sessions_b.clone()));
        Arc::new(Dispatcher::new(peers_b.clone(), sessions_b.clone(), correlator_b.clone(), driver_streams, "inst-b".into()))
    };
    let role = browser_bridge::role::select_role(
        harness_a.ws_addr,
        "inst-b".into(),
        dispatcher_b,
        5,
        Duration::from_secs(1),
    )
    .await
    .expect("role selection should succeed");

    let outbound = match role {
        browser_bridge::role::BridgeRole::PeerClient { outbound } => outbound,
        browser_bridge::role::BridgeRole::Server { .. } => panic!("second instance should lose the bind race"),
    };

    // A controller connects to the (only) real server.
    let url = format!("ws://{}/", harness_a.ws_addr);
    let (mut controller, _) = connect_async(&url).await.expect("controller connect failed");
    controller.send(Message::Text(json!({"type": "background_ready"}).to_string())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Build tools for instance B routed entirely through its peer-client sink,
    // sharing state with `dispatcher_b` above.
    let tools_b = Arc::new(ToolCatalogue::new(
        sessions_b,
        peers_b,
        correlator_b,
        CommandSink::PeerClient(outbound),
        "inst-b".into(),
    ));

    let call = tokio::spawn({
        let tools = tools_b.clone();
        async move { tools.call("driver-b", "create_automation_session", json!({})).await }
    });

    let msg = tokio::time::timeout(Duration::from_secs(2), controller.next())
        .await
        .expect("timeout waiting for forwarded command")
        .expect("stream ended")
        .expect("ws error");
    let frame: serde_json::Value = serde_json::from_str(msg.into_text().unwrap().as_str()).unwrap();
    assert_eq!(frame["type"], "create_session_command");
    assert_eq!(frame["mcpInstanceId"], "inst-b");
    let request_id = frame["requestId"].as_str().unwrap().to_string();

    controller
        .send(Message::Text(
            json!({"type": "response", "requestId": request_id, "mcpInstanceId": "inst-b", "success": true, "data": {}})
                .to_string(),
        ))
        .await
        .unwrap();

    let result = call.await.unwrap().expect("routed create_automation_session should resolve at instance B");
    assert!(result["sessionId"].as_str().unwrap().starts_with("session_"));
}

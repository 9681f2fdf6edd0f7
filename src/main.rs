use std::sync::Arc;

use browser_bridge::cli_app::{check_status, Cli, Command};
use browser_bridge::config::{bridge_home, BridgeConfig};
use browser_bridge::correlator::RequestCorrelator;
use browser_bridge::dispatcher::Dispatcher;
use browser_bridge::http::sse::SessionManager;
use browser_bridge::peer::PeerTable;
use browser_bridge::role::{select_role, BridgeRole};
use browser_bridge::session::SessionRegistry;
use browser_bridge::tool_surface::{CommandSink, ToolCatalogue};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    browser_bridge::logs::init_tracing();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(|| bridge_home().join("config.yaml"));

    match cli.command.unwrap_or_default() {
        Command::Status => {
            let cfg = BridgeConfig::load(&config_path).await?;
            return check_status(&cfg.http_addr).await;
        }
        Command::Config => {
            let cfg = BridgeConfig::load(&config_path).await?;
            println!("{}", serde_yaml_ng::to_string(&cfg)?);
            return Ok(());
        }
        Command::Start => { /* fall through to daemon startup */ }
    }

    println!(
        r#"
  ╔═══════════════════════════════════╗
  ║     browser-bridge  v{}          ║
  ║  session-routed automation fabric  ║
  ╚═══════════════════════════════════╝
"#,
        env!("CARGO_PKG_VERSION")
    );

    info!(path = %config_path.display(), "loading configuration");
    let cfg = BridgeConfig::load(&config_path).await?;
    info!(instance_id = %cfg.instance_id, http_addr = %cfg.http_addr, ws_addr = %cfg.ws_addr, "configuration loaded");

    let sessions = Arc::new(SessionRegistry::new());
    let peers = Arc::new(PeerTable::new());
    let correlator = Arc::new(RequestCorrelator::with_limits(
        cfg.max_pending,
        cfg.stale_timeout(),
        cfg.global_request_cap(),
    ));
    let driver_streams = SessionManager::new(sessions.clone());

    let dispatcher = Arc::new(Dispatcher::new(
        peers.clone(),
        sessions.clone(),
        correlator.clone(),
        Arc::new(driver_streams.clone()),
        cfg.instance_id.clone(),
    ));

    let cancel = CancellationToken::new();
    let _sweeper =
        browser_bridge::correlator::spawn_sweeper(correlator.clone(), cfg.sweep_interval(), cancel.clone());
    let _ping_sweeper = browser_bridge::liveness::spawn_ping_sweeper(
        peers.clone(),
        dispatcher.clone(),
        cfg.ping_interval(),
        cfg.pong_grace(),
        cancel.clone(),
    );

    let role = select_role(
        cfg.ws_socket_addr()?,
        cfg.instance_id.clone(),
        dispatcher.clone(),
        cfg.max_peer_bridge_attempts,
        cfg.peer_reconnect_cap(),
    )
    .await?;

    let (role_name, sink, _gateway) = match role {
        BridgeRole::Server { listener } => {
            let gateway = browser_bridge::gateway::serve(listener, dispatcher.clone());
            info!(addr = %gateway.addr, "acting as bridge server");
            ("server", CommandSink::Server(peers.clone()), Some(gateway))
        }
        BridgeRole::PeerClient { outbound } => {
            info!("acting as peer-client of an existing bridge instance");
            ("peer-client", CommandSink::PeerClient(outbound), None)
        }
    };

    let tools = Arc::new(ToolCatalogue::new(
        sessions.clone(),
        peers.clone(),
        correlator.clone(),
        sink,
        cfg.instance_id.clone(),
    ));

    let http_state = browser_bridge::http::build_state(driver_streams, tools, dispatcher, &cfg, role_name);
    let http_addr = cfg.http_socket_addr()?;
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!(%http_addr, "driver-facing HTTP/SSE front-end listening");
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, browser_bridge::http::router(http_state)).await {
            tracing::error!("driver-facing HTTP server error: {e}");
        }
    });

    info!(role = role_name, "browser-bridge ready");

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received, shutting down…");

    cancel.cancel();
    http_handle.abort();
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    info!("shutdown complete");
    Ok(())
}

/// Wait for either Ctrl-C or, on Unix, `SIGTERM` — the latter is what a
/// process manager sends on a normal stop, and ignoring it means the
/// 250ms drain window below never runs.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

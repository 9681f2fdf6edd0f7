//! CLI surface: `browser-bridge [--config <path>] [start | status | config]`.
//!
//! `Cli`/`Command` derive shape, covering the subcommands this daemon
//! needs: start the daemon, probe a running instance, or print config.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "browser-bridge", version, about = "Session-routed WebSocket dispatch fabric for browser automation")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Default)]
pub enum Command {
    /// Start the daemon (default).
    #[default]
    Start,
    /// Check whether a bridge instance is reachable on its HTTP port.
    Status,
    /// Print the resolved configuration (file plus environment overrides).
    Config,
}

/// `status` subcommand: hit the local `/health` endpoint and print role
/// and peer counts; exit 1 if unreachable.
pub async fn check_status(http_addr: &str) -> anyhow::Result<()> {
    let url = format!("http://{http_addr}/health");
    let client = reqwest::Client::builder().timeout(std::time::Duration::from_secs(3)).build()?;

    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            println!("bridge is running at http://{http_addr}");
            if let Some(role) = body.get("role").and_then(|v| v.as_str()) {
                println!("  role: {role}");
            }
            if let Some(controller) = body.get("controllerConnected").and_then(|v| v.as_bool()) {
                println!("  controller connected: {controller}");
            }
            if let Some(page_agents) = body.get("pageAgentCount").and_then(|v| v.as_u64()) {
                println!("  page agents: {page_agents}");
            }
            Ok(())
        }
        Ok(resp) => {
            eprintln!("bridge responded with status {}", resp.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("bridge unreachable at http://{http_addr}: {e}");
            std::process::exit(1);
        }
    }
}

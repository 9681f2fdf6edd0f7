//! Process configuration, loaded from an optional YAML file with
//! environment-variable overrides.
//!
//! A `load`/`validate`/`save` structure covering the fields this bridge
//! actually has: addresses, timeouts, and the bounded-queue constants.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_ws_addr() -> String {
    "127.0.0.1:3002".to_string()
}

fn default_max_pending() -> usize {
    crate::correlator::MAX_PENDING
}

fn default_stale_timeout_secs() -> u64 {
    crate::correlator::STALE_TIMEOUT.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    crate::correlator::SWEEP_INTERVAL.as_secs()
}

fn default_global_request_cap_secs() -> u64 {
    crate::correlator::GLOBAL_REQUEST_CAP.as_secs()
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_pong_grace_secs() -> u64 {
    5
}

fn default_idle_grace_secs() -> u64 {
    30
}

fn default_max_peer_bridge_attempts() -> u32 {
    10
}

fn default_peer_reconnect_cap_secs() -> u64 {
    30
}

/// Top-level configuration, loaded from `config.yaml` (or
/// `BRIDGE_CONFIG`), then overridden by `BRIDGE_*` environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct BridgeConfig {
    pub http_addr: String,
    pub ws_addr: String,
    pub instance_id: String,
    pub max_pending: usize,
    pub stale_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub global_request_cap_secs: u64,
    pub ping_interval_secs: u64,
    pub pong_grace_secs: u64,
    pub idle_grace_secs: u64,
    pub max_peer_bridge_attempts: u32,
    pub peer_reconnect_cap_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            ws_addr: default_ws_addr(),
            instance_id: Uuid::new_v4().to_string(),
            max_pending: default_max_pending(),
            stale_timeout_secs: default_stale_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            global_request_cap_secs: default_global_request_cap_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_grace_secs: default_pong_grace_secs(),
            idle_grace_secs: default_idle_grace_secs(),
            max_peer_bridge_attempts: default_max_peer_bridge_attempts(),
            peer_reconnect_cap_secs: default_peer_reconnect_cap_secs(),
        }
    }
}

impl BridgeConfig {
    /// Load from `path` if it exists, else fall back to defaults, then
    /// apply environment overrides. A missing file is not an error — the
    /// bridge is fully usable with compiled-in defaults.
    pub async fn load(path: &Path) -> anyhow::Result<BridgeConfig> {
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(contents) => serde_yaml_ng::from_str(&contents)
                .with_context(|| format!("failed to parse config YAML: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                BridgeConfig::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config file: {}", path.display()))
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BRIDGE_HTTP_ADDR") {
            self.http_addr = v;
        }
        if let Ok(v) = std::env::var("BRIDGE_WS_ADDR") {
            self.ws_addr = v;
        }
        if let Ok(v) = std::env::var("BRIDGE_INSTANCE_ID") {
            self.instance_id = v;
        }
        if let Ok(v) = std::env::var("BRIDGE_MAX_PENDING") {
            if let Ok(n) = v.parse() {
                self.max_pending = n;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.http_socket_addr().context("invalid http_addr")?;
        self.ws_socket_addr().context("invalid ws_addr")?;
        if self.max_pending == 0 {
            anyhow::bail!("config: max_pending must be > 0");
        }
        if self.instance_id.trim().is_empty() {
            anyhow::bail!("config: instance_id must not be empty");
        }
        Ok(())
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_yaml_ng::to_string(self).context("serialize config YAML")?;
        tokio::fs::write(path, &contents)
            .await
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn http_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.http_addr.parse().with_context(|| format!("invalid http_addr '{}'", self.http_addr))
    }

    pub fn ws_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.ws_addr.parse().with_context(|| format!("invalid ws_addr '{}'", self.ws_addr))
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn global_request_cap(&self) -> Duration {
        Duration::from_secs(self.global_request_cap_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_grace(&self) -> Duration {
        Duration::from_secs(self.pong_grace_secs)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    pub fn peer_reconnect_cap(&self) -> Duration {
        Duration::from_secs(self.peer_reconnect_cap_secs)
    }
}

/// Return the bridge's home directory for default config resolution.
///
/// Resolution order: `BRIDGE_HOME` env var, then `$HOME/.browser-bridge`.
pub fn bridge_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("BRIDGE_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from(".")).join(".browser-bridge")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = BridgeConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[tokio::test]
    async fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.yaml");
        let cfg = BridgeConfig::load(&path).await.unwrap();
        assert_eq!(cfg.max_pending, crate::correlator::MAX_PENDING);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut cfg = BridgeConfig::default();
        cfg.max_pending = 7;
        cfg.save(&path).await.unwrap();
        let loaded = BridgeConfig::load(&path).await.unwrap();
        assert_eq!(loaded.max_pending, 7);
    }
}

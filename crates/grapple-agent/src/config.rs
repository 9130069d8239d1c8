//! Agent configuration, loaded from a TOML file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TopologyMode {
    /// The agent dials the control plane and keeps the channel open.
    Polling,
    /// The agent binds a socket and waits for the control plane to dial in.
    Listening,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AgentConfig {
    pub mode: TopologyMode,
    /// Control-plane address to dial (polling) or local address to bind
    /// (listening).
    pub address: String,
    /// Hex SHA-256 thumbprint of the control plane's certificate.
    pub trusted_thumbprint: String,
    /// Directory for the agent's TLS identity and script workspace.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Optional HTTP CONNECT proxy, polling mode only.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/grapple-agent")
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.state_dir.join("work")
    }
}

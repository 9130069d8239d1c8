use anyhow::{Context, Result, bail};
use grapple_transport::{ProxyEndpoint, ServiceEndpoint, Thumbprint};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    /// Address polling agents dial in to. Required when any agent polls.
    #[serde(default)]
    pub poll_bind: Option<String>,
    /// Directory for the server's TLS identity.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

/// One known agent and how to reach it.
#[derive(Deserialize, Debug, Clone)]
pub struct AgentEntry {
    pub name: String,
    pub thumbprint: String,
    /// Present for listening agents the server dials out to; absent for
    /// polling agents, which dial in on `poll_bind`.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/grapple-server")
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn agent(&self, name: &str) -> Result<&AgentEntry> {
        let Some(entry) = self.agents.iter().find(|a| a.name == name) else {
            bail!("no agent named {name:?} in config");
        };
        Ok(entry)
    }
}

impl AgentEntry {
    pub fn thumbprint(&self) -> Result<Thumbprint> {
        Thumbprint::parse(&self.thumbprint)
            .with_context(|| format!("agent {:?} has an invalid thumbprint", self.name))
    }

    /// Dial-out endpoint, for listening agents only.
    pub fn endpoint(&self) -> Result<Option<ServiceEndpoint>> {
        let Some(address) = &self.address else {
            return Ok(None);
        };
        let mut endpoint = ServiceEndpoint::new(address.clone(), self.thumbprint()?)
            .with_context(|| format!("agent {:?} has an invalid address", self.name))?;
        if let Some(proxy) = &self.proxy {
            endpoint = endpoint.with_proxy(ProxyEndpoint {
                address: proxy.clone(),
            });
        }
        Ok(Some(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_topology_config() {
        let config: ServerConfig = toml::from_str(&format!(
            r#"
            poll_bind = "0.0.0.0:10943"

            [[agents]]
            name = "web-01"
            thumbprint = "{a}"
            address = "10.0.0.5:10933"

            [[agents]]
            name = "db-01"
            thumbprint = "{b}"
            "#,
            a = "a".repeat(64),
            b = "b".repeat(64),
        ))
        .unwrap();

        assert_eq!(config.poll_bind.as_deref(), Some("0.0.0.0:10943"));
        let web = config.agent("web-01").unwrap();
        assert!(web.endpoint().unwrap().is_some());
        let db = config.agent("db-01").unwrap();
        assert!(db.endpoint().unwrap().is_none());
        assert!(config.agent("missing").is_err());
    }

    #[test]
    fn bad_thumbprint_surfaces_on_use() {
        let config: ServerConfig = toml::from_str(
            r#"
            [[agents]]
            name = "bad"
            thumbprint = "not-hex"
            "#,
        )
        .unwrap();
        assert!(config.agent("bad").unwrap().thumbprint().is_err());
    }
}

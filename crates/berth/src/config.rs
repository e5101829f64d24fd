//! berth.toml configuration: one endpoint, one pool.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use berth_pool::PoolConfig;
use berth_pool::tcp::TcpConnector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BerthConfig {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// `host:port` of the remote endpoint.
    pub address: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_recv_timeout_ms() -> u64 {
    30_000
}

fn default_nodelay() -> bool {
    true
}

impl EndpointConfig {
    pub fn connector(&self) -> TcpConnector {
        TcpConnector::new(self.address.clone())
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_recv_timeout(Duration::from_millis(self.recv_timeout_ms))
            .with_nodelay(self.nodelay)
    }
}

impl BerthConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: BerthConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.address.trim().is_empty() {
            anyhow::bail!("endpoint.address must not be empty");
        }
        if self.endpoint.connect_timeout_ms == 0 {
            anyhow::bail!("endpoint.connect_timeout_ms must be at least 1");
        }
        self.pool.validate()?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

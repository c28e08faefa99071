//! Storage server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use proto::config::{ClusterConfig, ConfigError, LogConfig, StripeConfig};
use sk_core::ServerId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreNodeConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub stripe: StripeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl StoreNodeConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        proto::config::load_yaml(path)
    }

    pub fn merge(&mut self, other: StoreNodeConfig) {
        self.server.merge(other.server);
        self.cluster.merge(other.cluster);
        self.stripe.merge(other.stripe);
        self.log.merge(other.log);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// This server's slot id in the cluster server list
    #[serde(default)]
    pub server_id: ServerId,
    /// Chunk pool size (pre-allocated chunks)
    #[serde(default = "default_chunk_pool_size")]
    pub chunk_pool_size: usize,
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            server_id: 0,
            chunk_pool_size: default_chunk_pool_size(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl ServerSection {
    fn merge(&mut self, other: Self) {
        self.server_id = other.server_id;
        if other.chunk_pool_size > 0 {
            self.chunk_pool_size = other.chunk_pool_size;
        }
        if other.heartbeat_interval_ms > 0 {
            self.heartbeat_interval_ms = other.heartbeat_interval_ms;
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn default_chunk_pool_size() -> usize {
    1024
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

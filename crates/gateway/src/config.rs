//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use proto::config::{ClusterConfig, ConfigError, LogConfig, StripeConfig};
use sk_core::InstanceId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub stripe: StripeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        proto::config::load_yaml(path)
    }

    pub fn merge(&mut self, other: GatewayConfig) {
        self.gateway.merge(other.gateway);
        self.cluster.merge(other.cluster);
        self.stripe.merge(other.stripe);
        self.log.merge(other.log);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// This gateway's instance id; must be unique and non-zero (zero is
    /// the coordinator's).
    #[serde(default = "default_instance_id")]
    pub instance_id: InstanceId,
    /// Application listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Worker task count
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pending request timeout in milliseconds; 0 disables expiry.
    #[serde(default = "default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            listen_addr: default_listen_addr(),
            workers: default_workers(),
            pending_timeout_ms: default_pending_timeout_ms(),
        }
    }
}

impl GatewaySection {
    fn merge(&mut self, other: Self) {
        if other.instance_id > 0 {
            self.instance_id = other.instance_id;
        }
        if !other.listen_addr.is_empty() {
            self.listen_addr = other.listen_addr;
        }
        if other.workers > 0 {
            self.workers = other.workers;
        }
        if other.pending_timeout_ms > 0 {
            self.pending_timeout_ms = other.pending_timeout_ms;
        }
    }

    pub fn pending_timeout(&self) -> Option<Duration> {
        if self.pending_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.pending_timeout_ms))
        }
    }
}

fn default_instance_id() -> InstanceId {
    1
}

fn default_listen_addr() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_pending_timeout_ms() -> u64 {
    30_000
}

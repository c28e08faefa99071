//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use proto::config::{ClusterConfig, ConfigError, LogConfig, StripeConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub stripe: StripeConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl CoordinatorConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        proto::config::load_yaml(path)
    }

    pub fn merge(&mut self, other: CoordinatorConfig) {
        self.cluster.merge(other.cluster);
        self.stripe.merge(other.stripe);
        self.service.merge(other.service);
        self.log.merge(other.log);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// A server missing heartbeats for this long is declared failed.
    #[serde(default = "default_failure_timeout_secs")]
    pub failure_timeout_secs: u64,
    /// Liveness sweep interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            failure_timeout_secs: default_failure_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl ServiceConfig {
    fn merge(&mut self, other: Self) {
        if other.failure_timeout_secs > 0 {
            self.failure_timeout_secs = other.failure_timeout_secs;
        }
        if other.sweep_interval_ms > 0 {
            self.sweep_interval_ms = other.sweep_interval_ms;
        }
    }

    pub fn failure_timeout(&self) -> Duration {
        Duration::from_secs(self.failure_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_failure_timeout_secs() -> u64 {
    10
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

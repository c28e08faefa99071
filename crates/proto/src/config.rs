//! Shared configuration sections
//!
//! Cluster topology, stripe geometry and logging are identical across the
//! coordinator, gateway and storage server configs, so the YAML sections
//! live here and each role composes them with its own settings.

use serde::{Deserialize, Serialize};

use coding::Scheme;
use sk_core::{InstanceId, ServerId};

/// Cluster topology: where every peer listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Coordinator listen address
    pub coordinator_addr: String,
    /// Gateway peers
    #[serde(default)]
    pub gateways: Vec<GatewayPeer>,
    /// Storage server peers, in slot order
    #[serde(default)]
    pub servers: Vec<ServerPeer>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: "127.0.0.1:9100".to_string(),
            gateways: Vec::new(),
            servers: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn merge(&mut self, other: Self) {
        if !other.coordinator_addr.is_empty() {
            self.coordinator_addr = other.coordinator_addr;
        }
        if !other.gateways.is_empty() {
            self.gateways = other.gateways;
        }
        if !other.servers.is_empty() {
            self.servers = other.servers;
        }
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.servers.iter().map(|s| s.id).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPeer {
    pub id: InstanceId,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPeer {
    pub id: ServerId,
    pub addr: String,
}

/// Stripe geometry: list count, k data + m parity slots, coding scheme and
/// the fixed chunk capacity. Must be identical on every peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeConfig {
    #[serde(default = "default_list_count")]
    pub list_count: u32,
    #[serde(default = "default_data_chunks")]
    pub data_chunks: u32,
    #[serde(default = "default_parity_chunks")]
    pub parity_chunks: u32,
    #[serde(default = "default_scheme")]
    pub scheme: Scheme,
    /// Chunk capacity in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            list_count: default_list_count(),
            data_chunks: default_data_chunks(),
            parity_chunks: default_parity_chunks(),
            scheme: default_scheme(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl StripeConfig {
    pub fn merge(&mut self, other: Self) {
        if other.list_count > 0 {
            self.list_count = other.list_count;
        }
        if other.data_chunks > 0 {
            self.data_chunks = other.data_chunks;
        }
        if other.parity_chunks > 0 {
            self.parity_chunks = other.parity_chunks;
        }
        self.scheme = other.scheme;
        if other.chunk_size > 0 {
            self.chunk_size = other.chunk_size;
        }
    }

    pub fn chunks_per_stripe(&self) -> u32 {
        self.data_chunks + self.parity_chunks
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    pub fn merge(&mut self, other: Self) {
        if !other.level.is_empty() {
            self.level = other.level;
        }
    }
}

// Default value functions

fn default_list_count() -> u32 {
    16
}

fn default_data_chunks() -> u32 {
    3
}

fn default_parity_chunks() -> u32 {
    1
}

fn default_scheme() -> Scheme {
    Scheme::Raid5
}

fn default_chunk_size() -> u32 {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load a YAML config file into any role config type.
pub fn load_yaml<T: for<'de> Deserialize<'de>>(
    path: impl AsRef<std::path::Path>,
) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripe_defaults() {
        let s = StripeConfig::default();
        assert_eq!(s.chunks_per_stripe(), 4);
        assert!(matches!(s.scheme, Scheme::Raid5));
    }

    #[test]
    fn test_cluster_yaml_parse() {
        let yaml = r#"
coordinator_addr: "10.0.0.1:9100"
servers:
  - { id: 0, addr: "10.0.0.2:9200" }
  - { id: 1, addr: "10.0.0.3:9200" }
"#;
        let c: ClusterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.servers.len(), 2);
        assert_eq!(c.server_ids(), vec![0, 1]);
    }

    #[test]
    fn test_merge_prefers_other_when_set() {
        let mut base = ClusterConfig::default();
        base.merge(ClusterConfig {
            coordinator_addr: "1.2.3.4:9100".to_string(),
            gateways: Vec::new(),
            servers: Vec::new(),
        });
        assert_eq!(base.coordinator_addr, "1.2.3.4:9100");
        // Empty fields keep the base value.
        base.merge(ClusterConfig {
            coordinator_addr: String::new(),
            gateways: Vec::new(),
            servers: Vec::new(),
        });
        assert_eq!(base.coordinator_addr, "1.2.3.4:9100");
    }
}

//! Configuration module for the balancer service
//!
//! Supports YAML configuration files with module-based organization

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::metadata::PlacementPath;
use crate::node_manager::NodeManagerConfig;
use crate::planner::PlannerConfig;
use crate::policy::{parse_preferred_zones, PlacementPolicy, DEFAULT_REPLICATION_FACTOR};
use crate::scheduler::RunLoopConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Run loop configuration
    #[serde(default)]
    pub balancer: RunLoopConfig,
    /// Planner configuration
    #[serde(default)]
    pub planner: PlannerConfig,
    /// Initial placement policy
    #[serde(default)]
    pub placement: PlacementConfig,
    /// Node manager configuration
    #[serde(default)]
    pub node_manager: NodeManagerConfig,
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl BalancerConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: BalancerConfig) {
        self.cluster.merge(other.cluster);
        self.balancer.merge(other.balancer);
        self.planner.merge(other.planner);
        self.placement.merge(other.placement);
        self.node_manager.merge(other.node_manager);
        self.server.merge(other.server);
        self.log.merge(other.log);
    }

    /// Reject settings the balancer cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.placement.policy()?;
        self.placement.zones()?;
        Ok(())
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
        }
    }
}

impl ClusterConfig {
    fn merge(&mut self, other: Self) {
        if !other.name.is_empty() {
            self.name = other.name;
        }
    }
}

/// Initial placement policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Block spec, e.g. `c.r.z0,c.r.z1:2`; empty places replicas anywhere
    #[serde(default)]
    pub blocks: String,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    /// Preferred leader zones, in priority order
    #[serde(default)]
    pub preferred_zones: Vec<String>,
    #[serde(default)]
    pub system_tables_use_preferred_zones: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            blocks: String::new(),
            replication_factor: default_replication_factor(),
            preferred_zones: Vec::new(),
            system_tables_use_preferred_zones: false,
        }
    }
}

impl PlacementConfig {
    fn merge(&mut self, other: Self) {
        if !other.blocks.is_empty() {
            self.blocks = other.blocks;
        }
        if other.replication_factor > 0 {
            self.replication_factor = other.replication_factor;
        }
        if !other.preferred_zones.is_empty() {
            self.preferred_zones = other.preferred_zones;
        }
        self.system_tables_use_preferred_zones |= other.system_tables_use_preferred_zones;
    }

    /// Parsed placement policy
    pub fn policy(&self) -> Result<PlacementPolicy, ConfigError> {
        PlacementPolicy::parse(&self.blocks, self.replication_factor)
    }

    /// Parsed preferred zones
    pub fn zones(&self) -> Result<Vec<PlacementPath>, ConfigError> {
        parse_preferred_zones(&self.preferred_zones)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP API listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

impl ServerConfig {
    fn merge(&mut self, other: Self) {
        if !other.http_addr.is_empty() {
            self.http_addr = other.http_addr;
        }
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
    fn merge(&mut self, other: Self) {
        if !other.level.is_empty() {
            self.level = other.level;
        }
    }
}

// Default value functions

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_replication_factor() -> u32 {
    DEFAULT_REPLICATION_FACTOR
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = BalancerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.cluster.name, "default");
        assert_eq!(config.balancer.tick_interval_ms, 1000);
        assert_eq!(config.planner.max_concurrent_moves, 8);
        assert_eq!(config.placement.replication_factor, 3);
        assert!(config.placement.policy().unwrap().is_anywhere());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_sections_parse() {
        let yaml = r#"
cluster:
  name: prod
balancer:
  tick_interval_ms: 250
planner:
  replica_move_weight: 20
placement:
  blocks: "aws.us.z0,aws.us.z1,aws.us.z2"
  preferred_zones: ["aws.us.z1"]
server:
  http_addr: "127.0.0.1:9000"
"#;
        let config = BalancerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.cluster.name, "prod");
        assert_eq!(config.balancer.tick_interval_ms, 250);
        assert_eq!(config.balancer.ack_timeout_ms, 30_000);
        assert_eq!(config.planner.replica_move_weight, 20);
        assert_eq!(config.placement.policy().unwrap().blocks.len(), 3);
        assert_eq!(config.placement.zones().unwrap().len(), 1);
        assert_eq!(config.server.http_addr, "127.0.0.1:9000");
    }

    #[test]
    fn test_invalid_placement_rejected() {
        let yaml = r#"
placement:
  blocks: "c.r.z0:2,c.r.z1:2"
  replication_factor: 3
"#;
        assert!(matches!(
            BalancerConfig::from_yaml(yaml),
            Err(ConfigError::BlockSumMismatch { .. })
        ));
        assert!(matches!(
            BalancerConfig::from_yaml("cluster: ["),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut base = BalancerConfig::default();
        let mut other = BalancerConfig::default();
        other.cluster.name = "other".to_string();
        other.placement.preferred_zones = vec!["c.r.z0".to_string()];
        other.log.level = String::new();
        base.merge(other);
        assert_eq!(base.cluster.name, "other");
        assert_eq!(base.placement.preferred_zones, vec!["c.r.z0".to_string()]);
        assert_eq!(base.log.level, "info");
    }
}

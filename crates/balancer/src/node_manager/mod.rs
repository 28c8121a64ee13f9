//! Node management module
//!
//! Responsible for node registration, heartbeats, draining and failure detection

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::metadata::{ClusterMetadata, NodeId, NodeInfo, NodeStatus};
use crate::watch::TopologyWatcher;

/// Node manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeManagerConfig {
    /// Heartbeat timeout (seconds) before a node is declared dead
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: i64,
    /// Heartbeat check interval (seconds)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_heartbeat_timeout_secs() -> i64 {
    30
}

fn default_check_interval_secs() -> u64 {
    10
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl NodeManagerConfig {
    pub fn merge(&mut self, other: Self) {
        if other.heartbeat_timeout_secs > 0 {
            self.heartbeat_timeout_secs = other.heartbeat_timeout_secs;
        }
        if other.check_interval_secs > 0 {
            self.check_interval_secs = other.check_interval_secs;
        }
    }
}

/// Node manager
///
/// Every status change bumps the topology watcher so the balancer reacts
/// without waiting for its next interval.
pub struct NodeManager {
    config: NodeManagerConfig,
    metadata: Arc<RwLock<ClusterMetadata>>,
    watcher: TopologyWatcher,
}

impl NodeManager {
    /// Create node manager
    pub fn new(
        config: NodeManagerConfig,
        metadata: Arc<RwLock<ClusterMetadata>>,
        watcher: TopologyWatcher,
    ) -> Self {
        Self {
            config,
            metadata,
            watcher,
        }
    }

    /// Register node
    pub async fn register(&self, node: NodeInfo) -> RegisterResult {
        let node_id = node.id.clone();
        let is_new = self.metadata.write().await.register_node(node);
        self.watcher.bump().await;

        if is_new {
            info!("New node registered: {}", node_id);
            RegisterResult::NewNode
        } else {
            info!("Node re-registered: {}", node_id);
            RegisterResult::Reconnected
        }
    }

    /// Handle heartbeat
    pub async fn heartbeat(&self, node_id: &NodeId) -> bool {
        let (found, changed) = {
            let mut metadata = self.metadata.write().await;
            let version = metadata.version;
            let found = metadata.node_heartbeat(node_id);
            (found, metadata.version != version)
        };
        if !found {
            warn!("Heartbeat from unknown node: {}", node_id);
            return false;
        }
        debug!("Heartbeat from node: {}", node_id);
        if changed {
            self.watcher.bump().await;
        }
        true
    }

    /// Actively drain node
    pub async fn drain_node(&self, node_id: &NodeId) -> bool {
        self.set_status(node_id, NodeStatus::Draining).await
    }

    /// Declare a node dead
    pub async fn mark_dead(&self, node_id: &NodeId) -> bool {
        self.set_status(node_id, NodeStatus::Dead).await
    }

    async fn set_status(&self, node_id: &NodeId, status: NodeStatus) -> bool {
        let found = self.metadata.write().await.set_node_status(node_id, status);
        if found {
            info!("Node {} is now {}", node_id, status);
            self.watcher.bump().await;
        }
        found
    }

    /// Remove node
    ///
    /// Its replicas stay assigned and are replaced by the balancer.
    pub async fn remove_node(&self, node_id: &NodeId) -> Option<NodeInfo> {
        let node = self.metadata.write().await.remove_node(node_id);
        if node.is_some() {
            info!("Node {} removed from cluster", node_id);
            self.watcher.bump().await;
        }
        node
    }

    /// Get node information
    pub async fn get_node(&self, node_id: &NodeId) -> Option<NodeInfo> {
        let metadata = self.metadata.read().await;
        metadata.nodes.get(node_id).cloned()
    }

    /// Get all nodes
    pub async fn list_nodes(&self) -> Vec<NodeInfo> {
        let metadata = self.metadata.read().await;
        metadata.nodes.values().cloned().collect()
    }

    /// Get alive nodes
    pub async fn alive_nodes(&self) -> Vec<NodeInfo> {
        let metadata = self.metadata.read().await;
        metadata
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Alive)
            .cloned()
            .collect()
    }

    /// Start heartbeat checker task
    pub fn start_heartbeat_checker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let check_interval = Duration::from_secs(self.config.check_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = interval(check_interval);
            loop {
                interval.tick().await;
                self.check_heartbeats().await;
            }
        })
    }

    /// Declare live nodes with expired heartbeats dead
    pub async fn check_heartbeats(&self) -> Vec<NodeId> {
        let timeout_secs = self.config.heartbeat_timeout_secs;
        let dead_nodes: Vec<NodeId> = {
            let mut metadata = self.metadata.write().await;
            let expired: Vec<NodeId> = metadata
                .nodes
                .values()
                .filter(|n| n.is_live() && n.is_heartbeat_timeout(timeout_secs))
                .map(|n| n.id.clone())
                .collect();
            for node_id in &expired {
                warn!("Node {} heartbeat timeout, marking as dead", node_id);
                metadata.set_node_status(node_id, NodeStatus::Dead);
            }
            expired
        };

        if !dead_nodes.is_empty() {
            info!("{} nodes marked as dead", dead_nodes.len());
            self.watcher.bump().await;
        }
        dead_nodes
    }
}

/// Registration result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegisterResult {
    /// New node
    NewNode,
    /// Reconnected node
    Reconnected,
}

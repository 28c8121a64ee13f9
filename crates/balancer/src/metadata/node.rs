//! Node information definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PlacementPath;

/// Node ID
pub type NodeId = String;

/// Node status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Alive, accepts replicas and leaders
    Alive,
    /// Alive but being emptied: replicas move away, nothing moves in
    Draining,
    /// Declared dead (deregistered or missed heartbeats)
    Dead,
    /// Not yet heard from, or partitioned
    #[default]
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Alive => write!(f, "alive"),
            NodeStatus::Draining => write!(f, "draining"),
            NodeStatus::Dead => write!(f, "dead"),
            NodeStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Node information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node ID
    pub id: NodeId,
    /// Placement path (cloud.region.zone)
    pub placement: PlacementPath,
    /// Node status
    pub status: NodeStatus,
    /// Last heartbeat time
    pub last_heartbeat: DateTime<Utc>,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Relative capacity; load is compared as count / weight
    #[serde(default = "default_capacity_weight")]
    pub capacity_weight: u32,
}

fn default_capacity_weight() -> u32 {
    1
}

impl NodeInfo {
    /// Create new node
    pub fn new(id: impl Into<NodeId>, placement: PlacementPath) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            placement,
            status: NodeStatus::Unknown,
            last_heartbeat: now,
            registered_at: now,
            capacity_weight: default_capacity_weight(),
        }
    }

    /// Set capacity weight (clamped to at least 1)
    pub fn with_capacity_weight(mut self, weight: u32) -> Self {
        self.capacity_weight = weight.max(1);
        self
    }

    /// Record a heartbeat
    ///
    /// Revives unknown nodes; dead nodes must re-register.
    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
        if self.status == NodeStatus::Unknown {
            self.status = NodeStatus::Alive;
        }
    }

    /// Check if the heartbeat is older than `timeout_secs`
    pub fn is_heartbeat_timeout(&self, timeout_secs: i64) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_heartbeat);
        elapsed.num_seconds() > timeout_secs
    }

    /// Alive or draining
    pub fn is_live(&self) -> bool {
        matches!(self.status, NodeStatus::Alive | NodeStatus::Draining)
    }

    /// Whether new replicas or leaders may be placed here
    pub fn accepts_data(&self) -> bool {
        self.status == NodeStatus::Alive
    }
}

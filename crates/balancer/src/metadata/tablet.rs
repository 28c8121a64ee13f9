//! Table and tablet information definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NodeId;

/// Table ID
pub type TableId = String;

/// Tablet ID
///
/// A tablet is a horizontal shard of a table; every tablet is replicated
/// independently and has at most one leader.
pub type TabletId = String;

/// Table information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table ID
    pub id: TableId,
    /// System tables (e.g. transaction status) may opt out of preferred zones
    #[serde(default)]
    pub system: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl TableInfo {
    pub fn new(id: impl Into<TableId>, system: bool) -> Self {
        Self {
            id: id.into(),
            system,
            created_at: Utc::now(),
        }
    }
}

/// Tablet information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletInfo {
    /// Tablet ID
    pub id: TabletId,
    /// Owning table
    pub table: TableId,
    /// Replica node list
    pub replicas: Vec<NodeId>,
    /// Current leader, none while an election is in progress
    pub leader: Option<NodeId>,
    /// Replication factor the tablet was created with
    pub replication_factor: u32,
}

impl TabletInfo {
    /// Create new tablet
    pub fn new(id: impl Into<TabletId>, table: impl Into<TableId>, replication_factor: u32) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            replicas: Vec::new(),
            leader: None,
            replication_factor,
        }
    }

    /// Add replica node
    pub fn add_replica(&mut self, node_id: NodeId) {
        if !self.replicas.contains(&node_id) {
            self.replicas.push(node_id);
        }
    }

    /// Remove replica node
    pub fn remove_replica(&mut self, node_id: &NodeId) {
        self.replicas.retain(|n| n != node_id);
        if self.leader.as_ref() == Some(node_id) {
            self.leader = None;
        }
    }

    /// Set leader
    pub fn set_leader(&mut self, node_id: NodeId) -> bool {
        if self.replicas.contains(&node_id) {
            self.leader = Some(node_id);
            true
        } else {
            false
        }
    }

    pub fn has_replica(&self, node_id: &NodeId) -> bool {
        self.replicas.contains(node_id)
    }

    pub fn is_led_by(&self, node_id: &NodeId) -> bool {
        self.leader.as_ref() == Some(node_id)
    }
}

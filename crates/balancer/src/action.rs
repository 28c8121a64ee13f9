//! Balancer actions
//!
//! The four commands the balancer can ask the cluster to perform.

use serde::{Deserialize, Serialize};

use crate::metadata::{NodeId, TableId, TabletId};

/// Action kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AddReplica,
    RemoveReplica,
    MoveReplica,
    TransferLeader,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::AddReplica => write!(f, "ADD_REPLICA"),
            ActionKind::RemoveReplica => write!(f, "REMOVE_REPLICA"),
            ActionKind::MoveReplica => write!(f, "MOVE_REPLICA"),
            ActionKind::TransferLeader => write!(f, "TRANSFER_LEADER"),
        }
    }
}

/// Idempotency key: the receiver ignores a duplicate of an in-flight key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionKey {
    pub tablet: TabletId,
    pub kind: ActionKind,
}

/// A corrective action on one tablet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerAction {
    pub kind: ActionKind,
    pub tablet: TabletId,
    pub table: TableId,
    /// Replica removed, or current leader for transfers
    pub source: Option<NodeId>,
    /// Replica added, or new leader for transfers
    pub destination: Option<NodeId>,
}

impl BalancerAction {
    pub fn add_replica(tablet: TabletId, table: TableId, destination: NodeId) -> Self {
        Self {
            kind: ActionKind::AddReplica,
            tablet,
            table,
            source: None,
            destination: Some(destination),
        }
    }

    pub fn remove_replica(tablet: TabletId, table: TableId, source: NodeId) -> Self {
        Self {
            kind: ActionKind::RemoveReplica,
            tablet,
            table,
            source: Some(source),
            destination: None,
        }
    }

    pub fn move_replica(tablet: TabletId, table: TableId, source: NodeId, destination: NodeId) -> Self {
        Self {
            kind: ActionKind::MoveReplica,
            tablet,
            table,
            source: Some(source),
            destination: Some(destination),
        }
    }

    /// Leadership transfer; `source` is none for leaderless tablets
    pub fn transfer_leader(
        tablet: TabletId,
        table: TableId,
        source: Option<NodeId>,
        destination: NodeId,
    ) -> Self {
        Self {
            kind: ActionKind::TransferLeader,
            tablet,
            table,
            source,
            destination: Some(destination),
        }
    }

    pub fn key(&self) -> ActionKey {
        ActionKey {
            tablet: self.tablet.clone(),
            kind: self.kind,
        }
    }

    /// Whether the action copies or drops data (everything but leader transfers)
    pub fn is_data_move(&self) -> bool {
        self.kind != ActionKind::TransferLeader
    }

    /// Whether losing `node` makes this action pointless
    ///
    /// Data and leadership must not be sent to a node that is gone, and a
    /// transfer away from a dead leader has nothing left to transfer.
    pub fn depends_on(&self, node: &NodeId) -> bool {
        if self.destination.as_ref() == Some(node) {
            return true;
        }
        self.kind == ActionKind::TransferLeader && self.source.as_ref() == Some(node)
    }
}

impl std::fmt::Display for BalancerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tablet={} {} -> {}",
            self.kind,
            self.tablet,
            self.source.as_deref().unwrap_or("-"),
            self.destination.as_deref().unwrap_or("-")
        )
    }
}

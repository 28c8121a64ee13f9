//! Collaborator interfaces
//!
//! The balancer reads cluster state through [`ClusterSource`], issues commands
//! through [`ActionDispatcher`] and persists validated policy through
//! [`PlacementAdmin`]. Dispatch acceptance is synchronous; completion comes
//! back later through the [`AckHandle`] handed to the dispatcher.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::action::BalancerAction;
use crate::error::{BalancerError, DispatchError};
use crate::metadata::{NodeInfo, PlacementPath, TableId, TableInfo, TabletId, TabletInfo};
use crate::policy::{PlacementPolicy, TablePolicy};

/// Monotonic id of a dispatched action
pub type ActionId = u64;

/// Read side of the cluster
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// All known nodes with placement, status, heartbeat and weight
    async fn topology(&self) -> Result<Vec<NodeInfo>, BalancerError>;

    async fn tables(&self) -> Result<Vec<TableInfo>, BalancerError>;

    /// Tablets of one table
    async fn tablet_assignment(&self, table: &TableId) -> Result<Vec<TabletInfo>, BalancerError>;

    /// Placement policy and preferred zones in force for one table
    async fn placement_policy(&self, table: &TableId) -> Result<TablePolicy, BalancerError>;

    /// Cluster-wide preferred zones, whether or not any table exists
    async fn preferred_zones(&self) -> Result<Vec<PlacementPath>, BalancerError>;
}

/// Command channel
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    /// Accept or reject an action; completion is reported through `ack`
    async fn dispatch(&self, action: BalancerAction, ack: AckHandle) -> Result<(), DispatchError>;
}

/// Persistence of validated policy
#[async_trait]
pub trait PlacementAdmin: Send + Sync {
    async fn store_placement(&self, policy: PlacementPolicy) -> Result<(), BalancerError>;

    async fn store_table_placement(&self, table: &TableId, policy: PlacementPolicy) -> Result<(), BalancerError>;

    async fn store_preferred_zones(&self, zones: Vec<PlacementPath>) -> Result<(), BalancerError>;

    async fn store_system_tables_use_preferred_zones(&self, enabled: bool) -> Result<(), BalancerError>;
}

/// Completion report of one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionAck {
    pub action_id: ActionId,
    pub tablet: TabletId,
    /// `Err` carries the failure reason
    pub outcome: Result<(), String>,
}

/// One-shot completion handle for a dispatched action
#[derive(Debug, Clone)]
pub struct AckHandle {
    action_id: ActionId,
    tablet: TabletId,
    tx: mpsc::UnboundedSender<ActionAck>,
}

impl AckHandle {
    pub fn new(action_id: ActionId, tablet: TabletId, tx: mpsc::UnboundedSender<ActionAck>) -> Self {
        Self { action_id, tablet, tx }
    }

    pub fn action_id(&self) -> ActionId {
        self.action_id
    }

    pub fn tablet(&self) -> &TabletId {
        &self.tablet
    }

    /// Report success
    pub fn complete(self) {
        self.send(Ok(()));
    }

    /// Report failure
    pub fn fail(self, reason: impl Into<String>) {
        self.send(Err(reason.into()));
    }

    fn send(self, outcome: Result<(), String>) {
        let ack = ActionAck {
            action_id: self.action_id,
            tablet: self.tablet,
            outcome,
        };
        // The run loop may have shut down; a late ack is meaningless then.
        if self.tx.send(ack).is_err() {
            debug!("Dropped ack for action {}: run loop gone", self.action_id);
        }
    }
}

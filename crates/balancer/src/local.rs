//! In-process cluster
//!
//! Backs all three collaborator traits with one [`ClusterMetadata`]. Actions
//! are applied to the metadata and acknowledged right away unless
//! acknowledgements are held. Faults can be injected to exercise the
//! balancer's failure handling.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::action::{ActionKey, BalancerAction};
use crate::cluster::{AckHandle, ActionDispatcher, ClusterSource, PlacementAdmin};
use crate::error::{BalancerError, ConfigError, DispatchError};
use crate::metadata::{
    ClusterMetadata, ClusterStats, NodeId, NodeInfo, PlacementPath, TableId, TableInfo, TabletInfo,
};
use crate::node_manager::{NodeManager, NodeManagerConfig};
use crate::policy::{PlacementPolicy, TablePolicy};
use crate::watch::TopologyWatcher;

#[derive(Debug, Default)]
struct FaultState {
    /// Actions whose destination is one of these nodes are refused
    rejected_nodes: BTreeSet<NodeId>,
    /// Accept actions but keep their acknowledgements until released
    hold_acks: bool,
    /// Every collaborator call fails
    unreachable: bool,
}

/// In-process cluster
#[derive(Clone)]
pub struct LocalCluster {
    metadata: Arc<RwLock<ClusterMetadata>>,
    node_manager: Arc<NodeManager>,
    watcher: TopologyWatcher,
    faults: Arc<Mutex<FaultState>>,
    held: Arc<Mutex<HashMap<ActionKey, (BalancerAction, AckHandle)>>>,
}

impl LocalCluster {
    pub fn new(name: impl Into<String>, config: NodeManagerConfig, watcher: TopologyWatcher) -> Self {
        let metadata = Arc::new(RwLock::new(ClusterMetadata::new(name.into())));
        let node_manager = Arc::new(NodeManager::new(config, metadata.clone(), watcher.clone()));
        Self {
            metadata,
            node_manager,
            watcher,
            faults: Arc::new(Mutex::new(FaultState::default())),
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    pub fn watcher(&self) -> &TopologyWatcher {
        &self.watcher
    }

    /// Copy of the current metadata
    pub async fn metadata(&self) -> ClusterMetadata {
        self.metadata.read().await.clone()
    }

    pub async fn stats(&self) -> ClusterStats {
        self.metadata.read().await.stats()
    }

    pub async fn tablets_of(&self, table: &TableId) -> Vec<TabletInfo> {
        let metadata = self.metadata.read().await;
        metadata
            .tablets
            .values()
            .filter(|t| &t.table == table)
            .cloned()
            .collect()
    }

    pub async fn node_load(&self, node: &NodeId) -> usize {
        self.metadata.read().await.node_load(node, None)
    }

    pub async fn node_leaders(&self, node: &NodeId) -> usize {
        self.metadata.read().await.node_leaders(node)
    }

    /// Create a table; each inner list is the initial replica set of one tablet
    ///
    /// Tablet creation is not a topology change and wakes nobody.
    pub async fn create_table(
        &self,
        table: TableInfo,
        replica_sets: Vec<Vec<NodeId>>,
    ) -> Result<Vec<TabletInfo>, String> {
        let table_id = table.id.clone();
        let tablets = self.metadata.write().await.create_table(table, replica_sets)?;
        info!("Created table {} with {} tablets", table_id, tablets.len());
        Ok(tablets)
    }

    pub async fn delete_table(&self, table: &TableId) -> Option<Vec<TabletInfo>> {
        let removed = self.metadata.write().await.delete_table(table)?;
        info!("Deleted table {} ({} tablets)", table, removed.len());
        Some(removed)
    }

    /// Refuse every action that would place data or leadership on `node`
    pub fn reject_actions_to(&self, node: impl Into<NodeId>) {
        self.faults.lock().rejected_nodes.insert(node.into());
    }

    pub fn hold_acks(&self, hold: bool) {
        self.faults.lock().hold_acks = hold;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.lock().unreachable = unreachable;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = FaultState::default();
    }

    pub fn held_actions(&self) -> usize {
        self.held.lock().len()
    }

    /// Apply and acknowledge every held action, returns how many succeeded
    pub async fn release_acks(&self) -> usize {
        let held: Vec<(BalancerAction, AckHandle)> = self.held.lock().drain().map(|(_, v)| v).collect();
        let mut applied = 0;
        for (action, ack) in held {
            if self.apply(&action, ack).await {
                applied += 1;
            }
        }
        applied
    }

    /// Fail every held action without applying it
    pub fn fail_held(&self, reason: &str) -> usize {
        let held: Vec<(BalancerAction, AckHandle)> = self.held.lock().drain().map(|(_, v)| v).collect();
        let count = held.len();
        for (_, ack) in held {
            ack.fail(reason);
        }
        count
    }

    async fn apply(&self, action: &BalancerAction, ack: AckHandle) -> bool {
        let result = self.metadata.write().await.apply_action(action);
        match result {
            Ok(()) => {
                debug!("Applied {}", action);
                ack.complete();
                true
            }
            Err(e) => {
                warn!("Failed to apply {}: {}", action, e);
                ack.fail(e.to_string());
                false
            }
        }
    }

    fn check_reachable(&self) -> Result<(), BalancerError> {
        if self.faults.lock().unreachable {
            return Err(BalancerError::TransientCluster("cluster unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterSource for LocalCluster {
    async fn topology(&self) -> Result<Vec<NodeInfo>, BalancerError> {
        self.check_reachable()?;
        Ok(self.metadata.read().await.nodes.values().cloned().collect())
    }

    async fn tables(&self) -> Result<Vec<TableInfo>, BalancerError> {
        self.check_reachable()?;
        Ok(self.metadata.read().await.tables.values().cloned().collect())
    }

    async fn tablet_assignment(&self, table: &TableId) -> Result<Vec<TabletInfo>, BalancerError> {
        self.check_reachable()?;
        let metadata = self.metadata.read().await;
        if !metadata.tables.contains_key(table) {
            return Err(ConfigError::UnknownTable(table.clone()).into());
        }
        Ok(metadata
            .tablets
            .values()
            .filter(|t| &t.table == table)
            .cloned()
            .collect())
    }

    async fn placement_policy(&self, table: &TableId) -> Result<TablePolicy, BalancerError> {
        self.check_reachable()?;
        self.metadata
            .read()
            .await
            .table_policy(table)
            .ok_or_else(|| ConfigError::UnknownTable(table.clone()).into())
    }

    async fn preferred_zones(&self) -> Result<Vec<PlacementPath>, BalancerError> {
        self.check_reachable()?;
        Ok(self.metadata.read().await.preferred_zones.clone())
    }
}

#[async_trait]
impl ActionDispatcher for LocalCluster {
    async fn dispatch(&self, action: BalancerAction, ack: AckHandle) -> Result<(), DispatchError> {
        let hold = {
            let faults = self.faults.lock();
            if faults.unreachable {
                return Err(DispatchError::Transport("cluster unreachable".to_string()));
            }
            if let Some(dest) = action.destination.as_ref().filter(|d| faults.rejected_nodes.contains(*d)) {
                return Err(DispatchError::Rejected(format!("node {} refuses {}", dest, action.kind)));
            }
            faults.hold_acks
        };

        self.metadata.read().await.validate_action(&action)?;

        if hold {
            // A retried key supersedes the earlier, already abandoned one.
            if self.held.lock().insert(action.key(), (action.clone(), ack)).is_some() {
                debug!("Duplicate in-flight action {}, keeping one", action);
            }
            return Ok(());
        }

        self.apply(&action, ack).await;
        Ok(())
    }
}

#[async_trait]
impl PlacementAdmin for LocalCluster {
    async fn store_placement(&self, policy: PlacementPolicy) -> Result<(), BalancerError> {
        self.check_reachable()?;
        self.metadata.write().await.set_placement(policy);
        Ok(())
    }

    async fn store_table_placement(&self, table: &TableId, policy: PlacementPolicy) -> Result<(), BalancerError> {
        self.check_reachable()?;
        self.metadata.write().await.set_table_placement(table, policy)?;
        Ok(())
    }

    async fn store_preferred_zones(&self, zones: Vec<PlacementPath>) -> Result<(), BalancerError> {
        self.check_reachable()?;
        self.metadata.write().await.set_preferred_zones(zones);
        Ok(())
    }

    async fn store_system_tables_use_preferred_zones(&self, enabled: bool) -> Result<(), BalancerError> {
        self.check_reachable()?;
        self.metadata
            .write()
            .await
            .set_system_tables_use_preferred_zones(enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn cluster() -> LocalCluster {
        let cluster = LocalCluster::new("test", NodeManagerConfig::default(), TopologyWatcher::new());
        for (id, zone) in [("n0", "c.r.z0"), ("n1", "c.r.z1"), ("n2", "c.r.z2")] {
            cluster
                .node_manager()
                .register(NodeInfo::new(id, zone.parse().unwrap()))
                .await;
        }
        cluster
            .create_table(TableInfo::new("t", false), vec![vec!["n0".into(), "n1".into()]])
            .await
            .unwrap();
        cluster
    }

    fn handle(id: u64) -> (AckHandle, mpsc::UnboundedReceiver<crate::cluster::ActionAck>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AckHandle::new(id, "t-tablet-0000".into(), tx), rx)
    }

    fn add_n2() -> BalancerAction {
        BalancerAction::add_replica("t-tablet-0000".into(), "t".into(), "n2".into())
    }

    #[tokio::test]
    async fn test_dispatch_applies_and_acks() {
        let cluster = cluster().await;
        let (ack, mut rx) = handle(1);
        cluster.dispatch(add_n2(), ack).await.unwrap();

        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.action_id, 1);
        assert!(ack.outcome.is_ok());
        assert_eq!(cluster.node_load(&"n2".to_string()).await, 1);

        // Now invalid: the replica exists.
        let (ack, _rx) = handle(2);
        assert!(cluster.dispatch(add_n2(), ack).await.is_err());
    }

    #[tokio::test]
    async fn test_held_acks_and_duplicates() {
        let cluster = cluster().await;
        cluster.hold_acks(true);
        let (first, _rx1) = handle(1);
        let (second, mut rx2) = handle(2);
        cluster.dispatch(add_n2(), first).await.unwrap();
        cluster.dispatch(add_n2(), second).await.unwrap();
        assert_eq!(cluster.held_actions(), 1);
        assert_eq!(cluster.node_load(&"n2".to_string()).await, 0);

        assert_eq!(cluster.release_acks().await, 1);
        assert_eq!(rx2.recv().await.unwrap().action_id, 2);
        assert_eq!(cluster.node_load(&"n2".to_string()).await, 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let cluster = cluster().await;
        cluster.reject_actions_to("n2");
        let (ack, _rx) = handle(1);
        assert!(matches!(
            cluster.dispatch(add_n2(), ack).await,
            Err(DispatchError::Rejected(_))
        ));

        cluster.set_unreachable(true);
        assert!(cluster.topology().await.unwrap_err().is_transient());
        cluster.clear_faults();
        assert_eq!(cluster.topology().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_table_and_quiet_table_changes() {
        let cluster = cluster().await;
        let version = cluster.watcher().version();
        assert!(matches!(
            cluster.placement_policy(&"nope".to_string()).await,
            Err(BalancerError::Config(ConfigError::UnknownTable(_)))
        ));
        cluster.delete_table(&"t".to_string()).await.unwrap();
        assert_eq!(cluster.watcher().version(), version);
        assert!(cluster.tables().await.unwrap().is_empty());
    }
}

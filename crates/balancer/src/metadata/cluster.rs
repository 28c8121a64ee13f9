//! Cluster metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{NodeId, NodeInfo, NodeStatus, PlacementPath, TableId, TableInfo, TabletId, TabletInfo};
use crate::action::{ActionKind, BalancerAction};
use crate::error::{ConfigError, DispatchError};
use crate::policy::{PlacementPolicy, TablePolicy};

/// Cluster metadata
///
/// Complete in-process cluster state: topology, tables, tablet assignment and
/// placement policy. `version` advances on every topology or policy change
/// (not on tablet creation or deletion) and drives the topology watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Cluster name
    pub name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Topology/policy version
    pub version: u64,
    /// Node information
    pub nodes: BTreeMap<NodeId, NodeInfo>,
    /// Tables
    pub tables: BTreeMap<TableId, TableInfo>,
    /// Tablet assignment
    pub tablets: BTreeMap<TabletId, TabletInfo>,
    /// Cluster-wide placement policy
    pub placement: PlacementPolicy,
    /// Per-table placement overrides
    pub table_placement: BTreeMap<TableId, PlacementPolicy>,
    /// Preferred leader zones, in priority order
    pub preferred_zones: Vec<PlacementPath>,
    /// Whether system tables follow the preferred zones
    pub system_tables_use_preferred_zones: bool,
}

impl ClusterMetadata {
    /// Create new cluster
    pub fn new(name: String) -> Self {
        let now = Utc::now();
        Self {
            name,
            created_at: now,
            updated_at: now,
            version: 0,
            nodes: BTreeMap::new(),
            tables: BTreeMap::new(),
            tablets: BTreeMap::new(),
            placement: PlacementPolicy::default(),
            table_placement: BTreeMap::new(),
            preferred_zones: Vec::new(),
            system_tables_use_preferred_zones: false,
        }
    }

    /// Bump version and timestamp
    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }

    /// Register node
    ///
    /// Registration counts as a heartbeat. Returns whether the node is new.
    pub fn register_node(&mut self, mut node: NodeInfo) -> bool {
        let is_new = !self.nodes.contains_key(&node.id);
        node.status = NodeStatus::Unknown;
        node.touch();
        self.nodes.insert(node.id.clone(), node);
        self.touch();
        is_new
    }

    /// Remove node
    ///
    /// Replicas hosted by the node stay in their tablets' replica sets until the
    /// balancer replaces them.
    pub fn remove_node(&mut self, node_id: &NodeId) -> Option<NodeInfo> {
        let node = self.nodes.remove(node_id)?;
        self.reelect_leaders_of(node_id);
        self.touch();
        Some(node)
    }

    /// Update node heartbeat
    pub fn node_heartbeat(&mut self, node_id: &NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return false;
        };
        let before = node.status;
        node.touch();
        if node.status != before {
            self.touch();
        }
        true
    }

    /// Set node status, returns false for unknown nodes
    pub fn set_node_status(&mut self, node_id: &NodeId, status: NodeStatus) -> bool {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return false;
        };
        if node.status != status {
            node.status = status;
            if status == NodeStatus::Dead {
                self.reelect_leaders_of(node_id);
            }
            self.touch();
        }
        true
    }

    /// Move leadership of tablets led by a lost node to a surviving replica
    fn reelect_leaders_of(&mut self, node_id: &NodeId) {
        let led: Vec<TabletId> = self
            .tablets
            .values()
            .filter(|t| t.is_led_by(node_id))
            .map(|t| t.id.clone())
            .collect();
        for tablet_id in led {
            if let Some(tablet) = self.tablets.get_mut(&tablet_id) {
                tablet.leader = None;
            }
            self.elect_leader(&tablet_id);
        }
    }

    /// Create a table with explicit initial replica lists, one per tablet
    ///
    /// The first replica of each tablet becomes its leader.
    pub fn create_table(
        &mut self,
        table: TableInfo,
        replica_sets: Vec<Vec<NodeId>>,
    ) -> Result<Vec<TabletInfo>, String> {
        if self.tables.contains_key(&table.id) {
            return Err(format!("Table {} already exists", table.id));
        }
        for node_id in replica_sets.iter().flatten() {
            if !self.nodes.contains_key(node_id) {
                return Err(format!("Node {} does not exist", node_id));
            }
        }

        let replication_factor = self.placement_for(&table.id).replication_factor;
        let mut created = Vec::with_capacity(replica_sets.len());
        for (i, replicas) in replica_sets.into_iter().enumerate() {
            let mut tablet = TabletInfo::new(
                format!("{}-tablet-{:04}", table.id, i),
                table.id.clone(),
                replication_factor,
            );
            for node_id in replicas {
                tablet.add_replica(node_id);
            }
            if let Some(leader) = tablet.replicas.first().cloned() {
                tablet.set_leader(leader);
            }
            self.tablets.insert(tablet.id.clone(), tablet.clone());
            created.push(tablet);
        }

        self.tables.insert(table.id.clone(), table);
        self.updated_at = Utc::now();
        Ok(created)
    }

    /// Delete a table and its tablets
    pub fn delete_table(&mut self, table_id: &TableId) -> Option<Vec<TabletInfo>> {
        self.tables.remove(table_id)?;
        let ids: Vec<TabletId> = self
            .tablets
            .values()
            .filter(|t| &t.table == table_id)
            .map(|t| t.id.clone())
            .collect();
        let removed = ids
            .iter()
            .filter_map(|id| self.tablets.remove(id))
            .collect();
        self.table_placement.remove(table_id);
        self.updated_at = Utc::now();
        Some(removed)
    }

    /// Placement policy in force for a table
    pub fn placement_for(&self, table_id: &TableId) -> &PlacementPolicy {
        self.table_placement.get(table_id).unwrap_or(&self.placement)
    }

    /// Policy reported to the balancer for a table
    pub fn table_policy(&self, table_id: &TableId) -> Option<TablePolicy> {
        let table = self.tables.get(table_id)?;
        Some(TablePolicy {
            placement: self.placement_for(table_id).clone(),
            preferred_zones: self.preferred_zones.clone(),
            leader_affinity: !table.system || self.system_tables_use_preferred_zones,
            system: table.system,
        })
    }

    /// Replace the cluster-wide placement policy
    pub fn set_placement(&mut self, policy: PlacementPolicy) {
        let replication_factor = policy.replication_factor;
        self.placement = policy;
        let overridden: Vec<TableId> = self.table_placement.keys().cloned().collect();
        for tablet in self.tablets.values_mut() {
            if !overridden.contains(&tablet.table) {
                tablet.replication_factor = replication_factor;
            }
        }
        self.touch();
    }

    /// Override the placement policy of one table
    pub fn set_table_placement(
        &mut self,
        table_id: &TableId,
        policy: PlacementPolicy,
    ) -> Result<(), ConfigError> {
        if !self.tables.contains_key(table_id) {
            return Err(ConfigError::UnknownTable(table_id.clone()));
        }
        for tablet in self.tablets.values_mut().filter(|t| &t.table == table_id) {
            tablet.replication_factor = policy.replication_factor;
        }
        self.table_placement.insert(table_id.clone(), policy);
        self.touch();
        Ok(())
    }

    /// Replace the preferred zone list
    pub fn set_preferred_zones(&mut self, zones: Vec<PlacementPath>) {
        self.preferred_zones = zones;
        self.touch();
    }

    pub fn set_system_tables_use_preferred_zones(&mut self, enabled: bool) {
        self.system_tables_use_preferred_zones = enabled;
        self.touch();
    }

    /// Check that an action can be applied to the current state
    pub fn validate_action(&self, action: &BalancerAction) -> Result<(), DispatchError> {
        let tablet = self
            .tablets
            .get(&action.tablet)
            .ok_or_else(|| DispatchError::UnknownTablet(action.tablet.clone()))?;

        if let Some(dest) = &action.destination {
            let accepts = self.nodes.get(dest).map(|n| n.accepts_data()).unwrap_or(false);
            if !accepts {
                return Err(DispatchError::IneligibleNode(dest.clone()));
            }
        }

        match action.kind {
            ActionKind::AddReplica | ActionKind::MoveReplica => {
                let dest = action.destination.as_ref().ok_or_else(|| {
                    DispatchError::Rejected(format!("{} without destination", action.kind))
                })?;
                if tablet.has_replica(dest) {
                    return Err(DispatchError::Rejected(format!(
                        "Tablet {} already has a replica on {}",
                        tablet.id, dest
                    )));
                }
            }
            _ => {}
        }

        match action.kind {
            ActionKind::RemoveReplica | ActionKind::MoveReplica => {
                let source = action.source.as_ref().ok_or_else(|| {
                    DispatchError::Rejected(format!("{} without source", action.kind))
                })?;
                if !tablet.has_replica(source) {
                    return Err(DispatchError::Rejected(format!(
                        "Tablet {} has no replica on {}",
                        tablet.id, source
                    )));
                }
            }
            ActionKind::TransferLeader => {
                let dest = action.destination.as_ref().ok_or_else(|| {
                    DispatchError::Rejected("TRANSFER_LEADER without destination".to_string())
                })?;
                if !tablet.has_replica(dest) {
                    return Err(DispatchError::Rejected(format!(
                        "Tablet {} has no replica on {}",
                        tablet.id, dest
                    )));
                }
                if tablet.leader != action.source {
                    return Err(DispatchError::Rejected(format!(
                        "Tablet {} is not led by {:?}",
                        tablet.id, action.source
                    )));
                }
            }
            ActionKind::AddReplica => {}
        }
        Ok(())
    }

    /// Apply an action to the tablet assignment
    pub fn apply_action(&mut self, action: &BalancerAction) -> Result<(), DispatchError> {
        self.validate_action(action)?;

        let tablet = self
            .tablets
            .get_mut(&action.tablet)
            .ok_or_else(|| DispatchError::UnknownTablet(action.tablet.clone()))?;

        if let Some(dest) = &action.destination {
            match action.kind {
                ActionKind::AddReplica | ActionKind::MoveReplica => tablet.add_replica(dest.clone()),
                ActionKind::TransferLeader => {
                    tablet.set_leader(dest.clone());
                }
                ActionKind::RemoveReplica => {}
            }
        }
        if let Some(source) = &action.source {
            if matches!(action.kind, ActionKind::RemoveReplica | ActionKind::MoveReplica) {
                tablet.remove_replica(source);
            }
        }

        self.elect_leader(&action.tablet);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Elect the lowest-id alive replica of a leaderless tablet
    pub fn elect_leader(&mut self, tablet_id: &TabletId) -> Option<NodeId> {
        let tablet = self.tablets.get(tablet_id)?;
        if tablet.leader.is_some() {
            return tablet.leader.clone();
        }
        let mut candidates: Vec<&NodeId> = tablet
            .replicas
            .iter()
            .filter(|id| self.nodes.get(*id).map(|n| n.accepts_data()).unwrap_or(false))
            .collect();
        candidates.sort();
        let leader = candidates.first().map(|id| (*id).clone())?;
        if let Some(tablet) = self.tablets.get_mut(tablet_id) {
            tablet.set_leader(leader.clone());
        }
        Some(leader)
    }

    /// Replicas hosted by a node, optionally restricted to one table
    pub fn node_load(&self, node_id: &NodeId, table: Option<&TableId>) -> usize {
        self.tablets
            .values()
            .filter(|t| table.map(|id| &t.table == id).unwrap_or(true))
            .filter(|t| t.has_replica(node_id))
            .count()
    }

    /// Leaders hosted by a node
    pub fn node_leaders(&self, node_id: &NodeId) -> usize {
        self.tablets.values().filter(|t| t.is_led_by(node_id)).count()
    }

    /// Get cluster statistics
    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            total_nodes: self.nodes.len(),
            alive_nodes: self
                .nodes
                .values()
                .filter(|n| n.status == NodeStatus::Alive)
                .count(),
            total_tables: self.tables.len(),
            total_tablets: self.tablets.len(),
            leaderless_tablets: self.tablets.values().filter(|t| t.leader.is_none()).count(),
            version: self.version,
        }
    }
}

/// Cluster statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub total_nodes: usize,
    pub alive_nodes: usize,
    pub total_tables: usize,
    pub total_tablets: usize,
    pub leaderless_tablets: usize,
    pub version: u64,
}

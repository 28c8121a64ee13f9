//! Per-tick cluster view
//!
//! A [`TopologySnapshot`] is taken once per tick and never changes while the
//! planner works on it. Nodes are indexed in a prefix trie keyed by placement
//! labels, so "nodes matching block X" is a walk down the trie.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::metadata::{NodeId, NodeInfo, NodeStatus, PlacementPath, TableId, TabletId, TabletInfo};
use crate::policy::ResolvedPolicy;

/// A node as seen by one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub placement: PlacementPath,
    /// Effective status (stale heartbeats turn `Alive` into `Unknown`)
    pub status: NodeStatus,
    pub weight: u32,
}

impl NodeView {
    /// Whether new replicas or leaders may be placed here
    pub fn accepts_data(&self) -> bool {
        self.status == NodeStatus::Alive
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, NodeStatus::Alive | NodeStatus::Draining)
    }
}

#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: BTreeMap<String, TrieNode>,
    /// Nodes whose placement ends exactly here
    nodes: BTreeSet<NodeId>,
}

impl TrieNode {
    fn collect(&self, out: &mut BTreeSet<NodeId>) {
        out.extend(self.nodes.iter().cloned());
        for child in self.children.values() {
            child.collect(out);
        }
    }
}

/// Prefix trie over placement labels
#[derive(Debug, Clone, Default)]
pub struct PlacementTrie {
    root: TrieNode,
}

impl PlacementTrie {
    pub fn insert(&mut self, path: &PlacementPath, node: NodeId) {
        let mut cursor = &mut self.root;
        for label in path.labels() {
            cursor = cursor.children.entry(label.clone()).or_default();
        }
        cursor.nodes.insert(node);
    }

    /// All nodes whose placement lies under `prefix`
    pub fn matching(&self, prefix: &PlacementPath) -> BTreeSet<NodeId> {
        let mut cursor = &self.root;
        for label in prefix.labels() {
            match cursor.children.get(label) {
                Some(child) => cursor = child,
                None => return BTreeSet::new(),
            }
        }
        let mut out = BTreeSet::new();
        cursor.collect(&mut out);
        out
    }
}

/// Immutable topology view
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    nodes: BTreeMap<NodeId, NodeView>,
    trie: PlacementTrie,
    pub taken_at: DateTime<Utc>,
}

impl TopologySnapshot {
    /// Build a snapshot; `Alive` nodes silent for longer than `staleness` become `Unknown`
    pub fn new(nodes: impl IntoIterator<Item = NodeInfo>, staleness: Duration, now: DateTime<Utc>) -> Self {
        let mut views = BTreeMap::new();
        let mut trie = PlacementTrie::default();
        for node in nodes {
            let stale = now.signed_duration_since(node.last_heartbeat) > staleness;
            let status = if node.status == NodeStatus::Alive && stale {
                NodeStatus::Unknown
            } else {
                node.status
            };
            trie.insert(&node.placement, node.id.clone());
            views.insert(
                node.id.clone(),
                NodeView {
                    id: node.id,
                    placement: node.placement,
                    status,
                    weight: node.capacity_weight.max(1),
                },
            );
        }
        Self {
            nodes: views,
            trie,
            taken_at: now,
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeView> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeView> {
        self.nodes.values()
    }

    pub fn accepts_data(&self, id: &NodeId) -> bool {
        self.nodes.get(id).map(|n| n.accepts_data()).unwrap_or(false)
    }

    pub fn is_live(&self, id: &NodeId) -> bool {
        self.nodes.get(id).map(|n| n.is_live()).unwrap_or(false)
    }

    /// Nodes in `Unknown` state; the tick is skipped while any exist
    pub fn unknown_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Unknown)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Nodes counted by `is_load_balanced`
    pub fn live_count(&self) -> usize {
        self.nodes.values().filter(|n| n.accepts_data()).count()
    }

    /// Alive nodes under a placement prefix, in id order
    pub fn alive_matching(&self, prefix: &PlacementPath) -> Vec<&NodeView> {
        self.trie
            .matching(prefix)
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.accepts_data())
            .collect()
    }
}

/// Everything one tick works from
#[derive(Debug, Clone)]
pub struct ClusterView {
    pub topology: TopologySnapshot,
    pub tablets: BTreeMap<TabletId, TabletInfo>,
    pub policies: BTreeMap<TableId, ResolvedPolicy>,
    /// Cluster preferred zone set, before per-table opt-outs
    pub preferred_zones: Vec<PlacementPath>,
}

impl ClusterView {
    pub fn policy_of(&self, tablet: &TabletInfo) -> Option<&ResolvedPolicy> {
        self.policies.get(&tablet.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, path: &str, status: NodeStatus) -> NodeInfo {
        let mut node = NodeInfo::new(id, path.parse().unwrap());
        node.status = status;
        node
    }

    #[test]
    fn test_trie_prefix_lookup() {
        let snapshot = TopologySnapshot::new(
            vec![
                node("n0", "c.r.z0", NodeStatus::Alive),
                node("n1", "c.r.z1", NodeStatus::Alive),
                node("n2", "c.r.z1", NodeStatus::Draining),
                node("n3", "c.r2.z0", NodeStatus::Alive),
            ],
            Duration::seconds(10),
            Utc::now(),
        );

        let ids = |prefix: &str| -> Vec<String> {
            snapshot
                .alive_matching(&prefix.parse().unwrap())
                .iter()
                .map(|n| n.id.clone())
                .collect()
        };
        assert_eq!(ids("c.r.z1"), vec!["n1"]);
        assert_eq!(ids("c.r"), vec!["n0", "n1"]);
        assert_eq!(ids("c"), vec!["n0", "n1", "n3"]);
        assert!(ids("c.r9").is_empty());
        assert_eq!(snapshot.alive_matching(&PlacementPath::root()).len(), 3);
    }

    #[test]
    fn test_stale_heartbeat_becomes_unknown() {
        let mut stale = node("n0", "c.r.z0", NodeStatus::Alive);
        stale.last_heartbeat = Utc::now() - Duration::seconds(60);
        let mut dead = node("n1", "c.r.z1", NodeStatus::Dead);
        dead.last_heartbeat = Utc::now() - Duration::seconds(60);

        let snapshot = TopologySnapshot::new(vec![stale, dead], Duration::seconds(10), Utc::now());
        assert_eq!(snapshot.unknown_nodes(), vec!["n0".to_string()]);
        assert_eq!(snapshot.node(&"n1".to_string()).unwrap().status, NodeStatus::Dead);
        assert_eq!(snapshot.live_count(), 0);
    }
}

//! Affinity and balance evaluation
//!
//! Pure functions over a [`ClusterView`]: which tablets break their placement
//! constraints, and how evenly replicas and leaders are spread inside each
//! placement group.
//!
//! A placement group is the set of alive nodes matched by one placement block
//! (the "anywhere" policy contributes the root block, i.e. every alive node).
//! Counts in a group only include valid replicas of tablets whose policy
//! carries that block, so tables sharing a block share a group.
//!
//! Leader groups are keyed by [`LeaderScope`]: tablets with an alive replica
//! in their effective preferred zones balance leaders among the preferred
//! nodes, all others among every alive node hosting one of their replicas.
//!
//! A group is skewed only if the planner could act on it: some replica move
//! that keeps the tablet's zone coverage, or some chain of leader transfers,
//! lowers the group's weighted imbalance.

use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::metadata::{NodeId, NodeStatus, PlacementPath, TabletId, TabletInfo};
use crate::policy::ResolvedPolicy;
use crate::topology::{ClusterView, TopologySnapshot};

/// Why a replica does not count toward its tablet's placement
///
/// Declaration order is removal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    NodeMissing,
    NodeDead,
    NodeUnknown,
    OutsidePlacement,
    NodeDraining,
}

/// Constraint violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Violation {
    /// A block holds fewer valid replicas than its minimum
    UnderPlaced {
        tablet: TabletId,
        block: PlacementPath,
        have: u32,
        need: u32,
        satisfiable: bool,
    },
    /// A block holds more valid replicas than its minimum
    OverReplicated {
        tablet: TabletId,
        block: PlacementPath,
        replicas: u32,
        target: u32,
    },
    /// Replica on a node that cannot hold it
    InvalidReplica {
        tablet: TabletId,
        node: NodeId,
        reason: InvalidReason,
        satisfiable: bool,
    },
    /// Leader outside the preferred zones although an alive replica is inside
    LeaderOutsidePreferred {
        tablet: TabletId,
        leader: Option<NodeId>,
    },
}

/// Identity of a violation, ignoring counts
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViolationKey {
    pub tablet: TabletId,
    pub kind: &'static str,
    pub subject: String,
}

impl Violation {
    pub fn tablet(&self) -> &TabletId {
        match self {
            Violation::UnderPlaced { tablet, .. }
            | Violation::OverReplicated { tablet, .. }
            | Violation::InvalidReplica { tablet, .. }
            | Violation::LeaderOutsidePreferred { tablet, .. } => tablet,
        }
    }

    /// Whether some compliant live destination exists
    pub fn is_satisfiable(&self) -> bool {
        match self {
            Violation::UnderPlaced { satisfiable, .. }
            | Violation::InvalidReplica { satisfiable, .. } => *satisfiable,
            Violation::OverReplicated { .. } | Violation::LeaderOutsidePreferred { .. } => true,
        }
    }

    /// Placement or replication violation, as opposed to a leader-affinity miss
    pub fn is_constraint(&self) -> bool {
        !matches!(self, Violation::LeaderOutsidePreferred { .. })
    }

    pub fn key(&self) -> ViolationKey {
        let (kind, subject) = match self {
            Violation::UnderPlaced { block, .. } => ("under_placed", block.to_string()),
            Violation::OverReplicated { block, .. } => ("over_replicated", block.to_string()),
            Violation::InvalidReplica { node, .. } => ("invalid_replica", node.clone()),
            Violation::LeaderOutsidePreferred { .. } => ("leader_outside_preferred", String::new()),
        };
        ViolationKey {
            tablet: self.tablet().clone(),
            kind,
            subject,
        }
    }
}

/// Valid replicas of one tablet inside one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlacement {
    pub path: PlacementPath,
    pub need: u32,
    pub valid: Vec<NodeId>,
}

impl BlockPlacement {
    pub fn have(&self) -> u32 {
        self.valid.len() as u32
    }
}

/// Placement analysis of one tablet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletPlacement {
    pub blocks: Vec<BlockPlacement>,
    /// Invalid replicas in removal order
    pub invalid: Vec<(NodeId, InvalidReason)>,
    /// Zones covered by valid replicas
    pub zones: BTreeSet<PlacementPath>,
}

impl TabletPlacement {
    pub fn analyze(topology: &TopologySnapshot, tablet: &TabletInfo, policy: &ResolvedPolicy) -> Self {
        let mut blocks: Vec<BlockPlacement> = policy
            .blocks
            .iter()
            .map(|b| BlockPlacement {
                path: b.path.clone(),
                need: b.min_replicas,
                valid: Vec::new(),
            })
            .collect();
        let mut invalid = Vec::new();
        let mut zones = BTreeSet::new();

        for replica in &tablet.replicas {
            let Some(node) = topology.node(replica) else {
                invalid.push((replica.clone(), InvalidReason::NodeMissing));
                continue;
            };
            let reason = match node.status {
                NodeStatus::Dead => Some(InvalidReason::NodeDead),
                NodeStatus::Unknown => Some(InvalidReason::NodeUnknown),
                NodeStatus::Draining => Some(InvalidReason::NodeDraining),
                NodeStatus::Alive => None,
            };
            if let Some(reason) = reason {
                invalid.push((replica.clone(), reason));
                continue;
            }
            match policy.block_index(&node.placement) {
                Some(i) => {
                    blocks[i].valid.push(replica.clone());
                    zones.insert(node.placement.clone());
                }
                None => invalid.push((replica.clone(), InvalidReason::OutsidePlacement)),
            }
        }

        invalid.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Self {
            blocks,
            invalid,
            zones,
        }
    }

    /// First block below its minimum
    pub fn short_block(&self) -> Option<usize> {
        self.blocks.iter().position(|b| b.have() < b.need)
    }

    /// First block above its minimum
    pub fn excess_block(&self) -> Option<usize> {
        self.blocks.iter().position(|b| b.have() > b.need)
    }

    pub fn block_of(&self, node: &NodeId) -> Option<usize> {
        self.blocks.iter().position(|b| b.valid.contains(node))
    }

    pub fn is_valid(&self, node: &NodeId) -> bool {
        self.block_of(node).is_some()
    }

    pub fn valid_replicas(&self) -> impl Iterator<Item = &NodeId> {
        self.blocks.iter().flat_map(|b| b.valid.iter())
    }
}

/// Scope a tablet's leader is balanced in
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeaderScope {
    Unconstrained,
    Preferred(Vec<PlacementPath>),
}

impl LeaderScope {
    /// Whether a node placement may hold leaders of this scope
    pub fn admits(&self, placement: &PlacementPath) -> bool {
        match self {
            LeaderScope::Unconstrained => true,
            LeaderScope::Preferred(zones) => zones.iter().any(|z| z.contains(placement)),
        }
    }
}

impl fmt::Display for LeaderScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaderScope::Unconstrained => write!(f, "unconstrained"),
            LeaderScope::Preferred(zones) => {
                let zones: Vec<String> = zones.iter().map(|z| z.to_string()).collect();
                write!(f, "preferred:{}", zones.join("|"))
            }
        }
    }
}

impl Serialize for LeaderScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Leader scope of a tablet
pub fn leader_scope(
    topology: &TopologySnapshot,
    placement: &TabletPlacement,
    policy: &ResolvedPolicy,
) -> LeaderScope {
    if !policy.has_preferred_zones() {
        return LeaderScope::Unconstrained;
    }
    let in_zone = placement.valid_replicas().any(|id| {
        topology
            .node(id)
            .map(|n| policy.is_preferred(&n.placement))
            .unwrap_or(false)
    });
    if in_zone {
        LeaderScope::Preferred(policy.preferred_zones.clone())
    } else {
        LeaderScope::Unconstrained
    }
}

/// Load of one group member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemberLoad {
    pub count: u64,
    pub weight: u32,
}

impl MemberLoad {
    pub fn new(weight: u32) -> Self {
        Self {
            count: 0,
            weight: weight.max(1),
        }
    }
}

/// Compare `count / weight` without division
pub fn cmp_load(a: MemberLoad, b: MemberLoad) -> Ordering {
    (a.count * b.weight as u64).cmp(&(b.count * a.weight as u64))
}

/// Whether moving one unit from `donor` to `receiver` lowers sum(count^2 / weight)
pub fn improves(donor: MemberLoad, receiver: MemberLoad) -> bool {
    if donor.count == 0 {
        return false;
    }
    (2 * donor.count - 1) * receiver.weight as u64 > (2 * receiver.count + 1) * donor.weight as u64
}

/// Per-node counts of one group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupLoad {
    pub members: BTreeMap<NodeId, MemberLoad>,
    /// max - min of raw counts
    pub spread: u64,
    /// Some move the planner may make would improve the balance
    pub skewed: bool,
}

impl GroupLoad {
    fn join(&mut self, node: &NodeId, weight: u32) -> &mut MemberLoad {
        self.members
            .entry(node.clone())
            .or_insert_with(|| MemberLoad::new(weight))
    }

    fn finalize(&mut self) {
        let counts = self.members.values().map(|m| m.count);
        self.spread = match (counts.clone().max(), counts.min()) {
            (Some(max), Some(min)) => max - min,
            _ => 0,
        };
    }

    pub fn load(&self, node: &NodeId) -> Option<MemberLoad> {
        self.members.get(node).copied()
    }

    /// Members heaviest first, ties by id
    pub fn donors(&self) -> Vec<(&NodeId, MemberLoad)> {
        let mut members: Vec<_> = self.members.iter().map(|(id, m)| (id, *m)).collect();
        members.sort_by(|a, b| cmp_load(b.1, a.1).then_with(|| a.0.cmp(b.0)));
        members
    }

    /// Members lightest first, ties by id
    pub fn receivers(&self) -> Vec<(&NodeId, MemberLoad)> {
        let mut members: Vec<_> = self.members.iter().map(|(id, m)| (id, *m)).collect();
        members.sort_by(|a, b| cmp_load(a.1, b.1).then_with(|| a.0.cmp(b.0)));
        members
    }
}

/// Whether moving a tablet's replica from `donor` to `receiver` keeps every zone it covers
pub fn keeps_zone_coverage(
    topology: &TopologySnapshot,
    placement: &TabletPlacement,
    donor: &NodeId,
    receiver: &NodeId,
) -> bool {
    let zones: BTreeSet<&PlacementPath> = placement
        .valid_replicas()
        .filter(|id| *id != donor)
        .chain(std::iter::once(receiver))
        .filter_map(|id| topology.node(id).map(|n| &n.placement))
        .collect();
    zones.len() >= placement.zones.len()
}

/// Some move of this tablet's replicas inside `block` improves the group
fn has_improving_move(
    topology: &TopologySnapshot,
    group: &GroupLoad,
    tablet: &TabletInfo,
    placement: &TabletPlacement,
    block: &BlockPlacement,
) -> bool {
    block.valid.iter().any(|donor| {
        let Some(donor_load) = group.load(donor) else {
            return false;
        };
        group.members.iter().any(|(receiver, receiver_load)| {
            !tablet.has_replica(receiver)
                && improves(donor_load, *receiver_load)
                && keeps_zone_coverage(topology, placement, donor, receiver)
        })
    })
}

/// Leader hand-offs of one leader group
///
/// `hand_offs[u][v]` is the lowest-id tablet led by `u` with a valid replica on `v`.
pub type HandOffs = BTreeMap<NodeId, BTreeMap<NodeId, TabletId>>;

/// Record the leader transfers one tablet allows inside `scope`
pub fn add_hand_offs(
    hand_offs: &mut HandOffs,
    topology: &TopologySnapshot,
    tablet: &TabletInfo,
    placement: &TabletPlacement,
    scope: &LeaderScope,
) {
    let admitted = |id: &NodeId| {
        topology
            .node(id)
            .map(|n| scope.admits(&n.placement))
            .unwrap_or(false)
    };
    let Some(leader) = tablet.leader.as_ref() else {
        return;
    };
    if !placement.is_valid(leader) || !admitted(leader) {
        return;
    }
    for id in placement.valid_replicas().filter(|id| *id != leader && admitted(*id)) {
        hand_offs
            .entry(leader.clone())
            .or_default()
            .entry(id.clone())
            .or_insert_with(|| tablet.id.clone());
    }
}

/// One leader transfer of a chain: (from, to, tablet)
pub type HandOff = (NodeId, NodeId, TabletId);

/// Shortest chain of transfers moving one leadership from a heavier member to a lighter one
///
/// Intermediate members give one leadership and take one, so only the two
/// ends change. Donors are tried heaviest first, receivers lightest first.
pub fn transfer_chain(group: &GroupLoad, hand_offs: &HandOffs) -> Option<Vec<HandOff>> {
    for (donor, donor_load) in group.donors() {
        let mut parent: BTreeMap<&NodeId, (&NodeId, &TabletId)> = BTreeMap::new();
        let mut queue = VecDeque::from([donor]);
        while let Some(from) = queue.pop_front() {
            let Some(next) = hand_offs.get(from) else {
                continue;
            };
            for (to, tablet) in next {
                if to == donor || parent.contains_key(to) || !group.members.contains_key(to) {
                    continue;
                }
                parent.insert(to, (from, tablet));
                queue.push_back(to);
            }
        }

        for (receiver, receiver_load) in group.receivers() {
            if !parent.contains_key(receiver) || !improves(donor_load, receiver_load) {
                continue;
            }
            let mut chain = Vec::new();
            let mut cursor = receiver;
            while let Some(&(from, tablet)) = parent.get(cursor) {
                chain.push((from.clone(), cursor.clone(), tablet.clone()));
                cursor = from;
            }
            chain.reverse();
            return Some(chain);
        }
    }
    None
}

/// Replicas and leaders hosted in one zone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ZoneLoad {
    pub replicas: u64,
    pub leaders: u64,
}

/// Result of evaluating one cluster view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub violations: Vec<Violation>,
    pub replica_groups: BTreeMap<PlacementPath, GroupLoad>,
    pub leader_groups: BTreeMap<LeaderScope, GroupLoad>,
    pub zones: BTreeMap<PlacementPath, ZoneLoad>,
    pub node_replicas: BTreeMap<NodeId, u64>,
    pub node_leaders: BTreeMap<NodeId, u64>,
    pub max_replica_spread: u64,
    pub max_leader_spread: u64,
    pub leaders_on_preferred_only: bool,
    pub system_leaders_spread: bool,
    pub live_nodes: usize,
    pub tablets: usize,
}

impl Evaluation {
    /// Zero violations and no improvable group
    pub fn is_balanced(&self) -> bool {
        self.violations.is_empty()
            && self.replica_groups.values().all(|g| !g.skewed)
            && self.leader_groups.values().all(|g| !g.skewed)
    }

    pub fn unsatisfiable(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| !v.is_satisfiable())
    }

    /// Keys of a tablet's placement and replication violations
    pub fn constraint_keys(&self, tablet: &TabletId) -> BTreeSet<ViolationKey> {
        self.violations
            .iter()
            .filter(|v| v.tablet() == tablet && v.is_constraint())
            .map(Violation::key)
            .collect()
    }
}

/// Violations of one tablet
pub fn tablet_violations(
    topology: &TopologySnapshot,
    tablet: &TabletInfo,
    policy: &ResolvedPolicy,
    placement: &TabletPlacement,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    let has_receiver = |path: &PlacementPath| {
        topology
            .alive_matching(path)
            .iter()
            .any(|n| !tablet.has_replica(&n.id))
    };

    let short = placement.short_block();
    for block in &placement.blocks {
        match block.have().cmp(&block.need) {
            Ordering::Less => violations.push(Violation::UnderPlaced {
                tablet: tablet.id.clone(),
                block: block.path.clone(),
                have: block.have(),
                need: block.need,
                satisfiable: has_receiver(&block.path),
            }),
            Ordering::Greater => violations.push(Violation::OverReplicated {
                tablet: tablet.id.clone(),
                block: block.path.clone(),
                replicas: block.have(),
                target: block.need,
            }),
            Ordering::Equal => {}
        }
    }

    let removable = match short {
        None => true,
        Some(i) => has_receiver(&placement.blocks[i].path),
    };
    for (node, reason) in &placement.invalid {
        violations.push(Violation::InvalidReplica {
            tablet: tablet.id.clone(),
            node: node.clone(),
            reason: *reason,
            satisfiable: removable,
        });
    }

    if let LeaderScope::Preferred(zones) = leader_scope(topology, placement, policy) {
        let scope = LeaderScope::Preferred(zones);
        let leader_ok = tablet
            .leader
            .as_ref()
            .filter(|l| placement.is_valid(l))
            .and_then(|l| topology.node(l))
            .map(|n| scope.admits(&n.placement))
            .unwrap_or(false);
        if !leader_ok {
            violations.push(Violation::LeaderOutsidePreferred {
                tablet: tablet.id.clone(),
                leader: tablet.leader.clone(),
            });
        }
    }

    violations
}

/// Evaluate a cluster view
pub fn evaluate(view: &ClusterView) -> Evaluation {
    let topology = &view.topology;
    let mut eval = Evaluation {
        live_nodes: topology.live_count(),
        ..Default::default()
    };

    for node in topology.nodes() {
        eval.node_replicas.insert(node.id.clone(), 0);
        eval.node_leaders.insert(node.id.clone(), 0);
        eval.zones.entry(node.placement.clone()).or_default();
    }

    for policy in view.policies.values() {
        for block in &policy.blocks {
            eval.replica_groups.entry(block.path.clone()).or_insert_with(|| {
                let mut group = GroupLoad::default();
                for node in topology.alive_matching(&block.path) {
                    group.join(&node.id, node.weight);
                }
                group
            });
        }
    }

    let mut system_leaders = GroupLoad::default();
    let mut leaders_on_preferred_only = !view.preferred_zones.is_empty();
    let cluster_scope = LeaderScope::Preferred(view.preferred_zones.clone());
    let mut hand_offs: BTreeMap<LeaderScope, HandOffs> = BTreeMap::new();
    let mut analyzed = Vec::with_capacity(view.tablets.len());

    for tablet in view.tablets.values() {
        let Some(policy) = view.policy_of(tablet) else {
            continue;
        };
        eval.tablets += 1;
        let placement = TabletPlacement::analyze(topology, tablet, policy);
        eval.violations
            .extend(tablet_violations(topology, tablet, policy, &placement));

        for replica in &tablet.replicas {
            if let Some(node) = topology.node(replica) {
                *eval.node_replicas.entry(replica.clone()).or_default() += 1;
                eval.zones.entry(node.placement.clone()).or_default().replicas += 1;
            }
        }
        let leader = tablet.leader.as_ref().and_then(|l| topology.node(l));
        if let Some(node) = leader {
            *eval.node_leaders.entry(node.id.clone()).or_default() += 1;
            eval.zones.entry(node.placement.clone()).or_default().leaders += 1;
        }
        // Leader counts only where the leader holds a valid replica.
        let valid_leader = leader.filter(|n| placement.is_valid(&n.id));

        for block in &placement.blocks {
            if let Some(group) = eval.replica_groups.get_mut(&block.path) {
                for node in &block.valid {
                    if let Some(member) = group.members.get_mut(node) {
                        member.count += 1;
                    }
                }
            }
        }

        let scope = leader_scope(topology, &placement, policy);
        let group = eval.leader_groups.entry(scope.clone()).or_default();
        for id in placement.valid_replicas() {
            if let Some(node) = topology.node(id).filter(|n| scope.admits(&n.placement)) {
                group.join(id, node.weight);
            }
        }
        if let Some(node) = valid_leader.filter(|n| scope.admits(&n.placement)) {
            group.join(&node.id, node.weight).count += 1;
        }
        let scope_hand_offs = hand_offs.entry(scope.clone()).or_default();
        add_hand_offs(scope_hand_offs, topology, tablet, &placement, &scope);

        if policy.system {
            for id in placement.valid_replicas() {
                if let Some(node) = topology.node(id) {
                    system_leaders.join(id, node.weight);
                }
            }
            if let Some(node) = valid_leader {
                system_leaders.join(&node.id, node.weight).count += 1;
            }
        }

        if leaders_on_preferred_only {
            let in_zone = placement.valid_replicas().any(|id| {
                topology
                    .node(id)
                    .map(|n| cluster_scope.admits(&n.placement))
                    .unwrap_or(false)
            });
            let leader_in_zone = valid_leader
                .map(|n| cluster_scope.admits(&n.placement))
                .unwrap_or(false);
            if in_zone && !leader_in_zone {
                leaders_on_preferred_only = false;
            }
        }
        analyzed.push((tablet, placement));
    }

    for group in eval
        .replica_groups
        .values_mut()
        .chain(eval.leader_groups.values_mut())
    {
        group.finalize();
    }
    system_leaders.finalize();

    for (tablet, placement) in &analyzed {
        for block in &placement.blocks {
            if let Some(group) = eval.replica_groups.get_mut(&block.path) {
                if !group.skewed && has_improving_move(topology, group, tablet, placement, block) {
                    group.skewed = true;
                }
            }
        }
    }
    for (scope, group) in eval.leader_groups.iter_mut() {
        group.skewed = hand_offs
            .get(scope)
            .map(|h| transfer_chain(group, h).is_some())
            .unwrap_or(false);
    }

    eval.max_replica_spread = eval.replica_groups.values().map(|g| g.spread).max().unwrap_or(0);
    eval.max_leader_spread = eval.leader_groups.values().map(|g| g.spread).max().unwrap_or(0);
    eval.leaders_on_preferred_only = leaders_on_preferred_only;
    eval.system_leaders_spread = system_leaders.spread <= 1;
    eval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{NodeInfo, TableId};
    use crate::policy::{PlacementPolicy, TablePolicy};
    use chrono::{Duration, Utc};

    fn view(
        nodes: &[(&str, &str, NodeStatus)],
        tablets: &[(&str, &[&str], Option<&str>)],
        placement: PlacementPolicy,
        preferred: &[&str],
    ) -> ClusterView {
        let topology = TopologySnapshot::new(
            nodes.iter().map(|(id, path, status)| {
                let mut node = NodeInfo::new(*id, path.parse().unwrap());
                node.status = *status;
                node
            }),
            Duration::seconds(30),
            Utc::now(),
        );
        let preferred_zones: Vec<PlacementPath> = preferred.iter().map(|z| z.parse().unwrap()).collect();
        let table: TableId = "t".to_string();
        let mut policies = BTreeMap::new();
        policies.insert(
            table.clone(),
            ResolvedPolicy::resolve(
                table.clone(),
                TablePolicy {
                    placement: placement.clone(),
                    preferred_zones: preferred_zones.clone(),
                    leader_affinity: true,
                    system: false,
                },
            ),
        );
        let tablets = tablets
            .iter()
            .map(|(id, replicas, leader)| {
                let mut tablet = TabletInfo::new(*id, table.clone(), placement.replication_factor);
                for r in replicas.iter() {
                    tablet.add_replica(r.to_string());
                }
                tablet.leader = leader.map(str::to_string);
                (tablet.id.clone(), tablet)
            })
            .collect();
        ClusterView {
            topology,
            tablets,
            policies,
            preferred_zones,
        }
    }

    const THREE_ZONES: &[(&str, &str, NodeStatus)] = &[
        ("n0", "c.r.z0", NodeStatus::Alive),
        ("n1", "c.r.z1", NodeStatus::Alive),
        ("n2", "c.r.z2", NodeStatus::Alive),
    ];

    #[test]
    fn test_balanced_cluster() {
        let v = view(
            THREE_ZONES,
            &[
                ("a", &["n0", "n1", "n2"], Some("n0")),
                ("b", &["n0", "n1", "n2"], Some("n1")),
                ("c", &["n0", "n1", "n2"], Some("n2")),
            ],
            PlacementPolicy::default(),
            &[],
        );
        let eval = evaluate(&v);
        assert!(eval.violations.is_empty());
        assert!(eval.is_balanced());
        assert_eq!(eval.max_leader_spread, 0);
        assert!(!eval.leaders_on_preferred_only);
        assert_eq!(eval.node_replicas["n0"], 3);
    }

    #[test]
    fn test_under_placed_and_leader_skew() {
        let v = view(
            THREE_ZONES,
            &[
                ("a", &["n0", "n1"], Some("n0")),
                ("b", &["n0", "n1", "n2"], Some("n0")),
                ("c", &["n0", "n1", "n2"], Some("n0")),
            ],
            PlacementPolicy::default(),
            &[],
        );
        let eval = evaluate(&v);
        assert_eq!(
            eval.violations,
            vec![Violation::UnderPlaced {
                tablet: "a".into(),
                block: PlacementPath::root(),
                have: 2,
                need: 3,
                satisfiable: true,
            }]
        );
        let leaders = &eval.leader_groups[&LeaderScope::Unconstrained];
        assert_eq!(leaders.spread, 3);
        assert!(leaders.skewed);
        assert!(!eval.is_balanced());
    }

    #[test]
    fn test_invalid_replicas_ordered_for_removal() {
        let v = view(
            &[
                ("n0", "c.r.z0", NodeStatus::Alive),
                ("n1", "c.r.z1", NodeStatus::Draining),
                ("n2", "c.r.z2", NodeStatus::Dead),
                ("n3", "c.r.z3", NodeStatus::Alive),
            ],
            &[("a", &["n0", "n1", "n2", "n3"], Some("n0"))],
            PlacementPolicy::parse("c.r.z0,c.r.z1,c.r.z2", 3).unwrap(),
            &[],
        );
        let tablet = &v.tablets["a"];
        let placement = TabletPlacement::analyze(&v.topology, tablet, &v.policies["t"]);
        let order: Vec<_> = placement.invalid.iter().map(|(n, r)| (n.as_str(), *r)).collect();
        assert_eq!(
            order,
            vec![
                ("n2", InvalidReason::NodeDead),
                ("n3", InvalidReason::OutsidePlacement),
                ("n1", InvalidReason::NodeDraining),
            ]
        );
        // z1 and z2 have no alive node left to receive a replica.
        let eval = evaluate(&v);
        assert_eq!(eval.unsatisfiable().count(), 5);
    }

    #[test]
    fn test_leader_outside_preferred() {
        let v = view(
            THREE_ZONES,
            &[
                ("a", &["n0", "n1", "n2"], Some("n0")),
                ("b", &["n0", "n1", "n2"], Some("n1")),
            ],
            PlacementPolicy::default(),
            &["c.r.z1"],
        );
        let eval = evaluate(&v);
        assert_eq!(
            eval.violations,
            vec![Violation::LeaderOutsidePreferred {
                tablet: "a".into(),
                leader: Some("n0".into()),
            }]
        );
        assert!(!eval.leaders_on_preferred_only);
        let scope = LeaderScope::Preferred(vec!["c.r.z1".parse().unwrap()]);
        assert_eq!(eval.leader_groups[&scope].members.len(), 1);
    }

    #[test]
    fn test_weighted_balance() {
        let heavy = MemberLoad { count: 4, weight: 2 };
        let light = MemberLoad { count: 2, weight: 1 };
        assert!(!improves(heavy, light));
        assert!(!improves(light, heavy));
        assert_eq!(cmp_load(heavy, light), Ordering::Equal);

        let uniform_hi = MemberLoad { count: 3, weight: 1 };
        let uniform_lo = MemberLoad { count: 1, weight: 1 };
        assert!(improves(uniform_hi, uniform_lo));
        assert!(!improves(MemberLoad { count: 2, weight: 1 }, uniform_lo));
    }

    #[test]
    fn test_block_groups_span_only_matching_nodes() {
        let v = view(
            &[
                ("n0", "c.r.z0", NodeStatus::Alive),
                ("n1", "c.r.z1", NodeStatus::Alive),
                ("n2", "c.r.z2", NodeStatus::Alive),
                ("n3", "c.r.z1", NodeStatus::Alive),
            ],
            &[
                ("a", &["n0", "n1", "n2"], Some("n0")),
                ("b", &["n0", "n1", "n2"], Some("n1")),
                ("c", &["n0", "n1", "n2"], Some("n2")),
            ],
            PlacementPolicy::parse("c.r.z0,c.r.z1,c.r.z2", 3).unwrap(),
            &[],
        );
        let eval = evaluate(&v);
        let z1 = &eval.replica_groups[&"c.r.z1".parse::<PlacementPath>().unwrap()];
        assert_eq!(z1.members.len(), 2);
        assert_eq!(z1.spread, 3);
        assert!(z1.skewed);
        assert!(!eval.replica_groups[&"c.r.z0".parse::<PlacementPath>().unwrap()].skewed);
    }

    #[test]
    fn test_zone_coverage_bounds_replica_balance() {
        // Every move towards n3 would leave its tablet with two zones.
        let v = view(
            &[
                ("n0", "c.r.z0", NodeStatus::Alive),
                ("n1", "c.r.z1", NodeStatus::Alive),
                ("n2", "c.r.z2", NodeStatus::Alive),
                ("n3", "c.r.z1", NodeStatus::Alive),
            ],
            &[
                ("a", &["n0", "n1", "n2"], Some("n0")),
                ("b", &["n0", "n1", "n2"], Some("n1")),
                ("c", &["n0", "n3", "n2"], Some("n2")),
                ("d", &["n0", "n3", "n2"], Some("n3")),
            ],
            PlacementPolicy::default(),
            &[],
        );
        let eval = evaluate(&v);
        let root = &eval.replica_groups[&PlacementPath::root()];
        assert_eq!(root.spread, 2);
        assert!(!root.skewed);
        assert!(eval.is_balanced());

        let a = &v.tablets["a"];
        let placement = TabletPlacement::analyze(&v.topology, a, &v.policies["t"]);
        assert!(!keeps_zone_coverage(&v.topology, &placement, &"n0".into(), &"n3".into()));
        assert!(keeps_zone_coverage(&v.topology, &placement, &"n1".into(), &"n3".into()));
    }

    #[test]
    fn test_leader_skew_through_transfer_chain() {
        // n1 shares no tablet with n2, so the leadership travels through n0.
        let v = view(
            &[
                ("n0", "c.r.z0", NodeStatus::Alive),
                ("n1", "c.r.z1", NodeStatus::Alive),
                ("n2", "c.r.z1", NodeStatus::Alive),
            ],
            &[
                ("a", &["n0", "n1"], Some("n1")),
                ("b", &["n0", "n1"], Some("n1")),
                ("c", &["n0", "n2"], Some("n0")),
            ],
            PlacementPolicy::parse("c.r.z0,c.r.z1", 2).unwrap(),
            &[],
        );
        let eval = evaluate(&v);
        let leaders = &eval.leader_groups[&LeaderScope::Unconstrained];
        assert!(leaders.skewed);
        assert!(!improves(leaders.load(&"n1".into()).unwrap(), leaders.load(&"n0".into()).unwrap()));

        let mut hand_offs = HandOffs::new();
        for tablet in v.tablets.values() {
            let placement = TabletPlacement::analyze(&v.topology, tablet, &v.policies["t"]);
            add_hand_offs(&mut hand_offs, &v.topology, tablet, &placement, &LeaderScope::Unconstrained);
        }
        assert_eq!(
            transfer_chain(leaders, &hand_offs),
            Some(vec![
                ("n1".to_string(), "n0".to_string(), "a".to_string()),
                ("n0".to_string(), "n2".to_string(), "c".to_string()),
            ])
        );
    }
}

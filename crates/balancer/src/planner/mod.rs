//! Move planner
//!
//! Turns an evaluation into a bounded batch of corrective actions. Work is
//! done in strict priority order:
//!
//! 1. constraint repair (under/over placement, invalid replicas)
//! 2. leader affinity (leaders into preferred zones)
//! 3. replica balance inside each placement group
//! 4. leader balance inside each leader group
//!
//! Every action is applied to a [`Simulation`] before it is accepted, so
//! later steps see the effect of earlier ones and no action introduces a
//! violation its tablet did not already have. Iteration is over ordered maps
//! only: the same input always produces the same plan.

mod balance;
mod repair;
mod simulation;

pub use simulation::{apply_to_tablet, Simulation};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::action::BalancerAction;
use crate::evaluator::Evaluation;
use crate::metadata::{NodeId, TabletId, TabletInfo};
use crate::topology::ClusterView;

/// Planner configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Data moves (add/remove/move) per batch
    #[serde(default = "default_max_concurrent_moves")]
    pub max_concurrent_moves: usize,
    /// Leader transfers per batch
    #[serde(default = "default_max_leader_transfers")]
    pub max_leader_transfers: usize,
    /// Cost of copying or dropping one replica
    #[serde(default = "default_replica_move_weight")]
    pub replica_move_weight: u64,
    /// Cost of one leadership change
    #[serde(default = "default_leader_transfer_weight")]
    pub leader_transfer_weight: u64,
    /// Transfer leadership away before removing a leader's replica
    #[serde(default = "default_skip_leader_as_remove_victim")]
    pub skip_leader_as_remove_victim: bool,
}

fn default_max_concurrent_moves() -> usize {
    8
}

fn default_max_leader_transfers() -> usize {
    16
}

fn default_replica_move_weight() -> u64 {
    10
}

fn default_leader_transfer_weight() -> u64 {
    1
}

fn default_skip_leader_as_remove_victim() -> bool {
    true
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_moves: default_max_concurrent_moves(),
            max_leader_transfers: default_max_leader_transfers(),
            replica_move_weight: default_replica_move_weight(),
            leader_transfer_weight: default_leader_transfer_weight(),
            skip_leader_as_remove_victim: default_skip_leader_as_remove_victim(),
        }
    }
}

impl PlannerConfig {
    pub fn merge(&mut self, other: Self) {
        if other.max_concurrent_moves > 0 {
            self.max_concurrent_moves = other.max_concurrent_moves;
        }
        if other.max_leader_transfers > 0 {
            self.max_leader_transfers = other.max_leader_transfers;
        }
        if other.replica_move_weight > 0 {
            self.replica_move_weight = other.replica_move_weight;
        }
        if other.leader_transfer_weight > 0 {
            self.leader_transfer_weight = other.leader_transfer_weight;
        }
        self.skip_leader_as_remove_victim = other.skip_leader_as_remove_victim;
    }
}

/// Planning step that produced an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStep {
    ConstraintRepair,
    LeaderAffinity,
    ReplicaBalance,
    LeaderBalance,
}

/// One action of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAction {
    pub action: BalancerAction,
    pub step: PlanStep,
    pub cost: u64,
}

/// Ordered, bounded batch of actions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub actions: Vec<PlannedAction>,
    /// Sum of action costs
    pub cost: u64,
    /// Work was left for a later batch because a budget ran out
    pub budget_exhausted: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn into_actions(self) -> Vec<BalancerAction> {
        self.actions.into_iter().map(|p| p.action).collect()
    }
}

/// Move planner
#[derive(Debug, Clone, Default)]
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Build a batch for `view`, leaving the `excluded` tablets alone
    ///
    /// Excluded tablets (pending or backing off) still count toward loads.
    pub fn plan(&self, view: &ClusterView, evaluation: &Evaluation, excluded: &BTreeSet<TabletId>) -> Plan {
        let mut batch = Batch::new(&self.config, Simulation::new(view, evaluation), excluded);

        repair::repair_constraints(&mut batch);
        repair::repair_leader_affinity(&mut batch);
        balance::balance_replicas(&mut batch);
        balance::balance_leaders(&mut batch);

        let plan = batch.finish();
        debug!(
            "Planned {} actions, cost {}, budget exhausted: {}",
            plan.len(),
            plan.cost,
            plan.budget_exhausted
        );
        plan
    }
}

/// Batch under construction
pub(crate) struct Batch<'a> {
    config: &'a PlannerConfig,
    sim: Simulation,
    excluded: &'a BTreeSet<TabletId>,
    touched: BTreeSet<TabletId>,
    actions: Vec<PlannedAction>,
    moves_left: usize,
    transfers_left: usize,
    budget_exhausted: bool,
}

impl<'a> Batch<'a> {
    fn new(config: &'a PlannerConfig, sim: Simulation, excluded: &'a BTreeSet<TabletId>) -> Self {
        Self {
            config,
            sim,
            excluded,
            touched: BTreeSet::new(),
            actions: Vec::new(),
            moves_left: config.max_concurrent_moves,
            transfers_left: config.max_leader_transfers,
            budget_exhausted: false,
        }
    }

    pub(crate) fn config(&self) -> &PlannerConfig {
        self.config
    }

    pub(crate) fn sim(&self) -> &Simulation {
        &self.sim
    }

    /// Neither pending, backing off, nor already in this batch
    pub(crate) fn can_touch(&self, tablet: &TabletId) -> bool {
        !self.excluded.contains(tablet) && !self.touched.contains(tablet)
    }

    pub(crate) fn moves_left(&self) -> usize {
        self.moves_left
    }

    pub(crate) fn transfers_left(&self) -> usize {
        self.transfers_left
    }

    pub(crate) fn mark_exhausted(&mut self) {
        self.budget_exhausted = true;
    }

    fn cost_of(&self, action: &BalancerAction) -> u64 {
        if !action.is_data_move() {
            return self.config.leader_transfer_weight;
        }
        match (&action.source, self.sim.tablet(&action.tablet)) {
            (Some(source), Some(tablet)) => self.move_cost(tablet, source),
            _ => self.config.replica_move_weight,
        }
    }

    /// Cost of moving a replica of `tablet` away from `node`
    pub(crate) fn move_cost(&self, tablet: &TabletInfo, node: &NodeId) -> u64 {
        if tablet.is_led_by(node) {
            self.config.replica_move_weight + self.config.leader_transfer_weight
        } else {
            self.config.replica_move_weight
        }
    }

    /// Accept `action` if the tablet is free, budget remains and the simulation agrees
    pub(crate) fn propose(&mut self, action: BalancerAction, step: PlanStep) -> bool {
        if !self.can_touch(&action.tablet) {
            return false;
        }
        let budget = if action.is_data_move() {
            self.moves_left
        } else {
            self.transfers_left
        };
        if budget == 0 {
            self.budget_exhausted = true;
            return false;
        }

        let cost = self.cost_of(&action);
        if !self.sim.try_apply(&action) {
            debug!("Rejected unsafe action: {}", action);
            return false;
        }

        if action.is_data_move() {
            self.moves_left -= 1;
        } else {
            self.transfers_left -= 1;
        }
        self.touched.insert(action.tablet.clone());
        self.actions.push(PlannedAction { action, step, cost });
        true
    }

    fn finish(self) -> Plan {
        let cost = self.actions.iter().map(|a| a.cost).sum();
        Plan {
            actions: self.actions,
            cost,
            budget_exhausted: self.budget_exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::evaluator::{evaluate, LeaderScope};
    use crate::metadata::{NodeInfo, NodeStatus, PlacementPath, TabletInfo as Tablet};
    use crate::policy::{PlacementPolicy, ResolvedPolicy, TablePolicy};
    use crate::topology::TopologySnapshot;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    struct ViewBuilder {
        nodes: Vec<NodeInfo>,
        tablets: Vec<Tablet>,
        placement: PlacementPolicy,
        preferred: Vec<PlacementPath>,
    }

    impl ViewBuilder {
        fn new() -> Self {
            Self {
                nodes: Vec::new(),
                tablets: Vec::new(),
                placement: PlacementPolicy::default(),
                preferred: Vec::new(),
            }
        }

        fn node(mut self, id: &str, zone: &str, status: NodeStatus) -> Self {
            let mut node = NodeInfo::new(id, zone.parse().unwrap());
            node.status = status;
            self.nodes.push(node);
            self
        }

        fn zones(self, nodes: &[(&str, &str)]) -> Self {
            nodes
                .iter()
                .fold(self, |b, (id, zone)| b.node(id, zone, NodeStatus::Alive))
        }

        fn tablet(mut self, id: &str, replicas: &[&str], leader: &str) -> Self {
            let mut tablet = Tablet::new(id, "t", self.placement.replication_factor);
            for r in replicas {
                tablet.add_replica(r.to_string());
            }
            tablet.set_leader(leader.to_string());
            self.tablets.push(tablet);
            self
        }

        fn placement(mut self, spec: &str, rf: u32) -> Self {
            self.placement = PlacementPolicy::parse(spec, rf).unwrap();
            self
        }

        fn preferred(mut self, zones: &[&str]) -> Self {
            self.preferred = zones.iter().map(|z| z.parse().unwrap()).collect();
            self
        }

        fn build(self) -> ClusterView {
            let mut policies = BTreeMap::new();
            policies.insert(
                "t".to_string(),
                ResolvedPolicy::resolve(
                    "t".to_string(),
                    TablePolicy {
                        placement: self.placement,
                        preferred_zones: self.preferred.clone(),
                        leader_affinity: true,
                        system: false,
                    },
                ),
            );
            ClusterView {
                topology: TopologySnapshot::new(self.nodes, Duration::seconds(30), Utc::now()),
                tablets: self.tablets.into_iter().map(|t| (t.id.clone(), t)).collect(),
                policies,
                preferred_zones: self.preferred,
            }
        }
    }

    const THREE: &[(&str, &str)] = &[("n0", "c.r.z0"), ("n1", "c.r.z1"), ("n2", "c.r.z2")];

    fn plan_with(config: PlannerConfig, view: &ClusterView) -> Plan {
        Planner::new(config).plan(view, &evaluate(view), &BTreeSet::new())
    }

    fn plan(view: &ClusterView) -> Plan {
        plan_with(PlannerConfig::default(), view)
    }

    #[test]
    fn test_adds_missing_replica() {
        let view = ViewBuilder::new()
            .zones(THREE)
            .tablet("a", &["n0", "n1"], "n0")
            .build();
        let plan = plan(&view);
        assert_eq!(
            plan.actions[0].action,
            BalancerAction::add_replica("a".into(), "t".into(), "n2".into())
        );
        assert_eq!(plan.actions[0].step, PlanStep::ConstraintRepair);
    }

    #[test]
    fn test_replaces_dead_replica() {
        let view = ViewBuilder::new()
            .zones(&[("n0", "c.r.z0"), ("n1", "c.r.z1"), ("n3", "c.r.z2")])
            .node("n2", "c.r.z2", NodeStatus::Dead)
            .tablet("a", &["n0", "n1", "n2"], "n0")
            .build();
        let plan = plan(&view);
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.actions[0].action,
            BalancerAction::move_replica("a".into(), "t".into(), "n2".into(), "n3".into())
        );
        assert_eq!(plan.cost, 10);
    }

    #[test]
    fn test_draining_leader_transfers_first() {
        let builder = || {
            ViewBuilder::new()
                .node("n0", "c.r.z0", NodeStatus::Draining)
                .node("n1", "c.r.z1", NodeStatus::Alive)
                .node("n2", "c.r.z2", NodeStatus::Alive)
                .node("n3", "c.r.z0", NodeStatus::Alive)
                .tablet("a", &["n0", "n1", "n2"], "n0")
                .build()
        };

        let plan = plan(&builder());
        assert_eq!(
            plan.actions[0].action,
            BalancerAction::transfer_leader("a".into(), "t".into(), Some("n0".into()), "n1".into())
        );

        let config = PlannerConfig {
            skip_leader_as_remove_victim: false,
            ..Default::default()
        };
        let plan = plan_with(config, &builder());
        assert_eq!(
            plan.actions[0].action,
            BalancerAction::move_replica("a".into(), "t".into(), "n0".into(), "n3".into())
        );
        assert_eq!(plan.cost, 11);
    }

    #[test]
    fn test_leaders_move_into_preferred_zone() {
        let view = ViewBuilder::new()
            .zones(THREE)
            .preferred(&["c.r.z1"])
            .tablet("a", &["n0", "n1", "n2"], "n0")
            .tablet("b", &["n0", "n1", "n2"], "n2")
            .build();
        let plan = plan(&view);
        let kinds: Vec<_> = plan.actions.iter().map(|a| (a.action.tablet.as_str(), a.step)).collect();
        assert_eq!(
            kinds,
            vec![("a", PlanStep::LeaderAffinity), ("b", PlanStep::LeaderAffinity)]
        );
        assert!(plan
            .actions
            .iter()
            .all(|a| a.action.destination.as_deref() == Some("n1")));
    }

    #[test]
    fn test_new_node_receives_non_leader_replicas() {
        let view = ViewBuilder::new()
            .placement("c.r.z0,c.r.z1,c.r.z2", 3)
            .zones(THREE)
            .node("n3", "c.r.z1", NodeStatus::Alive)
            .tablet("a", &["n0", "n1", "n2"], "n0")
            .tablet("b", &["n0", "n1", "n2"], "n1")
            .tablet("c", &["n0", "n1", "n2"], "n2")
            .tablet("d", &["n0", "n1", "n2"], "n0")
            .build();
        let plan = plan(&view);
        let moves: Vec<_> = plan
            .actions
            .iter()
            .filter(|a| a.step == PlanStep::ReplicaBalance)
            .map(|a| a.action.clone())
            .collect();
        assert_eq!(
            moves,
            vec![
                BalancerAction::move_replica("a".into(), "t".into(), "n1".into(), "n3".into()),
                BalancerAction::move_replica("c".into(), "t".into(), "n1".into(), "n3".into()),
            ]
        );
    }

    #[test]
    fn test_leader_balance_chains_transfers() {
        let view = ViewBuilder::new()
            .placement("c.r.z0,c.r.z1", 2)
            .zones(&[("n0", "c.r.z0"), ("n1", "c.r.z1"), ("n2", "c.r.z1")])
            .tablet("a", &["n0", "n1"], "n1")
            .tablet("b", &["n0", "n1"], "n1")
            .tablet("c", &["n0", "n2"], "n0")
            .build();
        assert!(evaluate(&view).leader_groups[&LeaderScope::Unconstrained].skewed);

        let plan = plan(&view);
        let transfers: Vec<_> = plan.actions.iter().map(|a| (a.action.clone(), a.step)).collect();
        assert_eq!(
            transfers,
            vec![
                (
                    BalancerAction::transfer_leader("a".into(), "t".into(), Some("n1".into()), "n0".into()),
                    PlanStep::LeaderBalance
                ),
                (
                    BalancerAction::transfer_leader("c".into(), "t".into(), Some("n0".into()), "n2".into()),
                    PlanStep::LeaderBalance
                ),
            ]
        );

        let mut tablets = view.tablets.clone();
        for planned in &plan.actions {
            let tablet = tablets.get_mut(&planned.action.tablet).unwrap();
            assert!(apply_to_tablet(tablet, &planned.action, &view.topology));
        }
        assert!(evaluate(&ClusterView { tablets, ..view.clone() }).is_balanced());
    }

    #[test]
    fn test_chain_longer_than_budget_waits() {
        let view = ViewBuilder::new()
            .placement("c.r.z0,c.r.z1", 2)
            .zones(&[("n0", "c.r.z0"), ("n1", "c.r.z1"), ("n2", "c.r.z1")])
            .tablet("a", &["n0", "n1"], "n1")
            .tablet("b", &["n0", "n1"], "n1")
            .tablet("c", &["n0", "n2"], "n0")
            .build();
        let config = PlannerConfig {
            max_leader_transfers: 1,
            ..Default::default()
        };
        let plan = plan_with(config, &view);
        assert!(plan.is_empty());
        assert!(plan.budget_exhausted);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let view = ViewBuilder::new()
            .zones(THREE)
            .node("n3", "c.r.z0", NodeStatus::Alive)
            .tablet("a", &["n0", "n1", "n2"], "n0")
            .tablet("b", &["n0", "n1", "n2"], "n0")
            .tablet("c", &["n0", "n1"], "n0")
            .build();
        assert_eq!(plan(&view), plan(&view));
    }

    #[test]
    fn test_budget_and_exclusions() {
        let view = ViewBuilder::new()
            .zones(THREE)
            .tablet("a", &["n0"], "n0")
            .tablet("b", &["n0"], "n0")
            .build();
        let config = PlannerConfig {
            max_concurrent_moves: 1,
            ..Default::default()
        };
        let plan = plan_with(config.clone(), &view);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.actions[0].action.tablet, "a");
        assert!(plan.budget_exhausted);

        let excluded: BTreeSet<TabletId> = ["a".to_string()].into();
        let plan = Planner::new(config).plan(&view, &evaluate(&view), &excluded);
        assert_eq!(plan.actions[0].action.tablet, "b");
    }

    #[test]
    fn test_unsatisfiable_placement_emits_nothing() {
        let view = ViewBuilder::new()
            .zones(&[("n0", "c.r.z0"), ("n1", "c.r.z1")])
            .tablet("a", &["n0", "n1"], "n0")
            .build();
        let eval = evaluate(&view);
        assert_eq!(eval.unsatisfiable().count(), 1);
        assert!(plan(&view).is_empty());
    }

    #[test]
    fn test_every_action_is_safe() {
        let view = ViewBuilder::new()
            .zones(THREE)
            .node("n3", "c.r.z1", NodeStatus::Alive)
            .preferred(&["c.r.z1"])
            .tablet("a", &["n0", "n1", "n2"], "n0")
            .tablet("b", &["n0", "n1"], "n1")
            .tablet("c", &["n1", "n2", "n3", "n0"], "n2")
            .build();
        let before = evaluate(&view);
        for planned in plan(&view).actions {
            let mut tablets = view.tablets.clone();
            let tablet = tablets.get_mut(&planned.action.tablet).unwrap();
            assert!(apply_to_tablet(tablet, &planned.action, &view.topology));
            let after = evaluate(&ClusterView {
                tablets,
                ..view.clone()
            });
            let keys_before = before.constraint_keys(&planned.action.tablet);
            let keys_after = after.constraint_keys(&planned.action.tablet);
            assert!(keys_after.is_subset(&keys_before), "{}", planned.action);
            if planned.action.kind != ActionKind::RemoveReplica {
                let dest = planned.action.destination.as_ref().unwrap();
                assert!(view.topology.accepts_data(dest));
            }
        }
    }
}

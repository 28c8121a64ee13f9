//! In-memory assignment the planner mutates while building a batch

use std::collections::BTreeSet;

use crate::action::{ActionKind, BalancerAction};
use crate::evaluator::{evaluate, tablet_violations, Evaluation, TabletPlacement, ViolationKey};
use crate::metadata::{TabletId, TabletInfo};
use crate::policy::ResolvedPolicy;
use crate::topology::{ClusterView, TopologySnapshot};

/// Planner-owned copy of the cluster view
#[derive(Debug, Clone)]
pub struct Simulation {
    view: ClusterView,
    evaluation: Evaluation,
}

impl Simulation {
    pub fn new(view: &ClusterView, evaluation: &Evaluation) -> Self {
        Self {
            view: view.clone(),
            evaluation: evaluation.clone(),
        }
    }

    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    pub fn topology(&self) -> &TopologySnapshot {
        &self.view.topology
    }

    /// Evaluation of the simulated state
    pub fn evaluation(&self) -> &Evaluation {
        &self.evaluation
    }

    pub fn tablet(&self, id: &TabletId) -> Option<&TabletInfo> {
        self.view.tablets.get(id)
    }

    pub fn policy(&self, tablet: &TabletInfo) -> Option<&ResolvedPolicy> {
        self.view.policies.get(&tablet.table)
    }

    /// Analysis of a tablet in the simulated state
    pub fn placement(&self, tablet: &TabletInfo) -> Option<TabletPlacement> {
        let policy = self.policy(tablet)?;
        Some(TabletPlacement::analyze(&self.view.topology, tablet, policy))
    }

    fn constraint_keys(&self, tablet: &TabletInfo) -> BTreeSet<ViolationKey> {
        let Some(policy) = self.policy(tablet) else {
            return BTreeSet::new();
        };
        let placement = TabletPlacement::analyze(&self.view.topology, tablet, policy);
        tablet_violations(&self.view.topology, tablet, policy, &placement)
            .iter()
            .filter(|v| v.is_constraint())
            .map(|v| v.key())
            .collect()
    }

    /// Apply an action if it is safe
    ///
    /// Safe means the destination accepts data and the tablet ends up with no
    /// placement or replication violation it did not already have. A replica
    /// added in a preferred zone may leave the leader outside it for a tick;
    /// leader affinity repairs that next. Unsafe actions leave the state
    /// untouched and return false.
    pub fn try_apply(&mut self, action: &BalancerAction) -> bool {
        if let Some(dest) = &action.destination {
            if !self.view.topology.accepts_data(dest) {
                return false;
            }
        }
        let Some(original) = self.view.tablets.get(&action.tablet).cloned() else {
            return false;
        };

        let mut next = original.clone();
        if !apply_to_tablet(&mut next, action, &self.view.topology) {
            return false;
        }

        let before = self.constraint_keys(&original);
        let after = self.constraint_keys(&next);
        if !after.is_subset(&before) {
            return false;
        }

        self.view.tablets.insert(next.id.clone(), next);
        self.evaluation = evaluate(&self.view);
        true
    }
}

/// Mutate one tablet the way the cluster applies an action
///
/// A tablet that loses its leader elects the lowest-id alive replica.
/// Returns false if the action does not fit the tablet.
pub fn apply_to_tablet(tablet: &mut TabletInfo, action: &BalancerAction, topology: &TopologySnapshot) -> bool {
    match action.kind {
        ActionKind::AddReplica => {
            let Some(dest) = &action.destination else { return false };
            if tablet.has_replica(dest) {
                return false;
            }
            tablet.add_replica(dest.clone());
        }
        ActionKind::RemoveReplica => {
            let Some(source) = &action.source else { return false };
            if !tablet.has_replica(source) {
                return false;
            }
            tablet.remove_replica(source);
        }
        ActionKind::MoveReplica => {
            let (Some(source), Some(dest)) = (&action.source, &action.destination) else {
                return false;
            };
            if !tablet.has_replica(source) || tablet.has_replica(dest) {
                return false;
            }
            tablet.add_replica(dest.clone());
            tablet.remove_replica(source);
        }
        ActionKind::TransferLeader => {
            let Some(dest) = &action.destination else { return false };
            if tablet.leader != action.source {
                return false;
            }
            if !tablet.set_leader(dest.clone()) {
                return false;
            }
        }
    }

    if tablet.leader.is_none() {
        let mut candidates: Vec<_> = tablet
            .replicas
            .iter()
            .filter(|id| topology.accepts_data(id))
            .cloned()
            .collect();
        candidates.sort();
        if let Some(leader) = candidates.into_iter().next() {
            tablet.leader = Some(leader);
        }
    }
    true
}

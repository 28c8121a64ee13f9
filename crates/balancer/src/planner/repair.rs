//! Constraint and leader-affinity repair

use std::collections::BTreeSet;

use super::{Batch, PlanStep};
use crate::action::BalancerAction;
use crate::evaluator::{cmp_load, leader_scope, LeaderScope, MemberLoad, TabletPlacement, Violation};
use crate::metadata::{NodeId, PlacementPath, TabletId, TabletInfo};
use crate::policy::ResolvedPolicy;

/// Step 1: fix under/over placement and invalid replicas, tablet by tablet
pub(crate) fn repair_constraints(batch: &mut Batch<'_>) {
    let tablets: BTreeSet<TabletId> = batch
        .sim()
        .evaluation()
        .violations
        .iter()
        .filter(|v| !matches!(v, Violation::LeaderOutsidePreferred { .. }))
        .map(|v| v.tablet().clone())
        .collect();

    for id in tablets {
        if batch.moves_left() == 0 {
            batch.mark_exhausted();
            return;
        }
        if !batch.can_touch(&id) {
            continue;
        }
        let Some(tablet) = batch.sim().tablet(&id).cloned() else {
            continue;
        };
        let Some(policy) = batch.sim().policy(&tablet).cloned() else {
            continue;
        };
        let Some(placement) = batch.sim().placement(&tablet) else {
            continue;
        };
        let Some(action) = repair_action(batch, &tablet, &placement) else {
            continue;
        };

        if let Some(source) = action.source.clone() {
            let guard_leader = batch.config().skip_leader_as_remove_victim
                && tablet.is_led_by(&source)
                && batch.sim().topology().is_live(&source);
            if guard_leader {
                if let Some(target) = leader_target(batch, &tablet, &policy, &placement, Some(&source)) {
                    let transfer = BalancerAction::transfer_leader(
                        tablet.id.clone(),
                        tablet.table.clone(),
                        Some(source),
                        target,
                    );
                    if batch.propose(transfer, PlanStep::ConstraintRepair) {
                        continue;
                    }
                }
            }
        }
        batch.propose(action, PlanStep::ConstraintRepair);
    }
}

/// MOVE, ADD or REMOVE that brings a tablet closer to its placement
fn repair_action(batch: &Batch<'_>, tablet: &TabletInfo, placement: &TabletPlacement) -> Option<BalancerAction> {
    let short = placement.short_block();
    let receiver = short.and_then(|i| pick_receiver(batch, tablet, placement, &placement.blocks[i].path));
    let victim = placement
        .invalid
        .first()
        .map(|(node, _)| node.clone())
        .or_else(|| {
            placement
                .excess_block()
                .and_then(|i| pick_victim(batch, tablet, &placement.blocks[i].path, &placement.blocks[i].valid))
        });

    let (tablet_id, table) = (tablet.id.clone(), tablet.table.clone());
    match (victim, short, receiver) {
        (Some(victim), Some(_), Some(receiver)) => {
            Some(BalancerAction::move_replica(tablet_id, table, victim, receiver))
        }
        (Some(victim), None, _) => Some(BalancerAction::remove_replica(tablet_id, table, victim)),
        (None, Some(_), Some(receiver)) => Some(BalancerAction::add_replica(tablet_id, table, receiver)),
        // Nowhere to put the replica: unsatisfiable, reported but not acted on.
        _ => None,
    }
}

/// Least-loaded alive node of the block not hosting the tablet
///
/// Nodes in zones the tablet does not cover yet come first.
fn pick_receiver(
    batch: &Batch<'_>,
    tablet: &TabletInfo,
    placement: &TabletPlacement,
    block: &PlacementPath,
) -> Option<NodeId> {
    let group = batch.sim().evaluation().replica_groups.get(block);
    let mut candidates: Vec<(bool, MemberLoad, NodeId)> = batch
        .sim()
        .topology()
        .alive_matching(block)
        .into_iter()
        .filter(|n| !tablet.has_replica(&n.id))
        .map(|n| {
            let load = group
                .and_then(|g| g.load(&n.id))
                .unwrap_or_else(|| MemberLoad::new(n.weight));
            (placement.zones.contains(&n.placement), load, n.id.clone())
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| cmp_load(a.1, b.1))
            .then_with(|| a.2.cmp(&b.2))
    });
    candidates.into_iter().next().map(|(_, _, id)| id)
}

/// Most-loaded replica of an over-full block
///
/// With `skip_leader_as_remove_victim` non-leaders are preferred.
fn pick_victim(batch: &Batch<'_>, tablet: &TabletInfo, block: &PlacementPath, valid: &[NodeId]) -> Option<NodeId> {
    let group = batch.sim().evaluation().replica_groups.get(block)?;
    let skip_leader = batch.config().skip_leader_as_remove_victim;
    let mut candidates: Vec<(bool, MemberLoad, &NodeId)> = valid
        .iter()
        .filter_map(|id| {
            let load = group.load(id)?;
            Some((skip_leader && tablet.is_led_by(id), load, id))
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| cmp_load(b.1, a.1))
            .then_with(|| a.2.cmp(b.2))
    });
    candidates.first().map(|(_, _, id)| (*id).clone())
}

/// Best new leader among the tablet's valid replicas
///
/// In-scope replicas (preferred zones, if any) first, then fewest
/// leaderships, then lowest id.
fn leader_target(
    batch: &Batch<'_>,
    tablet: &TabletInfo,
    policy: &ResolvedPolicy,
    placement: &TabletPlacement,
    exclude: Option<&NodeId>,
) -> Option<NodeId> {
    let topology = batch.sim().topology();
    let scope = leader_scope(topology, placement, policy);
    let leaders = &batch.sim().evaluation().node_leaders;
    let mut candidates: Vec<(bool, u64, &NodeId)> = placement
        .valid_replicas()
        .filter(|id| Some(*id) != exclude && !tablet.is_led_by(id))
        .filter_map(|id| {
            let node = topology.node(id)?;
            let count = leaders.get(id).copied().unwrap_or(0);
            Some((!scope.admits(&node.placement), count, id))
        })
        .collect();
    candidates.sort();
    candidates.first().map(|(_, _, id)| (*id).clone())
}

/// Step 2: move leaders into the preferred zones
pub(crate) fn repair_leader_affinity(batch: &mut Batch<'_>) {
    let tablets: Vec<TabletId> = batch
        .sim()
        .evaluation()
        .violations
        .iter()
        .filter(|v| matches!(v, Violation::LeaderOutsidePreferred { .. }))
        .map(|v| v.tablet().clone())
        .collect();

    for id in tablets {
        if batch.transfers_left() == 0 {
            batch.mark_exhausted();
            return;
        }
        if !batch.can_touch(&id) {
            continue;
        }
        let Some(tablet) = batch.sim().tablet(&id).cloned() else {
            continue;
        };
        let Some(policy) = batch.sim().policy(&tablet).cloned() else {
            continue;
        };
        let Some(placement) = batch.sim().placement(&tablet) else {
            continue;
        };
        if !matches!(leader_scope(batch.sim().topology(), &placement, &policy), LeaderScope::Preferred(_)) {
            continue;
        }
        if let Some(target) = leader_target(batch, &tablet, &policy, &placement, None) {
            let transfer =
                BalancerAction::transfer_leader(tablet.id.clone(), tablet.table.clone(), tablet.leader.clone(), target);
            batch.propose(transfer, PlanStep::LeaderAffinity);
        }
    }
}

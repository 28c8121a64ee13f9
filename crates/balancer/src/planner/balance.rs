//! Replica and leader balancing inside groups

use std::collections::BTreeMap;

use super::{Batch, PlanStep};
use crate::action::BalancerAction;
use crate::evaluator::{
    add_hand_offs, improves, keeps_zone_coverage, leader_scope, transfer_chain, GroupLoad, HandOffs, LeaderScope,
};
use crate::metadata::{NodeId, PlacementPath, TableId, TabletId};

/// Step 3: even out replica counts in every placement group
pub(crate) fn balance_replicas(batch: &mut Batch<'_>) {
    let groups: Vec<PlacementPath> = batch.sim().evaluation().replica_groups.keys().cloned().collect();
    for path in groups {
        loop {
            let Some(group) = batch.sim().evaluation().replica_groups.get(&path).cloned() else {
                break;
            };
            if !group.skewed {
                break;
            }
            if batch.moves_left() == 0 {
                batch.mark_exhausted();
                return;
            }
            if !move_one_replica(batch, &path, &group) {
                break;
            }
        }
    }
}

/// Replicas per (table, node), used to spread a table's tablets
fn table_counts(batch: &Batch<'_>) -> BTreeMap<(TableId, NodeId), usize> {
    let mut counts = BTreeMap::new();
    for tablet in batch.sim().view().tablets.values() {
        for node in &tablet.replicas {
            *counts.entry((tablet.table.clone(), node.clone())).or_insert(0) += 1;
        }
    }
    counts
}

/// Move one replica from a heavier member to a lighter one
///
/// Donors are tried heaviest first and receivers lightest first; only pairs
/// whose transfer lowers the group's weighted imbalance qualify. With
/// `skip_leader_as_remove_victim` a donor's led replicas are only taken when
/// no pair has another candidate.
fn move_one_replica(batch: &mut Batch<'_>, path: &PlacementPath, group: &GroupLoad) -> bool {
    if batch.config().skip_leader_as_remove_victim && move_one_replica_with(batch, path, group, false) {
        return true;
    }
    move_one_replica_with(batch, path, group, true)
}

fn move_one_replica_with(batch: &mut Batch<'_>, path: &PlacementPath, group: &GroupLoad, take_leader: bool) -> bool {
    let counts = table_counts(batch);

    for (donor, donor_load) in group.donors() {
        for (receiver, receiver_load) in group.receivers() {
            if donor == receiver || !improves(donor_load, receiver_load) {
                continue;
            }

            let mut candidates: Vec<(usize, u64, TabletId, TableId)> = Vec::new();
            for tablet in batch.sim().view().tablets.values() {
                if !batch.can_touch(&tablet.id) || !tablet.has_replica(donor) || tablet.has_replica(receiver) {
                    continue;
                }
                if !take_leader && tablet.is_led_by(donor) {
                    continue;
                }
                let Some(placement) = batch.sim().placement(tablet) else {
                    continue;
                };
                let in_group = placement
                    .block_of(donor)
                    .map(|i| &placement.blocks[i].path == path)
                    .unwrap_or(false);
                if !in_group || !keeps_zone_coverage(batch.sim().topology(), &placement, donor, receiver) {
                    continue;
                }

                let on_receiver = counts
                    .get(&(tablet.table.clone(), receiver.clone()))
                    .copied()
                    .unwrap_or(0);
                candidates.push((
                    on_receiver,
                    batch.move_cost(tablet, donor),
                    tablet.id.clone(),
                    tablet.table.clone(),
                ));
            }
            candidates.sort();

            for (_, _, tablet, table) in candidates {
                let action = BalancerAction::move_replica(tablet, table, donor.clone(), receiver.clone());
                if batch.propose(action, PlanStep::ReplicaBalance) {
                    return true;
                }
            }
        }
    }
    false
}

/// Step 4: even out leader counts in every leader group
pub(crate) fn balance_leaders(batch: &mut Batch<'_>) {
    let scopes: Vec<LeaderScope> = batch.sim().evaluation().leader_groups.keys().cloned().collect();
    for scope in scopes {
        loop {
            let Some(group) = batch.sim().evaluation().leader_groups.get(&scope).cloned() else {
                break;
            };
            if !group.skewed {
                break;
            }
            if batch.transfers_left() == 0 {
                batch.mark_exhausted();
                return;
            }
            if !transfer_one_leader(batch, &scope, &group) {
                break;
            }
        }
    }
}

/// Move one leadership from a heavier member to a lighter one
///
/// The leadership may travel through intermediate members that share a
/// tablet with both neighbours; each hop is one transfer.
fn transfer_one_leader(batch: &mut Batch<'_>, scope: &LeaderScope, group: &GroupLoad) -> bool {
    let mut hand_offs = HandOffs::new();
    for tablet in batch.sim().view().tablets.values() {
        if !batch.can_touch(&tablet.id) {
            continue;
        }
        let Some(policy) = batch.sim().policy(tablet) else {
            continue;
        };
        let Some(placement) = batch.sim().placement(tablet) else {
            continue;
        };
        let topology = batch.sim().topology();
        if &leader_scope(topology, &placement, policy) != scope {
            continue;
        }
        add_hand_offs(&mut hand_offs, topology, tablet, &placement, scope);
    }

    let Some(chain) = transfer_chain(group, &hand_offs) else {
        return false;
    };
    if chain.len() > batch.transfers_left() {
        batch.mark_exhausted();
        return false;
    }

    for (from, to, tablet) in chain {
        let Some(table) = batch.sim().tablet(&tablet).map(|t| t.table.clone()) else {
            return false;
        };
        let action = BalancerAction::transfer_leader(tablet, table, Some(from), to);
        if !batch.propose(action, PlanStep::LeaderBalance) {
            return false;
        }
    }
    true
}

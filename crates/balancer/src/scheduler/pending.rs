//! In-flight action tracking

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::action::BalancerAction;
use crate::cluster::ActionId;
use crate::metadata::{NodeId, TabletId};

/// Final status of a dispatched action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Acknowledged as done
    Completed,
    /// Acknowledged as failed, or rejected on dispatch
    Failed,
    /// No acknowledgement before the deadline
    TimedOut,
    /// A node the action depends on went away
    Cancelled,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionStatus::Completed => write!(f, "completed"),
            ActionStatus::Failed => write!(f, "failed"),
            ActionStatus::TimedOut => write!(f, "timed_out"),
            ActionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Dispatched, not yet acknowledged action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingAction {
    pub id: ActionId,
    pub action: BalancerAction,
    pub dispatched_at: DateTime<Utc>,
}

/// Pending actions, at most one per tablet
#[derive(Debug, Default)]
pub struct PendingActions {
    actions: BTreeMap<ActionId, PendingAction>,
    by_tablet: BTreeMap<TabletId, ActionId>,
}

impl PendingActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an action; refused if its tablet already has one in flight
    pub fn insert(&mut self, id: ActionId, action: BalancerAction) -> bool {
        if self.by_tablet.contains_key(&action.tablet) {
            return false;
        }
        self.by_tablet.insert(action.tablet.clone(), id);
        self.actions.insert(
            id,
            PendingAction {
                id,
                action,
                dispatched_at: Utc::now(),
            },
        );
        true
    }

    pub fn remove(&mut self, id: ActionId) -> Option<PendingAction> {
        let pending = self.actions.remove(&id)?;
        self.by_tablet.remove(&pending.action.tablet);
        Some(pending)
    }

    /// Remove and return everything
    pub fn drain(&mut self) -> Vec<PendingAction> {
        self.by_tablet.clear();
        std::mem::take(&mut self.actions).into_values().collect()
    }

    pub fn contains_tablet(&self, tablet: &TabletId) -> bool {
        self.by_tablet.contains_key(tablet)
    }

    pub fn tablets(&self) -> BTreeSet<TabletId> {
        self.by_tablet.keys().cloned().collect()
    }

    /// Actions made pointless by the loss of nodes matching `lost`
    pub fn invalidated_by(&self, lost: impl Fn(&NodeId) -> bool) -> Vec<ActionId> {
        self.actions
            .values()
            .filter(|p| {
                p.action
                    .source
                    .iter()
                    .chain(p.action.destination.iter())
                    .any(|node| lost(node) && p.action.depends_on(node))
            })
            .map(|p| p.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.actions.values()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

//! State reporter
//!
//! The run loop publishes a fresh [`BalancerReport`] after every tick through
//! a `tokio::sync::watch` channel. Readers clone the current `Arc` and never
//! wait on the loop.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::evaluator::Evaluation;
use crate::metadata::NodeId;
use crate::scheduler::{LoopState, StuckMove, TickSummary};

/// Point-in-time balancer status
#[derive(Debug, Clone, Serialize)]
pub struct BalancerReport {
    pub state: LoopState,
    /// No actions proposed on the last tick and none in flight
    pub idle: bool,
    /// Last evaluation found no violations and no skewed group
    pub balanced: bool,
    pub leaders_on_preferred_only: bool,
    pub system_leaders_spread: bool,
    /// Alive nodes in the last evaluated snapshot
    pub live_nodes: usize,
    pub pending_actions: usize,
    pub evaluation: Option<Evaluation>,
    pub last_tick: Option<TickSummary>,
    pub stuck_moves: Vec<StuckMove>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for BalancerReport {
    fn default() -> Self {
        Self {
            state: LoopState::Idle,
            idle: true,
            balanced: false,
            leaders_on_preferred_only: false,
            system_leaders_spread: true,
            live_nodes: 0,
            pending_actions: 0,
            evaluation: None,
            last_tick: None,
            stuck_moves: Vec::new(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Publisher side, cheap to clone
#[derive(Clone)]
pub struct StateReporter {
    tx: Arc<watch::Sender<Arc<BalancerReport>>>,
}

impl Default for StateReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StateReporter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(BalancerReport::default()));
        Self { tx: Arc::new(tx) }
    }

    /// Latest report
    pub fn report(&self) -> Arc<BalancerReport> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<BalancerReport>> {
        self.tx.subscribe()
    }

    /// Publish a modified copy of the current report
    pub fn update(&self, f: impl FnOnce(&mut BalancerReport)) {
        let mut next = (*self.report()).clone();
        f(&mut next);
        next.updated_at = Utc::now();
        self.tx.send_replace(Arc::new(next));
    }

    pub fn is_idle(&self) -> bool {
        self.report().idle
    }

    pub fn is_balanced(&self) -> bool {
        self.report().balanced
    }

    /// Balanced, and the last snapshot saw exactly `expected_nodes` alive nodes
    pub fn is_load_balanced(&self, expected_nodes: usize) -> bool {
        let report = self.report();
        report.balanced && report.live_nodes == expected_nodes
    }

    pub fn are_leaders_on_preferred_only(&self) -> bool {
        self.report().leaders_on_preferred_only
    }

    pub fn are_system_leaders_spread(&self) -> bool {
        self.report().system_leaders_spread
    }

    pub fn state(&self) -> LoopState {
        self.report().state
    }

    pub fn last_tick(&self) -> Option<TickSummary> {
        self.report().last_tick.clone()
    }

    pub fn stuck_moves(&self) -> Vec<StuckMove> {
        self.report().stuck_moves.clone()
    }

    /// Replicas hosted by a node in the last evaluation
    pub fn node_load(&self, node: &NodeId) -> Option<u64> {
        self.report()
            .evaluation
            .as_ref()
            .and_then(|e| e.node_replicas.get(node).copied())
    }

    /// Leaders hosted by a node in the last evaluation
    pub fn node_leaders(&self, node: &NodeId) -> Option<u64> {
        self.report()
            .evaluation
            .as_ref()
            .and_then(|e| e.node_leaders.get(node).copied())
    }
}

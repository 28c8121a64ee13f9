//! Run loop
//!
//! One tick: snapshot the cluster, evaluate, plan, dispatch the batch and
//! wait for it to be acknowledged. Ticks never overlap: [`RunLoop::tick`]
//! takes `&mut self` and returns only once no action is pending.

mod backoff;
mod pending;

pub use backoff::{BackoffTracker, StuckMove};
pub use pending::{ActionStatus, PendingAction, PendingActions};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::action::BalancerAction;
use crate::cluster::{AckHandle, ActionAck, ActionDispatcher, ActionId, ClusterSource};
use crate::error::{BalancerError, ConfigError};
use crate::evaluator::{evaluate, Evaluation};
use crate::planner::{Planner, PlannerConfig};
use crate::policy::ResolvedPolicy;
use crate::reporter::StateReporter;
use crate::topology::{ClusterView, TopologySnapshot};
use crate::watch::TopologyWatcher;

/// Run loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLoopConfig {
    /// Tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Snapshot acquisition timeout in milliseconds
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    /// Per-action dispatch timeout in milliseconds
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// How long to wait for a batch to be acknowledged, in milliseconds
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Alive nodes silent for longer than this are treated as unknown
    #[serde(default = "default_heartbeat_staleness_ms")]
    pub heartbeat_staleness_ms: u64,
    /// First retry delay after a failed action, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Retry delay cap in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Consecutive failures before a tablet is reported stuck
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: u32,
    /// Suspension of a stuck tablet in seconds
    #[serde(default = "default_stuck_cooldown_secs")]
    pub stuck_cooldown_secs: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_snapshot_timeout_ms() -> u64 {
    5000
}

fn default_dispatch_timeout_ms() -> u64 {
    2000
}

fn default_ack_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_staleness_ms() -> u64 {
    10_000
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_stuck_threshold() -> u32 {
    5
}

fn default_stuck_cooldown_secs() -> u64 {
    300
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            heartbeat_staleness_ms: default_heartbeat_staleness_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            stuck_threshold: default_stuck_threshold(),
            stuck_cooldown_secs: default_stuck_cooldown_secs(),
        }
    }
}

impl RunLoopConfig {
    pub fn merge(&mut self, other: Self) {
        if other.tick_interval_ms > 0 {
            self.tick_interval_ms = other.tick_interval_ms;
        }
        if other.snapshot_timeout_ms > 0 {
            self.snapshot_timeout_ms = other.snapshot_timeout_ms;
        }
        if other.dispatch_timeout_ms > 0 {
            self.dispatch_timeout_ms = other.dispatch_timeout_ms;
        }
        if other.ack_timeout_ms > 0 {
            self.ack_timeout_ms = other.ack_timeout_ms;
        }
        if other.heartbeat_staleness_ms > 0 {
            self.heartbeat_staleness_ms = other.heartbeat_staleness_ms;
        }
        if other.backoff_base_ms > 0 {
            self.backoff_base_ms = other.backoff_base_ms;
        }
        if other.backoff_max_ms > 0 {
            self.backoff_max_ms = other.backoff_max_ms;
        }
        if other.stuck_threshold > 0 {
            self.stuck_threshold = other.stuck_threshold;
        }
        if other.stuck_cooldown_secs > 0 {
            self.stuck_cooldown_secs = other.stuck_cooldown_secs;
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn heartbeat_staleness(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_staleness_ms as i64)
    }

    pub fn stuck_cooldown(&self) -> Duration {
        Duration::from_secs(self.stuck_cooldown_secs)
    }
}

/// Run loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Evaluating,
    Dispatching,
    /// Last snapshot failed; retried on the next tick
    Cooldown,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Idle => write!(f, "idle"),
            LoopState::Evaluating => write!(f, "evaluating"),
            LoopState::Dispatching => write!(f, "dispatching"),
            LoopState::Cooldown => write!(f, "cooldown"),
        }
    }
}

/// How a tick ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// Nothing to do
    Idle,
    /// A batch was dispatched
    Dispatched,
    /// Some node is unknown; nothing evaluated
    Skipped,
    /// Snapshot failed
    Aborted,
}

/// Summary of one tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub tick: u64,
    pub outcome: TickOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub proposed: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub plan_cost: u64,
    pub outcomes: BTreeMap<ActionId, ActionStatus>,
}

impl TickSummary {
    fn new(tick: u64, outcome: TickOutcome, started_at: DateTime<Utc>) -> Self {
        Self {
            tick,
            outcome,
            started_at,
            finished_at: started_at,
            proposed: 0,
            dispatched: 0,
            completed: 0,
            failed: 0,
            plan_cost: 0,
            outcomes: BTreeMap::new(),
        }
    }
}

/// The balancer control loop
pub struct RunLoop {
    config: RunLoopConfig,
    planner: Planner,
    source: Arc<dyn ClusterSource>,
    dispatcher: Arc<dyn ActionDispatcher>,
    watcher: TopologyWatcher,
    reporter: StateReporter,
    pending: PendingActions,
    backoff: BackoffTracker,
    ack_tx: mpsc::UnboundedSender<ActionAck>,
    ack_rx: mpsc::UnboundedReceiver<ActionAck>,
    next_action_id: ActionId,
    ticks: u64,
    state: LoopState,
}

impl RunLoop {
    pub fn new(
        config: RunLoopConfig,
        planner: PlannerConfig,
        source: Arc<dyn ClusterSource>,
        dispatcher: Arc<dyn ActionDispatcher>,
        watcher: TopologyWatcher,
        reporter: StateReporter,
    ) -> Self {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let backoff = BackoffTracker::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.stuck_threshold,
            config.stuck_cooldown(),
        );
        Self {
            config,
            planner: Planner::new(planner),
            source,
            dispatcher,
            watcher,
            reporter,
            pending: PendingActions::new(),
            backoff,
            ack_tx,
            ack_rx,
            next_action_id: 1,
            ticks: 0,
            state: LoopState::Idle,
        }
    }

    pub fn config(&self) -> &RunLoopConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn pending(&self) -> &PendingActions {
        &self.pending
    }

    pub fn backoff(&self) -> &BackoffTracker {
        &self.backoff
    }

    fn set_state(&mut self, state: LoopState) {
        self.state = state;
        let pending = self.pending.len();
        self.reporter.update(|r| {
            r.state = state;
            r.pending_actions = pending;
        });
    }

    /// Run one tick
    pub async fn tick(&mut self) -> Result<TickSummary, BalancerError> {
        self.ticks += 1;
        let tick = self.ticks;
        let started_at = Utc::now();
        self.set_state(LoopState::Evaluating);

        let seen_version = self.watcher.version();
        let view = match self.acquire_view().await {
            Ok(view) => view,
            Err(e) => {
                warn!("Tick {} aborted, cluster snapshot failed: {}", tick, e);
                self.state = LoopState::Cooldown;
                let mut summary = TickSummary::new(tick, TickOutcome::Aborted, started_at);
                summary.finished_at = Utc::now();
                let error = e.to_string();
                self.reporter.update(|r| {
                    r.state = LoopState::Cooldown;
                    r.last_error = Some(error);
                    r.last_tick = Some(summary);
                });
                return Err(e);
            }
        };

        let unknown = view.topology.unknown_nodes();
        if !unknown.is_empty() {
            info!("Skipping tick {}: nodes in unknown state: {:?}", tick, unknown);
            self.state = LoopState::Idle;
            let mut summary = TickSummary::new(tick, TickOutcome::Skipped, started_at);
            summary.finished_at = Utc::now();
            self.reporter.update(|r| {
                r.state = LoopState::Idle;
                r.idle = true;
                r.last_error = None;
                r.last_tick = Some(summary.clone());
            });
            return Ok(summary);
        }

        self.backoff.retain_tablets(|t| view.tablets.contains_key(t));
        let evaluation = evaluate(&view);
        let now = Instant::now();
        let mut excluded = self.backoff.blocked(now);
        excluded.extend(self.pending.tablets());
        let plan = self.planner.plan(&view, &evaluation, &excluded);

        let mut summary = TickSummary::new(
            tick,
            if plan.is_empty() {
                TickOutcome::Idle
            } else {
                TickOutcome::Dispatched
            },
            started_at,
        );
        summary.proposed = plan.len();
        summary.plan_cost = plan.cost;
        self.publish_evaluation(&evaluation, plan.is_empty(), &summary);

        if plan.is_empty() {
            debug!(
                "Tick {}: nothing to do (balanced: {})",
                tick,
                evaluation.is_balanced()
            );
            self.state = LoopState::Idle;
            return Ok(summary);
        }

        info!(
            "Tick {}: dispatching {} actions (cost {}, {} violations)",
            tick,
            plan.len(),
            plan.cost,
            evaluation.violations.len()
        );
        self.set_state(LoopState::Dispatching);
        for action in plan.into_actions() {
            self.dispatch(action, &mut summary).await;
        }
        self.await_acks(&mut summary, seen_version).await;

        summary.finished_at = Utc::now();
        info!(
            "Tick {} finished: {} completed, {} failed",
            tick, summary.completed, summary.failed
        );
        self.state = LoopState::Idle;
        let stuck = self.backoff.stuck_moves(Instant::now());
        self.reporter.update(|r| {
            r.state = LoopState::Idle;
            r.pending_actions = 0;
            r.stuck_moves = stuck;
            r.last_tick = Some(summary.clone());
        });
        Ok(summary)
    }

    fn publish_evaluation(&self, evaluation: &Evaluation, idle: bool, summary: &TickSummary) {
        let idle = idle && self.pending.is_empty();
        let stuck = self.backoff.stuck_moves(Instant::now());
        let evaluation = evaluation.clone();
        let summary = summary.clone();
        self.reporter.update(|r| {
            r.idle = idle;
            r.balanced = evaluation.is_balanced();
            r.leaders_on_preferred_only = evaluation.leaders_on_preferred_only;
            r.system_leaders_spread = evaluation.system_leaders_spread;
            r.live_nodes = evaluation.live_nodes;
            r.evaluation = Some(evaluation);
            r.stuck_moves = stuck;
            r.last_error = None;
            r.last_tick = Some(summary);
        });
    }

    async fn acquire_view(&self) -> Result<ClusterView, BalancerError> {
        let timeout = self.config.snapshot_timeout();
        tokio::time::timeout(timeout, self.fetch_view())
            .await
            .map_err(|_| BalancerError::Timeout {
                operation: "cluster snapshot",
                timeout,
            })?
    }

    async fn fetch_view(&self) -> Result<ClusterView, BalancerError> {
        let nodes = self.source.topology().await?;
        let topology = TopologySnapshot::new(nodes, self.config.heartbeat_staleness(), Utc::now());

        let mut tablets = BTreeMap::new();
        let mut policies = BTreeMap::new();
        let preferred_zones = self.source.preferred_zones().await?;
        for table in self.source.tables().await? {
            // A table dropped while the snapshot is taken simply disappears.
            let policy = match self.source.placement_policy(&table.id).await {
                Err(BalancerError::Config(ConfigError::UnknownTable(_))) => continue,
                result => result?,
            };
            let assignment = match self.source.tablet_assignment(&table.id).await {
                Err(BalancerError::Config(ConfigError::UnknownTable(_))) => continue,
                result => result?,
            };
            policies.insert(table.id.clone(), ResolvedPolicy::resolve(table.id.clone(), policy));
            for tablet in assignment {
                tablets.insert(tablet.id.clone(), tablet);
            }
        }

        Ok(ClusterView {
            topology,
            tablets,
            policies,
            preferred_zones,
        })
    }

    async fn dispatch(&mut self, action: BalancerAction, summary: &mut TickSummary) {
        let id = self.next_action_id;
        self.next_action_id += 1;
        let ack = AckHandle::new(id, action.tablet.clone(), self.ack_tx.clone());
        let timeout = self.config.dispatch_timeout();

        let error = match tokio::time::timeout(timeout, self.dispatcher.dispatch(action.clone(), ack)).await {
            Ok(Ok(())) => {
                debug!("Dispatched action {}: {}", id, action);
                self.pending.insert(id, action);
                summary.dispatched += 1;
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("dispatch timed out after {:?}", timeout),
        };

        warn!("Action {} ({}) rejected: {}", id, action, error);
        self.backoff.record_failure(&action.tablet, error, Instant::now());
        summary.failed += 1;
        summary.outcomes.insert(id, ActionStatus::Failed);
    }

    /// Wait until every pending action is acknowledged or the deadline passes
    ///
    /// `seen` is the topology version the batch was planned against; any
    /// change since then is checked before waiting.
    async fn await_acks(&mut self, summary: &mut TickSummary, mut seen: u64) {
        let deadline = Instant::now() + self.config.ack_timeout();

        while !self.pending.is_empty() {
            let notify = self.watcher.watch(seen).await;
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.watcher.version();
            if current != seen {
                seen = current;
                self.refresh_pending(summary).await;
                continue;
            }

            tokio::select! {
                ack = self.ack_rx.recv() => match ack {
                    Some(ack) => self.handle_ack(ack, summary),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    for pending in self.pending.drain() {
                        warn!(
                            "Action {} ({}) not acknowledged within {:?}",
                            pending.id,
                            pending.action,
                            self.config.ack_timeout()
                        );
                        self.backoff
                            .record_failure(&pending.action.tablet, "acknowledgement timed out", Instant::now());
                        summary.failed += 1;
                        summary.outcomes.insert(pending.id, ActionStatus::TimedOut);
                    }
                }
                _ = &mut notified => {
                    seen = self.watcher.version();
                    self.refresh_pending(summary).await;
                }
            }
        }
    }

    fn handle_ack(&mut self, ack: ActionAck, summary: &mut TickSummary) {
        let Some(pending) = self.pending.remove(ack.action_id) else {
            debug!("Ignoring ack for unknown action {}", ack.action_id);
            return;
        };
        match ack.outcome {
            Ok(()) => {
                debug!("Action {} completed: {}", pending.id, pending.action);
                self.backoff.record_success(&pending.action.tablet);
                summary.completed += 1;
                summary.outcomes.insert(pending.id, ActionStatus::Completed);
            }
            Err(reason) => {
                warn!("Action {} ({}) failed: {}", pending.id, pending.action, reason);
                self.backoff
                    .record_failure(&pending.action.tablet, reason, Instant::now());
                summary.failed += 1;
                summary.outcomes.insert(pending.id, ActionStatus::Failed);
            }
        }
    }

    /// Fail pending actions whose nodes left the cluster
    async fn refresh_pending(&mut self, summary: &mut TickSummary) {
        let timeout = self.config.snapshot_timeout();
        let nodes = match tokio::time::timeout(timeout, self.source.topology()).await {
            Ok(Ok(nodes)) => nodes,
            Ok(Err(e)) => {
                warn!("Topology refresh failed: {}", e);
                return;
            }
            Err(_) => {
                warn!("Topology refresh timed out after {:?}", timeout);
                return;
            }
        };
        let topology = TopologySnapshot::new(nodes, self.config.heartbeat_staleness(), Utc::now());

        for id in self.pending.invalidated_by(|node| !topology.is_live(node)) {
            if let Some(pending) = self.pending.remove(id) {
                warn!("Cancelling action {} ({}): node no longer live", id, pending.action);
                self.backoff
                    .record_failure(&pending.action.tablet, "node no longer live", Instant::now());
                summary.failed += 1;
                summary.outcomes.insert(id, ActionStatus::Cancelled);
            }
        }
    }
}

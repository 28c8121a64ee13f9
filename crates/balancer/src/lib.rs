//! Balancer - Tablet and leader placement balancer
//!
//! Continuously drives a partitioned, replicated cluster toward a state where
//! every tablet satisfies its placement policy, replica and leader counts are
//! even inside each placement group, and leaders sit in the preferred zones.
//!
//! # Features
//! - Placement policy validation and per-table overrides
//! - Constraint and balance evaluation over a point-in-time snapshot
//! - Cost-bounded, simulated move planning
//! - A tick-driven run loop with per-tablet backoff
//! - Lock-free status reporting
//!
//! # Usage Example
//! ```ignore
//! use std::sync::Arc;
//! use balancer::watch::TopologyWatcher;
//! use balancer::{Balancer, BalancerConfig, LocalCluster};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let config = BalancerConfig::default();
//! let cluster = LocalCluster::new("default", config.node_manager.clone(), TopologyWatcher::new());
//! let balancer = Arc::new(Balancer::with_local_cluster(&cluster, &config));
//! balancer.clone().start(shutdown_rx);
//! ```

pub mod action;
pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod local;
pub mod metadata;
pub mod node_manager;
pub mod planner;
pub mod policy;
pub mod reporter;
pub mod scheduler;
pub mod topology;
pub mod watch;

// Re-export commonly used types
pub use action::{ActionKind, BalancerAction};
pub use config::BalancerConfig;
pub use error::{BalancerError, ConfigError, DispatchError};
pub use local::LocalCluster;
pub use reporter::{BalancerReport, StateReporter};
pub use scheduler::{LoopState, RunLoop, TickSummary};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use cluster::{ActionDispatcher, ClusterSource, PlacementAdmin};
use metadata::TableId;
use planner::PlannerConfig;
use policy::{parse_preferred_zones, PlacementPolicy};
use scheduler::RunLoopConfig;
use watch::TopologyWatcher;

/// Balancer service
///
/// Owns the run loop and exposes the status queries and policy mutations.
/// Mutations are validated before anything is stored and wake the loop.
pub struct Balancer {
    run_loop: Mutex<RunLoop>,
    reporter: StateReporter,
    admin: Arc<dyn PlacementAdmin>,
    watcher: TopologyWatcher,
    tick_interval: Duration,
}

impl Balancer {
    pub fn new(
        config: RunLoopConfig,
        planner: PlannerConfig,
        source: Arc<dyn ClusterSource>,
        dispatcher: Arc<dyn ActionDispatcher>,
        admin: Arc<dyn PlacementAdmin>,
        watcher: TopologyWatcher,
    ) -> Self {
        let reporter = StateReporter::new();
        let tick_interval = config.tick_interval();
        let run_loop = RunLoop::new(
            config,
            planner,
            source,
            dispatcher,
            watcher.clone(),
            reporter.clone(),
        );
        Self {
            run_loop: Mutex::new(run_loop),
            reporter,
            admin,
            watcher,
            tick_interval,
        }
    }

    /// Balancer wired to an in-process cluster
    pub fn with_local_cluster(cluster: &LocalCluster, config: &BalancerConfig) -> Self {
        let watcher = cluster.watcher().clone();
        let cluster = Arc::new(cluster.clone());
        Self::new(
            config.balancer.clone(),
            config.planner.clone(),
            cluster.clone(),
            cluster.clone(),
            cluster,
            watcher,
        )
    }

    pub fn reporter(&self) -> &StateReporter {
        &self.reporter
    }

    pub fn watcher(&self) -> &TopologyWatcher {
        &self.watcher
    }

    /// Run a single tick; concurrent callers queue up behind each other
    pub async fn tick(&self) -> Result<TickSummary, BalancerError> {
        self.run_loop.lock().await.tick().await
    }

    /// Run a single tick, or return `None` if one is already running
    pub async fn try_tick(&self) -> Option<Result<TickSummary, BalancerError>> {
        let mut run_loop = self.run_loop.try_lock().ok()?;
        Some(run_loop.tick().await)
    }

    /// Tick until `shutdown` flips to true
    ///
    /// A tick starts every `tick_interval`, or right away when the topology
    /// or policy changes.
    pub fn start(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Balancer started, tick interval {:?}", self.tick_interval);
            loop {
                if *shutdown.borrow() {
                    break;
                }

                // Register before ticking so changes made during the tick are not missed.
                let seen = self.watcher.version();
                let notify = self.watcher.watch(seen).await;
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.tick().await {
                    Ok(summary) => debug!("Tick {} finished: {:?}", summary.tick, summary.outcome),
                    Err(e) if e.is_transient() => warn!("Tick failed, retrying: {}", e),
                    Err(e) => error!("Tick failed: {}", e),
                }

                if self.watcher.version() != seen {
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.tick_interval) => {}
                    _ = &mut notified => debug!("Topology changed, re-evaluating"),
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("Balancer stopped");
        })
    }

    pub fn is_load_balancer_idle(&self) -> bool {
        self.reporter.is_idle()
    }

    pub fn is_load_balanced(&self, expected_node_count: usize) -> bool {
        self.reporter.is_load_balanced(expected_node_count)
    }

    pub fn are_leaders_on_preferred_only(&self) -> bool {
        self.reporter.are_leaders_on_preferred_only()
    }

    pub fn are_system_leaders_spread(&self) -> bool {
        self.reporter.are_system_leaders_spread()
    }

    /// Replace the cluster-wide placement policy
    pub async fn modify_placement_info(&self, blocks_spec: &str, replication_factor: u32) -> Result<(), BalancerError> {
        let policy = PlacementPolicy::parse(blocks_spec, replication_factor)?;
        self.admin.store_placement(policy).await?;
        info!(
            "Placement changed: blocks='{}', replication factor {}",
            blocks_spec, replication_factor
        );
        self.watcher.bump().await;
        Ok(())
    }

    /// Override the placement policy of one table
    pub async fn modify_table_placement_info(
        &self,
        table: &TableId,
        blocks_spec: &str,
        replication_factor: u32,
    ) -> Result<(), BalancerError> {
        let policy = PlacementPolicy::parse(blocks_spec, replication_factor)?;
        self.admin.store_table_placement(table, policy).await?;
        info!(
            "Placement of table {} changed: blocks='{}', replication factor {}",
            table, blocks_spec, replication_factor
        );
        self.watcher.bump().await;
        Ok(())
    }

    /// Replace the preferred leader zones; an empty list clears them
    pub async fn set_preferred_zones<S: AsRef<str>>(&self, zones: &[S]) -> Result<(), BalancerError> {
        let zones = parse_preferred_zones(zones)?;
        let listed: Vec<String> = zones.iter().map(|z| z.to_string()).collect();
        self.admin.store_preferred_zones(zones).await?;
        info!("Preferred zones set to {:?}", listed);
        self.watcher.bump().await;
        Ok(())
    }

    pub async fn set_system_tables_use_preferred_zones(&self, enabled: bool) -> Result<(), BalancerError> {
        self.admin.store_system_tables_use_preferred_zones(enabled).await?;
        info!("System tables use preferred zones: {}", enabled);
        self.watcher.bump().await;
        Ok(())
    }
}

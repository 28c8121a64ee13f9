//! Balancer service entry point

use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use balancer::api::HttpApi;
use balancer::watch::TopologyWatcher;
use balancer::{Balancer, BalancerConfig, LocalCluster};

/// Balancer - Tablet and leader placement balancer
#[derive(Parser, Debug)]
#[command(name = "balancer")]
#[command(about = "Tablet and leader placement balancer for a partitioned database")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'f', long)]
    config: Option<String>,

    /// Cluster name
    #[arg(short, long)]
    cluster: Option<String>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Tick interval (milliseconds)
    #[arg(long)]
    tick_interval_ms: Option<u64>,

    /// Heartbeat timeout (seconds)
    #[arg(long)]
    heartbeat_timeout: Option<i64>,

    /// Placement blocks, e.g. "c.r.z0,c.r.z1,c.r.z2"
    #[arg(long)]
    placement: Option<String>,

    /// Replication factor
    #[arg(long)]
    replication_factor: Option<u32>,

    /// Preferred leader zones, comma separated
    #[arg(long, value_delimiter = ',')]
    preferred_zones: Vec<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Apply command line overrides on top of the file configuration
    fn apply(self, config: &mut BalancerConfig) {
        if let Some(cluster) = self.cluster {
            config.cluster.name = cluster;
        }
        if let Some(http_addr) = self.http_addr {
            config.server.http_addr = http_addr;
        }
        if let Some(tick) = self.tick_interval_ms {
            config.balancer.tick_interval_ms = tick;
        }
        if let Some(timeout) = self.heartbeat_timeout {
            config.node_manager.heartbeat_timeout_secs = timeout;
        }
        if let Some(placement) = self.placement {
            config.placement.blocks = placement;
        }
        if let Some(rf) = self.replication_factor {
            config.placement.replication_factor = rf;
        }
        if !self.preferred_zones.is_empty() {
            config.placement.preferred_zones = self.preferred_zones;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BalancerConfig::from_file(path)?,
        None => BalancerConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting balancer...");
    info!("  Cluster: {}", config.cluster.name);
    info!("  HTTP API: {}", config.server.http_addr);
    info!("  Tick interval: {}ms", config.balancer.tick_interval_ms);

    let cluster = LocalCluster::new(
        config.cluster.name.clone(),
        config.node_manager.clone(),
        TopologyWatcher::new(),
    );
    let balancer = Arc::new(Balancer::with_local_cluster(&cluster, &config));

    // Initial policy
    balancer
        .modify_placement_info(&config.placement.blocks, config.placement.replication_factor)
        .await?;
    balancer
        .set_preferred_zones(&config.placement.preferred_zones)
        .await?;
    balancer
        .set_system_tables_use_preferred_zones(config.placement.system_tables_use_preferred_zones)
        .await?;

    // Start background tasks
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let _heartbeat_handle = cluster.node_manager().clone().start_heartbeat_checker();
    let balancer_handle = balancer.clone().start(shutdown_rx);

    // Start HTTP API
    let http_api = HttpApi::new(balancer.clone(), cluster.clone());
    let app = http_api.router();

    let listener = tokio::net::TcpListener::bind(&config.server.http_addr).await?;
    info!("HTTP API listening on {}", config.server.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    shutdown_tx.send(true)?;
    balancer_handle.await?;

    Ok(())
}

#![allow(dead_code)]

use std::sync::Arc;

use balancer::metadata::{NodeId, NodeInfo, TableInfo, TabletInfo};
use balancer::node_manager::NodeManagerConfig;
use balancer::scheduler::TickOutcome;
use balancer::watch::TopologyWatcher;
use balancer::{Balancer, BalancerConfig, LocalCluster, TickSummary};

/// Local cluster plus a balancer driven tick by tick
pub struct TestCluster {
    pub cluster: LocalCluster,
    pub balancer: Arc<Balancer>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BalancerConfig) -> Self {
        let cluster = LocalCluster::new("test", NodeManagerConfig::default(), TopologyWatcher::new());
        let balancer = Arc::new(Balancer::with_local_cluster(&cluster, &config));
        Self { cluster, balancer }
    }

    /// Three alive nodes n0/n1/n2 in zones c.r.z0/c.r.z1/c.r.z2
    pub async fn three_zones() -> Self {
        let tc = Self::new();
        for i in 0..3 {
            tc.add_node(&format!("n{}", i), &format!("c.r.z{}", i)).await;
        }
        tc
    }

    pub async fn add_node(&self, id: &str, zone: &str) {
        let node = NodeInfo::new(id, zone.parse().expect("valid placement"));
        self.cluster.node_manager().register(node).await;
    }

    pub async fn create_table(&self, id: &str, system: bool, tablets: &[&[&str]]) -> Vec<TabletInfo> {
        let replica_sets = tablets
            .iter()
            .map(|replicas| replicas.iter().map(|r| r.to_string()).collect())
            .collect();
        self.cluster
            .create_table(TableInfo::new(id, system), replica_sets)
            .await
            .expect("table created")
    }

    pub async fn tick(&self) -> TickSummary {
        self.balancer.tick().await.expect("tick succeeds")
    }

    /// Tick until a tick finds nothing to do; panics if that takes too long
    pub async fn converge(&self) -> usize {
        for ticks in 1..=50 {
            if self.tick().await.outcome == TickOutcome::Idle {
                return ticks;
            }
        }
        panic!("balancer did not converge within 50 ticks");
    }

    pub async fn load(&self, node: &str) -> usize {
        self.cluster.node_load(&node.to_string()).await
    }

    pub async fn leaders(&self, node: &str) -> usize {
        self.cluster.node_leaders(&node.to_string()).await
    }

    /// Leader of every tablet of a table
    pub async fn table_leaders(&self, table: &str) -> Vec<Option<NodeId>> {
        self.cluster
            .tablets_of(&table.to_string())
            .await
            .into_iter()
            .map(|t| t.leader)
            .collect()
    }
}

/// Short timeouts so failures surface quickly
pub fn test_config() -> BalancerConfig {
    let mut config = BalancerConfig::default();
    config.balancer.tick_interval_ms = 50;
    config.balancer.ack_timeout_ms = 5_000;
    config.balancer.backoff_base_ms = 100;
    config.balancer.backoff_max_ms = 1_000;
    config.balancer.stuck_threshold = 3;
    config.balancer.stuck_cooldown_secs = 10;
    config
}

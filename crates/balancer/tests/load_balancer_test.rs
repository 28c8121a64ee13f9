//! End-to-end balancing scenarios against the local cluster

mod common;

use balancer::scheduler::TickOutcome;
use common::test_cluster::TestCluster;

const ZONE_BLOCKS: &str = "c.r.z0,c.r.z1,c.r.z2";

#[tokio::test]
async fn test_uneven_tablets_converge_to_balanced() {
    let tc = TestCluster::three_zones().await;
    tc.create_table(
        "t",
        false,
        &[&["n0"], &["n0", "n1"], &["n0"], &["n1", "n2"]],
    )
    .await;

    tc.converge().await;

    for node in ["n0", "n1", "n2"] {
        assert_eq!(tc.load(node).await, 4, "replicas on {}", node);
        assert!(tc.leaders(node).await <= 2);
    }
    assert!(tc.balancer.is_load_balancer_idle());
    assert!(tc.balancer.is_load_balanced(3));
    assert!(!tc.balancer.is_load_balanced(4));
}

#[tokio::test]
async fn test_leaders_follow_preferred_zones() {
    let tc = TestCluster::three_zones().await;
    tc.create_table(
        "t",
        false,
        &[
            &["n0", "n1", "n2"],
            &["n1", "n2", "n0"],
            &["n2", "n0", "n1"],
            &["n0", "n1", "n2"],
        ],
    )
    .await;
    tc.converge().await;
    assert!(!tc.balancer.are_leaders_on_preferred_only());

    tc.balancer.set_preferred_zones(&["c.r.z1"]).await.unwrap();
    tc.converge().await;
    assert!(tc.balancer.are_leaders_on_preferred_only());
    assert!(tc.balancer.is_load_balanced(3));
    for leader in tc.table_leaders("t").await {
        assert_eq!(leader.as_deref(), Some("n1"));
    }

    // Clearing the set spreads leaders again.
    tc.balancer.set_preferred_zones::<&str>(&[]).await.unwrap();
    tc.converge().await;
    assert!(!tc.balancer.are_leaders_on_preferred_only());
    assert!(tc.balancer.is_load_balanced(3));
    assert!(tc.leaders("n1").await <= 2);
}

#[tokio::test]
async fn test_preferred_zones_reported_without_tables() {
    let tc = TestCluster::three_zones().await;
    tc.balancer.set_preferred_zones(&["c.r.z1"]).await.unwrap();

    assert_eq!(tc.tick().await.outcome, TickOutcome::Idle);
    assert!(tc.balancer.are_leaders_on_preferred_only());

    tc.balancer.set_preferred_zones::<&str>(&[]).await.unwrap();
    tc.tick().await;
    assert!(!tc.balancer.are_leaders_on_preferred_only());
}

#[tokio::test]
async fn test_new_node_takes_its_share_of_the_zone() {
    let tc = TestCluster::three_zones().await;
    tc.balancer.modify_placement_info(ZONE_BLOCKS, 3).await.unwrap();
    tc.create_table(
        "t",
        false,
        &[
            &["n0", "n1", "n2"],
            &["n1", "n2", "n0"],
            &["n2", "n0", "n1"],
            &["n0", "n1", "n2"],
        ],
    )
    .await;
    tc.converge().await;
    assert!(tc.balancer.is_load_balancer_idle());

    tc.add_node("n3", "c.r.z1").await;
    let summary = tc.tick().await;
    assert_eq!(summary.outcome, TickOutcome::Dispatched);
    assert!(!tc.balancer.is_load_balancer_idle());

    tc.converge().await;
    assert!(tc.balancer.is_load_balancer_idle());
    assert!(tc.balancer.is_load_balanced(4));
    assert_eq!(tc.load("n1").await, 2);
    assert_eq!(tc.load("n3").await, 2);
    // Other zones keep every tablet.
    assert_eq!(tc.load("n0").await, 4);
    assert_eq!(tc.load("n2").await, 4);
}

#[tokio::test]
async fn test_anywhere_policy_keeps_zone_spread_when_node_joins() {
    let tc = TestCluster::three_zones().await;
    tc.create_table(
        "t",
        false,
        &[
            &["n0", "n1", "n2"],
            &["n1", "n2", "n0"],
            &["n2", "n0", "n1"],
            &["n0", "n1", "n2"],
        ],
    )
    .await;
    tc.converge().await;

    tc.add_node("n3", "c.r.z1").await;
    let summary = tc.tick().await;
    assert_eq!(summary.outcome, TickOutcome::Dispatched);

    // Only n1 may give replicas to n3 without a tablet losing a zone.
    tc.converge().await;
    assert!(tc.balancer.is_load_balancer_idle());
    assert!(tc.balancer.is_load_balanced(4));
    assert_eq!(tc.load("n1").await, 2);
    assert_eq!(tc.load("n3").await, 2);
    assert_eq!(tc.load("n0").await, 4);
    assert_eq!(tc.load("n2").await, 4);
}

#[tokio::test]
async fn test_table_deletion_keeps_balancer_idle() {
    let tc = TestCluster::three_zones().await;
    tc.create_table("t1", false, &[&["n0", "n1", "n2"]]).await;
    tc.create_table("t2", false, &[&["n1", "n2", "n0"]]).await;
    tc.converge().await;
    assert!(tc.balancer.is_load_balancer_idle());

    let version = tc.balancer.watcher().version();
    tc.cluster.delete_table(&"t2".to_string()).await.unwrap();
    assert_eq!(tc.balancer.watcher().version(), version);
    assert!(tc.balancer.is_load_balancer_idle());

    assert_eq!(tc.tick().await.outcome, TickOutcome::Idle);
    assert!(tc.balancer.is_load_balancer_idle());
    assert!(tc.balancer.is_load_balanced(3));
}

#[tokio::test]
async fn test_system_tables_opt_into_preferred_zones() {
    let tc = TestCluster::three_zones().await;
    let full: &[&str] = &["n0", "n1", "n2"];
    tc.create_table("t", false, &[full, full, full]).await;
    tc.create_table("sys", true, &[full, full, full]).await;
    tc.balancer.set_preferred_zones(&["c.r.z1"]).await.unwrap();

    tc.converge().await;
    for leader in tc.table_leaders("t").await {
        assert_eq!(leader.as_deref(), Some("n1"));
    }
    let mut system_leaders: Vec<_> = tc.table_leaders("sys").await.into_iter().flatten().collect();
    system_leaders.sort();
    assert_eq!(system_leaders, vec!["n0", "n1", "n2"]);
    assert!(tc.balancer.are_system_leaders_spread());
    assert!(!tc.balancer.are_leaders_on_preferred_only());

    tc.balancer.set_system_tables_use_preferred_zones(true).await.unwrap();
    tc.converge().await;
    for leader in tc.table_leaders("sys").await {
        assert_eq!(leader.as_deref(), Some("n1"));
    }
    assert!(!tc.balancer.are_system_leaders_spread());
    assert!(tc.balancer.are_leaders_on_preferred_only());

    tc.balancer.set_system_tables_use_preferred_zones(false).await.unwrap();
    tc.converge().await;
    assert!(tc.balancer.are_system_leaders_spread());
    assert!(tc.balancer.is_load_balanced(3));
}

#[tokio::test]
async fn test_drained_node_is_emptied() {
    let tc = TestCluster::three_zones().await;
    tc.add_node("n3", "c.r.z0").await;
    tc.create_table(
        "t",
        false,
        &[&["n0", "n1", "n2"], &["n0", "n1", "n2"], &["n3", "n1", "n2"]],
    )
    .await;
    tc.converge().await;

    tc.cluster.node_manager().drain_node(&"n0".to_string()).await;
    tc.converge().await;
    assert_eq!(tc.load("n0").await, 0);
    assert_eq!(tc.leaders("n0").await, 0);
    assert_eq!(tc.load("n3").await, 3);
    // n0 no longer counts as a data-accepting node.
    assert!(tc.balancer.is_load_balanced(3));
}

#[tokio::test]
async fn test_dead_node_replicas_are_replaced() {
    let tc = TestCluster::three_zones().await;
    tc.add_node("n3", "c.r.z2").await;
    tc.create_table("t", false, &[&["n0", "n1", "n2"], &["n2", "n0", "n1"]]).await;
    tc.converge().await;

    tc.cluster.node_manager().mark_dead(&"n2".to_string()).await;
    // Leadership already moved off the dead node.
    assert_eq!(tc.leaders("n2").await, 0);

    tc.converge().await;
    assert_eq!(tc.load("n2").await, 0);
    assert_eq!(tc.load("n3").await, 2);
    let evaluation = tc.balancer.reporter().report().evaluation.clone().unwrap();
    assert!(evaluation.violations.is_empty());
}

#[tokio::test]
async fn test_unsatisfiable_block_is_reported_not_acted_on() {
    let tc = TestCluster::three_zones().await;
    tc.balancer
        .modify_placement_info("c.r.z0,c.r.z1,c.r.z9", 3)
        .await
        .unwrap();
    tc.create_table("t", false, &[&["n0", "n1"]]).await;

    let summary = tc.tick().await;
    assert_eq!(summary.outcome, TickOutcome::Idle);
    let report = tc.balancer.reporter().report();
    let evaluation = report.evaluation.as_ref().unwrap();
    assert_eq!(evaluation.unsatisfiable().count(), 1);
    assert!(!report.balanced);
    assert!(report.idle);
}

#[tokio::test]
async fn test_invalid_policy_leaves_state_unchanged() {
    let tc = TestCluster::three_zones().await;
    let version = tc.balancer.watcher().version();

    assert!(tc.balancer.modify_placement_info(ZONE_BLOCKS, 0).await.is_err());
    assert!(tc.balancer.modify_placement_info("c.r.z0:2,c.r", 3).await.is_err());
    assert!(tc
        .balancer
        .set_preferred_zones(&["c.r.z1", "c.r.z1"])
        .await
        .is_err());
    assert!(tc
        .balancer
        .modify_table_placement_info(&"missing".to_string(), ZONE_BLOCKS, 3)
        .await
        .is_err());

    assert_eq!(tc.balancer.watcher().version(), version);
    let metadata = tc.cluster.metadata().await;
    assert!(metadata.placement.is_anywhere());
    assert!(metadata.preferred_zones.is_empty());
}

#[tokio::test]
async fn test_table_placement_override() {
    let tc = TestCluster::three_zones().await;
    tc.add_node("n3", "c.r.z0").await;
    tc.create_table("t", false, &[&["n0", "n1", "n2"]]).await;
    tc.converge().await;

    tc.balancer
        .modify_table_placement_info(&"t".to_string(), "c.r.z0:2", 2)
        .await
        .unwrap();
    tc.converge().await;

    let tablet = &tc.cluster.tablets_of(&"t".to_string()).await[0];
    let mut replicas = tablet.replicas.clone();
    replicas.sort();
    assert_eq!(replicas, vec!["n0", "n3"]);
    assert_eq!(tablet.replication_factor, 2);
}

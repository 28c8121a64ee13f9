//! HTTP admin API
//!
//! Balancer status queries, placement policy mutations and local cluster
//! management as a RESTful API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::BalancerError;
use crate::evaluator::Evaluation;
use crate::local::LocalCluster;
use crate::metadata::{NodeInfo, PlacementPath, TableInfo, TabletInfo};
use crate::node_manager::RegisterResult;
use crate::scheduler::{LoopState, StuckMove, TickSummary};
use crate::Balancer;

struct ApiState {
    balancer: Arc<Balancer>,
    cluster: LocalCluster,
}

type SharedState = Arc<ApiState>;

/// HTTP API service
pub struct HttpApi {
    balancer: Arc<Balancer>,
    cluster: LocalCluster,
}

impl HttpApi {
    pub fn new(balancer: Arc<Balancer>, cluster: LocalCluster) -> Self {
        Self { balancer, cluster }
    }

    /// Build the router
    pub fn router(self) -> Router {
        let state = Arc::new(ApiState {
            balancer: self.balancer,
            cluster: self.cluster,
        });

        Router::new()
            // Cluster
            .route("/api/v1/cluster/stats", get(get_cluster_stats))
            // Balancer
            .route("/api/v1/balancer/status", get(get_status))
            .route("/api/v1/balancer/idle", get(get_idle))
            .route("/api/v1/balancer/balanced", get(get_balanced))
            .route("/api/v1/balancer/leaders-on-preferred", get(get_leaders_on_preferred))
            .route("/api/v1/balancer/stuck", get(get_stuck))
            .route("/api/v1/balancer/evaluation", get(get_evaluation))
            .route("/api/v1/balancer/tick", post(trigger_tick))
            // Placement
            .route("/api/v1/placement", post(modify_placement))
            .route("/api/v1/placement/preferred-zones", post(set_preferred_zones))
            .route("/api/v1/placement/system-tables", post(set_system_tables))
            // Nodes
            .route("/api/v1/nodes", get(list_nodes).post(register_node))
            .route("/api/v1/nodes/:node_id", get(get_node).delete(remove_node))
            .route("/api/v1/nodes/:node_id/heartbeat", post(node_heartbeat))
            .route("/api/v1/nodes/:node_id/drain", post(drain_node))
            // Tables
            .route("/api/v1/tables", get(list_tables).post(create_table))
            .route("/api/v1/tables/:table_id", delete(delete_table))
            .route("/api/v1/tables/:table_id/placement", post(modify_table_placement))
            .with_state(state)
    }
}

// ==================== Response types ====================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        })
    }
}

fn error_status(e: &BalancerError) -> StatusCode {
    match e {
        BalancerError::Config(_) => StatusCode::BAD_REQUEST,
        BalancerError::TransientCluster(_) | BalancerError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn mutation_result(result: Result<(), BalancerError>) -> (StatusCode, Json<ApiResponse<()>>) {
    match result {
        Ok(()) => (StatusCode::OK, ApiResponse::ok(())),
        Err(e) => (error_status(&e), ApiResponse::err(e.to_string())),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    state: LoopState,
    idle: bool,
    balanced: bool,
    leaders_on_preferred_only: bool,
    system_leaders_spread: bool,
    live_nodes: usize,
    pending_actions: usize,
    last_tick: Option<TickSummary>,
    last_error: Option<String>,
}

#[derive(Serialize)]
struct RegisterResponse {
    is_new: bool,
}

// ==================== Request types ====================

#[derive(Deserialize)]
struct BalancedQuery {
    expected_nodes: Option<usize>,
}

#[derive(Deserialize)]
struct PlacementRequest {
    #[serde(default)]
    blocks: String,
    replication_factor: u32,
}

#[derive(Deserialize)]
struct PreferredZonesRequest {
    zones: Vec<String>,
}

#[derive(Deserialize)]
struct SystemTablesRequest {
    enabled: bool,
}

#[derive(Deserialize)]
struct RegisterNodeRequest {
    node_id: String,
    placement: String,
    capacity_weight: Option<u32>,
}

#[derive(Deserialize)]
struct CreateTableRequest {
    table_id: String,
    #[serde(default)]
    system: bool,
    /// Initial replica set of each tablet
    tablets: Vec<Vec<String>>,
}

// ==================== Handlers ====================

// Cluster
async fn get_cluster_stats(State(state): State<SharedState>) -> impl IntoResponse {
    ApiResponse::ok(state.cluster.stats().await)
}

// Balancer
async fn get_status(State(state): State<SharedState>) -> impl IntoResponse {
    let report = state.balancer.reporter().report();
    ApiResponse::ok(StatusResponse {
        state: report.state,
        idle: report.idle,
        balanced: report.balanced,
        leaders_on_preferred_only: report.leaders_on_preferred_only,
        system_leaders_spread: report.system_leaders_spread,
        live_nodes: report.live_nodes,
        pending_actions: report.pending_actions,
        last_tick: report.last_tick.clone(),
        last_error: report.last_error.clone(),
    })
}

async fn get_idle(State(state): State<SharedState>) -> impl IntoResponse {
    ApiResponse::ok(state.balancer.is_load_balancer_idle())
}

async fn get_balanced(
    State(state): State<SharedState>,
    Query(query): Query<BalancedQuery>,
) -> impl IntoResponse {
    let balanced = match query.expected_nodes {
        Some(expected) => state.balancer.is_load_balanced(expected),
        None => state.balancer.reporter().is_balanced(),
    };
    ApiResponse::ok(balanced)
}

async fn get_leaders_on_preferred(State(state): State<SharedState>) -> impl IntoResponse {
    ApiResponse::ok(state.balancer.are_leaders_on_preferred_only())
}

async fn get_stuck(State(state): State<SharedState>) -> impl IntoResponse {
    ApiResponse::<Vec<StuckMove>>::ok(state.balancer.reporter().stuck_moves())
}

async fn get_evaluation(State(state): State<SharedState>) -> impl IntoResponse {
    match state.balancer.reporter().report().evaluation.clone() {
        Some(evaluation) => (StatusCode::OK, ApiResponse::ok(evaluation)),
        None => (
            StatusCode::NOT_FOUND,
            ApiResponse::<Evaluation>::err("No evaluation yet"),
        ),
    }
}

async fn trigger_tick(State(state): State<SharedState>) -> impl IntoResponse {
    match state.balancer.try_tick().await {
        Some(Ok(summary)) => (StatusCode::OK, ApiResponse::ok(summary)),
        Some(Err(e)) => (error_status(&e), ApiResponse::<TickSummary>::err(e.to_string())),
        None => (
            StatusCode::CONFLICT,
            ApiResponse::<TickSummary>::err("A tick is already in progress"),
        ),
    }
}

// Placement
async fn modify_placement(
    State(state): State<SharedState>,
    Json(req): Json<PlacementRequest>,
) -> impl IntoResponse {
    mutation_result(
        state
            .balancer
            .modify_placement_info(&req.blocks, req.replication_factor)
            .await,
    )
}

async fn modify_table_placement(
    State(state): State<SharedState>,
    Path(table_id): Path<String>,
    Json(req): Json<PlacementRequest>,
) -> impl IntoResponse {
    mutation_result(
        state
            .balancer
            .modify_table_placement_info(&table_id, &req.blocks, req.replication_factor)
            .await,
    )
}

async fn set_preferred_zones(
    State(state): State<SharedState>,
    Json(req): Json<PreferredZonesRequest>,
) -> impl IntoResponse {
    mutation_result(state.balancer.set_preferred_zones(&req.zones).await)
}

async fn set_system_tables(
    State(state): State<SharedState>,
    Json(req): Json<SystemTablesRequest>,
) -> impl IntoResponse {
    mutation_result(
        state
            .balancer
            .set_system_tables_use_preferred_zones(req.enabled)
            .await,
    )
}

// Nodes
async fn list_nodes(State(state): State<SharedState>) -> impl IntoResponse {
    ApiResponse::ok(state.cluster.node_manager().list_nodes().await)
}

async fn get_node(State(state): State<SharedState>, Path(node_id): Path<String>) -> impl IntoResponse {
    match state.cluster.node_manager().get_node(&node_id).await {
        Some(node) => (StatusCode::OK, ApiResponse::ok(node)),
        None => (
            StatusCode::NOT_FOUND,
            ApiResponse::<NodeInfo>::err(format!("Node {} not found", node_id)),
        ),
    }
}

async fn register_node(
    State(state): State<SharedState>,
    Json(req): Json<RegisterNodeRequest>,
) -> impl IntoResponse {
    let placement: PlacementPath = match req.placement.parse() {
        Ok(placement) => placement,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                ApiResponse::<RegisterResponse>::err(format!("{}", e)),
            )
        }
    };
    let mut node = NodeInfo::new(req.node_id.clone(), placement);
    if let Some(weight) = req.capacity_weight {
        node = node.with_capacity_weight(weight);
    }
    let result = state.cluster.node_manager().register(node).await;

    info!("Node {} registered via HTTP API", req.node_id);
    let is_new = result == RegisterResult::NewNode;
    (StatusCode::CREATED, ApiResponse::ok(RegisterResponse { is_new }))
}

async fn node_heartbeat(State(state): State<SharedState>, Path(node_id): Path<String>) -> impl IntoResponse {
    if state.cluster.node_manager().heartbeat(&node_id).await {
        (StatusCode::OK, ApiResponse::ok(()))
    } else {
        (
            StatusCode::NOT_FOUND,
            ApiResponse::<()>::err(format!("Node {} not found", node_id)),
        )
    }
}

async fn drain_node(State(state): State<SharedState>, Path(node_id): Path<String>) -> impl IntoResponse {
    if state.cluster.node_manager().drain_node(&node_id).await {
        (StatusCode::OK, ApiResponse::ok(()))
    } else {
        (
            StatusCode::NOT_FOUND,
            ApiResponse::<()>::err(format!("Node {} not found", node_id)),
        )
    }
}

async fn remove_node(State(state): State<SharedState>, Path(node_id): Path<String>) -> impl IntoResponse {
    match state.cluster.node_manager().remove_node(&node_id).await {
        Some(_) => (StatusCode::OK, ApiResponse::ok(())),
        None => (
            StatusCode::NOT_FOUND,
            ApiResponse::<()>::err(format!("Node {} not found", node_id)),
        ),
    }
}

// Tables
async fn list_tables(State(state): State<SharedState>) -> impl IntoResponse {
    let metadata = state.cluster.metadata().await;
    let tables: Vec<TableInfo> = metadata.tables.values().cloned().collect();
    ApiResponse::ok(tables)
}

async fn create_table(
    State(state): State<SharedState>,
    Json(req): Json<CreateTableRequest>,
) -> impl IntoResponse {
    info!(
        "Creating table {}: {} tablets, system={}",
        req.table_id,
        req.tablets.len(),
        req.system
    );
    let table = TableInfo::new(req.table_id, req.system);
    match state.cluster.create_table(table, req.tablets).await {
        Ok(tablets) => (StatusCode::CREATED, ApiResponse::ok(tablets)),
        Err(e) => (StatusCode::BAD_REQUEST, ApiResponse::<Vec<TabletInfo>>::err(e)),
    }
}

async fn delete_table(State(state): State<SharedState>, Path(table_id): Path<String>) -> impl IntoResponse {
    match state.cluster.delete_table(&table_id).await {
        Some(tablets) => (StatusCode::OK, ApiResponse::ok(tablets.len())),
        None => (
            StatusCode::NOT_FOUND,
            ApiResponse::<usize>::err(format!("Table {} not found", table_id)),
        ),
    }
}

//! Error types
//!
//! Mirrors the failure taxonomy of the balancer: transient cluster errors abort
//! a tick, configuration errors are rejected before any state changes, and
//! dispatch errors feed the per-tablet backoff.

use std::time::Duration;

use crate::metadata::{NodeId, TabletId};

/// Configuration error
///
/// Raised when a placement mutation or a configuration file is rejected.
/// State is never modified when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid placement path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("Invalid placement block spec '{spec}': {reason}")]
    InvalidBlockSpec { spec: String, reason: String },
    #[error("Replication factor must be at least 1")]
    ZeroReplicationFactor,
    #[error("Placement block {0} requires at least one replica")]
    EmptyBlock(String),
    #[error("Placement blocks sum to {total} replicas but replication factor is {replication_factor}")]
    BlockSumMismatch { total: u32, replication_factor: u32 },
    #[error("Placement blocks {0} and {1} overlap")]
    OverlappingBlocks(String, String),
    #[error("Preferred zone {0} listed more than once")]
    DuplicateZone(String),
    #[error("Table {0} not found")]
    UnknownTable(String),
}

/// Balancer error
#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    /// Snapshot fetch failed or a collaborator was unreachable; retried on the next tick
    #[error("Transient cluster error: {0}")]
    TransientCluster(String),
    /// A collaborator call did not finish in time
    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BalancerError {
    /// Whether retrying on the next tick may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BalancerError::TransientCluster(_) | BalancerError::Timeout { .. }
        )
    }
}

/// Failure returned synchronously by the command channel
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Tablet {0} not found")]
    UnknownTablet(TabletId),
    #[error("Node {0} cannot accept the action")]
    IneligibleNode(NodeId),
    #[error("Action rejected: {0}")]
    Rejected(String),
    #[error("Dispatch timed out")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(String),
}

//! Cluster metadata definitions
//!
//! Contains core data structures such as nodes, placement paths, tables and tablets

mod placement;
mod node;
mod tablet;
mod cluster;

pub use placement::PlacementPath;
pub use node::{NodeId, NodeInfo, NodeStatus};
pub use tablet::{TableId, TableInfo, TabletId, TabletInfo};
pub use cluster::{ClusterMetadata, ClusterStats};

//! Placement policy
//!
//! A policy is a replication factor plus a set of placement blocks. Each block
//! names a placement-path prefix and the minimum number of replicas that must
//! live underneath it. Blocks never overlap and always sum to the replication
//! factor, so a compliant tablet has exactly `min_replicas` valid replicas in
//! every block. A policy without blocks places replicas anywhere, spread over
//! as many live zones as possible.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ConfigError;
use crate::metadata::{PlacementPath, TableId};

/// Default replication factor
pub const DEFAULT_REPLICATION_FACTOR: u32 = 3;

/// Placement block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementBlock {
    /// Path prefix the block matches
    pub path: PlacementPath,
    /// Minimum replica count inside the block
    pub min_replicas: u32,
}

impl PlacementBlock {
    pub fn new(path: PlacementPath, min_replicas: u32) -> Self {
        Self { path, min_replicas }
    }

    pub fn matches(&self, placement: &PlacementPath) -> bool {
        self.path.contains(placement)
    }
}

/// Placement policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementPolicy {
    /// Replication factor
    pub replication_factor: u32,
    /// Placement blocks (empty means "anywhere")
    #[serde(default)]
    pub blocks: Vec<PlacementBlock>,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            blocks: Vec::new(),
        }
    }
}

impl PlacementPolicy {
    /// Create a validated policy
    pub fn new(replication_factor: u32, blocks: Vec<PlacementBlock>) -> Result<Self, ConfigError> {
        let policy = Self {
            replication_factor,
            blocks,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// "Anywhere" policy with the given replication factor
    pub fn anywhere(replication_factor: u32) -> Result<Self, ConfigError> {
        Self::new(replication_factor, Vec::new())
    }

    /// Parse a block spec such as `c.r.z0,c.r.z1,c.r.z2` or `c.r.z0:2,c.r.z1`
    ///
    /// Blocks with an explicit `:n` suffix get exactly `n` replicas; the rest
    /// of the replication factor is spread evenly over blocks without one,
    /// earlier blocks taking the remainder. An empty spec yields the
    /// "anywhere" policy.
    pub fn parse(spec: &str, replication_factor: u32) -> Result<Self, ConfigError> {
        if replication_factor == 0 {
            return Err(ConfigError::ZeroReplicationFactor);
        }
        let spec = spec.trim();
        if spec.is_empty() {
            return Self::anywhere(replication_factor);
        }

        let mut parsed: Vec<(PlacementPath, Option<u32>)> = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            let (path, count) = match part.split_once(':') {
                Some((path, count)) => {
                    let count = count.trim().parse::<u32>().map_err(|e| {
                        ConfigError::InvalidBlockSpec {
                            spec: spec.to_string(),
                            reason: format!("bad replica count in '{}': {}", part, e),
                        }
                    })?;
                    (path, Some(count))
                }
                None => (part, None),
            };
            let path: PlacementPath = path.parse()?;
            parsed.push((path, count));
        }

        let fixed: u32 = parsed.iter().filter_map(|(_, count)| *count).sum();
        let flexible = parsed.iter().filter(|(_, count)| count.is_none()).count() as u32;
        if fixed > replication_factor {
            return Err(ConfigError::BlockSumMismatch {
                total: fixed,
                replication_factor,
            });
        }

        let remaining = replication_factor - fixed;
        let (share, mut extra) = if flexible > 0 {
            (remaining / flexible, remaining % flexible)
        } else {
            (0, 0)
        };

        let blocks = parsed
            .into_iter()
            .map(|(path, count)| {
                let min_replicas = count.unwrap_or_else(|| {
                    if extra > 0 {
                        extra -= 1;
                        share + 1
                    } else {
                        share
                    }
                });
                PlacementBlock::new(path, min_replicas)
            })
            .collect();

        Self::new(replication_factor, blocks)
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replication_factor == 0 {
            return Err(ConfigError::ZeroReplicationFactor);
        }
        if self.blocks.is_empty() {
            return Ok(());
        }

        for block in &self.blocks {
            if block.min_replicas == 0 {
                return Err(ConfigError::EmptyBlock(block.path.to_string()));
            }
        }

        for (i, a) in self.blocks.iter().enumerate() {
            for b in &self.blocks[i + 1..] {
                if a.path.overlaps(&b.path) {
                    return Err(ConfigError::OverlappingBlocks(
                        a.path.to_string(),
                        b.path.to_string(),
                    ));
                }
            }
        }

        let total: u32 = self.blocks.iter().map(|b| b.min_replicas).sum();
        if total != self.replication_factor {
            return Err(ConfigError::BlockSumMismatch {
                total,
                replication_factor: self.replication_factor,
            });
        }
        Ok(())
    }

    /// Whether this is the "anywhere" policy
    pub fn is_anywhere(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks the evaluator works with
    ///
    /// The "anywhere" policy is a single root block holding every replica.
    pub fn effective_blocks(&self) -> Vec<PlacementBlock> {
        if self.blocks.is_empty() {
            vec![PlacementBlock::new(PlacementPath::root(), self.replication_factor)]
        } else {
            self.blocks.clone()
        }
    }

    /// Index (into `effective_blocks`) of the block matching a placement
    pub fn block_index(&self, placement: &PlacementPath) -> Option<usize> {
        if self.blocks.is_empty() {
            return Some(0);
        }
        self.blocks.iter().position(|b| b.matches(placement))
    }
}

/// Parse and validate a preferred zone list
pub fn parse_preferred_zones<S: AsRef<str>>(zones: &[S]) -> Result<Vec<PlacementPath>, ConfigError> {
    let mut seen = BTreeSet::new();
    let mut parsed = Vec::with_capacity(zones.len());
    for zone in zones {
        let path: PlacementPath = zone.as_ref().parse()?;
        if !seen.insert(path.clone()) {
            return Err(ConfigError::DuplicateZone(path.to_string()));
        }
        parsed.push(path);
    }
    Ok(parsed)
}

/// Policy as reported by the cluster for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePolicy {
    /// Placement constraints (cluster-wide or a per-table override)
    pub placement: PlacementPolicy,
    /// Cluster preferred leader zones, in priority order
    #[serde(default)]
    pub preferred_zones: Vec<PlacementPath>,
    /// Whether this table's leaders follow the preferred zones
    #[serde(default = "default_true")]
    pub leader_affinity: bool,
    /// System table
    #[serde(default)]
    pub system: bool,
}

fn default_true() -> bool {
    true
}

/// Policy resolved once per tick, immutable while planning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub table: TableId,
    pub placement: PlacementPolicy,
    pub blocks: Vec<PlacementBlock>,
    /// Preferred zones this table's leaders must honor (empty when opted out)
    pub preferred_zones: Vec<PlacementPath>,
    pub system: bool,
}

impl ResolvedPolicy {
    pub fn resolve(table: TableId, policy: TablePolicy) -> Self {
        let blocks = policy.placement.effective_blocks();
        let preferred_zones = if policy.leader_affinity {
            policy.preferred_zones
        } else {
            Vec::new()
        };
        Self {
            table,
            placement: policy.placement,
            blocks,
            preferred_zones,
            system: policy.system,
        }
    }

    pub fn replication_factor(&self) -> u32 {
        self.placement.replication_factor
    }

    pub fn has_preferred_zones(&self) -> bool {
        !self.preferred_zones.is_empty()
    }

    /// Whether a placement lies inside one of the preferred zones
    pub fn is_preferred(&self, placement: &PlacementPath) -> bool {
        self.preferred_zones.iter().any(|zone| zone.contains(placement))
    }

    /// Index of the block holding a placement
    pub fn block_index(&self, placement: &PlacementPath) -> Option<usize> {
        self.placement.block_index(placement)
    }
}

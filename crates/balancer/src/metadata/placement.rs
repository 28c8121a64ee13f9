//! Hierarchical placement paths (cloud.region.zone)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Placement path
///
/// An ordered tuple of location labels, e.g. `["aws", "us-east-1", "us-east-1a"]`,
/// written as `aws.us-east-1.us-east-1a`. The empty path is the root and
/// matches every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlacementPath(Vec<String>);

impl PlacementPath {
    /// Root path (matches everything)
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from labels
    pub fn new<I, S>(labels: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        for label in &labels {
            validate_label(&labels.join("."), label)?;
        }
        Ok(Self(labels))
    }

    /// Location labels, outermost first
    pub fn labels(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Whether `self` is a prefix of (or equal to) `other`
    pub fn contains(&self, other: &PlacementPath) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }

    /// Whether either path contains the other
    pub fn overlaps(&self, other: &PlacementPath) -> bool {
        self.contains(other) || other.contains(self)
    }
}

fn validate_label(path: &str, label: &str) -> Result<(), ConfigError> {
    if label.is_empty() {
        return Err(ConfigError::InvalidPath {
            path: path.to_string(),
            reason: "empty label".to_string(),
        });
    }
    if label.chars().any(|c| c.is_whitespace() || c == '.' || c == ',' || c == ':') {
        return Err(ConfigError::InvalidPath {
            path: path.to_string(),
            reason: format!("label '{}' contains a reserved character", label),
        });
    }
    Ok(())
}

impl FromStr for PlacementPath {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidPath {
                path: s.to_string(),
                reason: "empty path".to_string(),
            });
        }
        let labels: Vec<&str> = s.split('.').collect();
        for label in &labels {
            validate_label(s, label)?;
        }
        Ok(Self(labels.into_iter().map(str::to_string).collect()))
    }
}

impl TryFrom<String> for PlacementPath {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() || value == "*" {
            return Ok(Self::root());
        }
        value.parse()
    }
}

impl From<PlacementPath> for String {
    fn from(path: PlacementPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for PlacementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "*");
        }
        write!(f, "{}", self.0.join("."))
    }
}

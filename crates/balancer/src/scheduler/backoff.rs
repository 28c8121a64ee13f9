//! Per-tablet failure backoff
//!
//! Every failed action pushes its tablet's next attempt out by
//! `base * 2^(failures - 1)`, capped at `max`. After `stuck_threshold`
//! consecutive failures the tablet is suspended for `stuck_cooldown` and
//! reported as stuck; once the cooldown ends it starts over from zero.
//! Failures are consecutive only while they keep coming: a tablet left
//! alone for `max` past its retry time starts over as well.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::metadata::TabletId;

#[derive(Debug, Clone)]
struct BackoffEntry {
    failures: u32,
    retry_at: Instant,
    stuck_since: Option<DateTime<Utc>>,
    last_error: String,
}

/// Stuck-move diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckMove {
    pub tablet: TabletId,
    pub failures: u32,
    pub last_error: String,
    pub stuck_since: DateTime<Utc>,
    /// Remaining suspension
    pub retry_in_ms: u64,
}

/// Backoff tracker
#[derive(Debug)]
pub struct BackoffTracker {
    base: Duration,
    max: Duration,
    stuck_threshold: u32,
    stuck_cooldown: Duration,
    entries: BTreeMap<TabletId, BackoffEntry>,
}

impl BackoffTracker {
    pub fn new(base: Duration, max: Duration, stuck_threshold: u32, stuck_cooldown: Duration) -> Self {
        Self {
            base,
            max,
            stuck_threshold: stuck_threshold.max(1),
            stuck_cooldown,
            entries: BTreeMap::new(),
        }
    }

    /// Delay after the `failures`-th consecutive failure
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Record a failure, returns how long the tablet is held back
    pub fn record_failure(&mut self, tablet: &TabletId, error: impl Into<String>, now: Instant) -> Duration {
        let failures = self.entries.get(tablet).map(|e| e.failures).unwrap_or(0) + 1;
        let error = error.into();

        let (delay, stuck_since) = if failures >= self.stuck_threshold {
            warn!(
                "Tablet {} is stuck after {} failed actions, suspending for {:?}: {}",
                tablet, failures, self.stuck_cooldown, error
            );
            (self.stuck_cooldown, Some(Utc::now()))
        } else {
            (self.delay_for(failures), None)
        };

        self.entries.insert(
            tablet.clone(),
            BackoffEntry {
                failures,
                retry_at: now + delay,
                stuck_since,
                last_error: error,
            },
        );
        delay
    }

    /// Forget a tablet after a success
    pub fn record_success(&mut self, tablet: &TabletId) {
        self.entries.remove(tablet);
    }

    pub fn failures(&self, tablet: &TabletId) -> u32 {
        self.entries.get(tablet).map(|e| e.failures).unwrap_or(0)
    }

    /// Tablets that must not be touched at `now`
    ///
    /// Stuck tablets whose cooldown ended, and tablets quiet for `max` since
    /// their retry time, are released with a clean slate.
    pub fn blocked(&mut self, now: Instant) -> BTreeSet<TabletId> {
        let max = self.max;
        self.entries.retain(|_, e| match e.stuck_since {
            Some(_) => e.retry_at > now,
            None => now < e.retry_at + max,
        });
        self.entries
            .iter()
            .filter(|(_, e)| e.retry_at > now)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop entries of tablets that no longer exist
    pub fn retain_tablets(&mut self, present: impl Fn(&TabletId) -> bool) {
        self.entries.retain(|tablet, _| present(tablet));
    }

    /// Currently suspended stuck tablets
    pub fn stuck_moves(&self, now: Instant) -> Vec<StuckMove> {
        self.entries
            .iter()
            .filter_map(|(tablet, e)| {
                let stuck_since = e.stuck_since?;
                if e.retry_at <= now {
                    return None;
                }
                Some(StuckMove {
                    tablet: tablet.clone(),
                    failures: e.failures,
                    last_error: e.last_error.clone(),
                    stuck_since,
                    retry_in_ms: e.retry_at.saturating_duration_since(now).as_millis() as u64,
                })
            })
            .collect()
    }
}

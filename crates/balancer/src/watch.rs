//! Topology change notification
//!
//! Topology and policy mutations bump a version; the run loop watches the
//! version it last saw and wakes up as soon as it moves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

/// Topology watch manager
#[derive(Clone, Default)]
pub struct TopologyWatcher {
    /// Watches per version (version -> Notify), shared by all waiters of that version
    watches: Arc<RwLock<HashMap<u64, Arc<Notify>>>>,
    version: Arc<AtomicU64>,
}

impl TopologyWatcher {
    /// Create a new watch manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Register a watch, woken once the version moves past `current_version`
    ///
    /// Callers must re-check [`version`](Self::version) after enabling the
    /// returned `Notify`: a bump that raced the registration is not replayed.
    pub async fn watch(&self, current_version: u64) -> Arc<Notify> {
        let mut watches = self.watches.write().await;
        let notify = watches
            .entry(current_version)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        debug!("Registered watch for topology version {}", current_version);
        notify
    }

    /// Advance the version and wake watchers of older versions
    pub async fn bump(&self) -> u64 {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.notify_version(version).await;
        version
    }

    async fn notify_version(&self, version: u64) {
        let mut watches = self.watches.write().await;
        let stale: Vec<u64> = watches.keys().filter(|&v| *v < version).copied().collect();
        for v in stale {
            if let Some(notify) = watches.remove(&v) {
                debug!("Notifying watches for version {} (current: {})", v, version);
                notify.notify_waiters();
            }
        }
    }
}

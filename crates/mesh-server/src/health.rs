//! Readiness tracking and cache health snapshots.
//!
//! [`Readiness`] flips to ready once warm-up has completed and back to not
//! ready when shutdown starts. Callers can poll it or wait on it.
//!
//! # Example
//!
//! ```rust
//! use mesh_server::health::Readiness;
//!
//! let readiness = Readiness::new();
//! assert!(!readiness.is_ready());
//! readiness.set_ready();
//! assert!(readiness.is_ready());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mesh_cache::CacheManager;
use mesh_core::{CacheKind, Timestamp};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

/// Shared readiness flag.
#[derive(Debug, Clone)]
pub struct Readiness {
    inner: Arc<ReadinessInner>,
}

#[derive(Debug)]
struct ReadinessInner {
    ready: AtomicBool,
    tx: watch::Sender<bool>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    /// Create a tracker that starts not ready.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ReadinessInner {
                ready: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Mark ready.
    pub fn set_ready(&self) {
        self.set(true);
    }

    /// Mark not ready.
    pub fn set_not_ready(&self) {
        self.set(false);
    }

    fn set(&self, ready: bool) {
        if self.inner.ready.swap(ready, Ordering::SeqCst) != ready {
            info!(ready, "readiness changed");
        }
        self.inner.tx.send_replace(ready);
    }

    /// Whether the control plane is ready to serve.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Subscribe to readiness changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Wait until ready.
    pub async fn wait_ready(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// Point-in-time view of one cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHealth {
    /// Cache kind.
    pub kind: CacheKind,
    /// Whether its refresh task runs.
    pub enabled: bool,
    /// Entities held.
    pub entities: usize,
    /// Current watermark in Unix milliseconds.
    pub watermark: i64,
    /// Whether no load has succeeded yet.
    pub first_load_pending: bool,
    /// Completed update cycles.
    pub updates: u64,
    /// Failed update cycles.
    pub failures: u64,
    /// Drift resets triggered by the row-count probe.
    pub drift_resets: u64,
}

/// Health of the whole control plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Readiness at the time of the snapshot.
    pub ready: bool,
    /// Notifications waiting for the consumer.
    pub queue_depth: usize,
    /// Service ids waiting for their record.
    pub pending_services: usize,
    /// One entry per registered cache, in dependency order.
    pub caches: Vec<CacheHealth>,
}

impl HealthReport {
    /// Snapshot `manager`.
    pub fn collect(manager: &CacheManager, readiness: &Readiness) -> Self {
        let caches = manager
            .kinds()
            .into_iter()
            .filter_map(|kind| manager.get(kind))
            .map(|cache| {
                let base = cache.base();
                let stats = base.stats();
                CacheHealth {
                    kind: cache.kind(),
                    enabled: manager.config().is_enabled(cache.kind()),
                    entities: cache.len(),
                    watermark: base.last_fetch_time().as_millis(),
                    first_load_pending: base.is_first_load(),
                    updates: stats.updates(),
                    failures: stats.failures(),
                    drift_resets: stats.drift_resets(),
                }
            })
            .collect();
        Self {
            ready: readiness.is_ready(),
            queue_depth: manager.queue().depth(),
            pending_services: manager.service().pending_count(),
            caches,
        }
    }

    /// The entry for `kind`.
    pub fn cache(&self, kind: CacheKind) -> Option<&CacheHealth> {
        self.caches.iter().find(|c| c.kind == kind)
    }

    /// Oldest watermark among enabled caches.
    pub fn oldest_watermark(&self) -> Option<Timestamp> {
        self.caches
            .iter()
            .filter(|c| c.enabled)
            .map(|c| Timestamp::from_millis(c.watermark))
            .min()
    }
}

//! Metrics for the cache engine.
//!
//! This module reports through the `metrics` facade; the process installs
//! whichever exporter it wants. Reported series:
//!
//! - Update cycle counters and latency histograms per cache
//! - Entity gauges per cache
//! - Drift-triggered reload counters
//! - Notification queue depth and overflow events
//! - Listener failures
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_cache::metrics::CacheMetrics;
//! use mesh_core::CacheKind;
//! use std::time::Duration;
//!
//! let metrics = CacheMetrics::new();
//! metrics.record_update(CacheKind::Instance, true, Duration::from_millis(3));
//! metrics.set_queue_depth(12);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::CacheKind;
use metrics::{counter, gauge, histogram};

/// Metrics handle shared by every cache and the notification queue.
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    inner: Arc<CacheMetricsInner>,
}

#[derive(Debug)]
struct CacheMetricsInner {
    /// Last reported queue depth.
    queue_depth: AtomicU64,
    /// Times a producer found the queue full.
    queue_full: AtomicU64,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheMetricsInner {
                queue_depth: AtomicU64::new(0),
                queue_full: AtomicU64::new(0),
            }),
        }
    }

    /// Record a finished update cycle.
    pub fn record_update(&self, kind: CacheKind, success: bool, elapsed: Duration) {
        let result = if success { "ok" } else { "error" };
        counter!("mesh_cache_updates_total", "cache" => kind.as_str(), "result" => result)
            .increment(1);
        histogram!("mesh_cache_update_duration_ms", "cache" => kind.as_str())
            .record(elapsed.as_secs_f64() * 1000.0);
    }

    /// Record a caller that joined an in-flight update.
    pub fn record_deduplicated(&self, kind: CacheKind) {
        counter!("mesh_cache_deduplicated_total", "cache" => kind.as_str()).increment(1);
    }

    /// Report the number of entities held by a cache.
    pub fn set_entities(&self, kind: CacheKind, count: usize) {
        gauge!("mesh_cache_entities", "cache" => kind.as_str()).set(count as f64);
    }

    /// Record a drift-triggered reload.
    pub fn record_drift(&self, kind: CacheKind) {
        counter!("mesh_cache_drift_total", "cache" => kind.as_str()).increment(1);
    }

    /// Report the current notification queue depth.
    pub fn set_queue_depth(&self, depth: usize) {
        self.inner.queue_depth.store(depth as u64, Ordering::Relaxed);
        gauge!("mesh_notify_queue_depth").set(depth as f64);
    }

    /// Record a producer that found the queue full.
    pub fn record_queue_full(&self) {
        self.inner.queue_full.fetch_add(1, Ordering::Relaxed);
        counter!("mesh_notify_queue_full_total").increment(1);
    }

    /// Report the number of unresolved service ids.
    pub fn set_pending(&self, pending: usize) {
        gauge!("mesh_service_pending").set(pending as f64);
    }

    /// Record failed listener callbacks.
    pub fn record_listener_errors(&self, kind: CacheKind, count: u64) {
        counter!("mesh_listener_errors_total", "cache" => kind.as_str()).increment(count);
    }

    /// Last reported queue depth.
    pub fn queue_depth(&self) -> u64 {
        self.inner.queue_depth.load(Ordering::Relaxed)
    }

    /// Total queue-full events.
    pub fn queue_full_events(&self) -> u64 {
        self.inner.queue_full.load(Ordering::Relaxed)
    }
}

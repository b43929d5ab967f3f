//! Per-cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for one cache's refresh cycles and merges.
///
/// All counters are atomic and can be safely accessed from multiple threads.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of update cycles that ran a store query.
    updates: AtomicU64,
    /// Number of delta queries issued to the store.
    store_queries: AtomicU64,
    /// Number of callers that joined an in-flight update.
    deduplicated: AtomicU64,
    /// Number of failed update cycles.
    failures: AtomicU64,
    /// Number of drift-triggered watermark resets.
    drift_resets: AtomicU64,
    /// Entities created in the index.
    created: AtomicU64,
    /// Entities updated in the index.
    updated: AtomicU64,
    /// Entities removed from the index.
    deleted: AtomicU64,
    /// Malformed entities skipped during merge.
    skipped: AtomicU64,
    /// Listener callbacks that failed.
    listener_errors: AtomicU64,
}

impl CacheStats {
    /// Create new cache statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update cycle.
    #[inline]
    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delta query.
    #[inline]
    pub fn record_store_query(&self) {
        self.store_queries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a caller that joined an in-flight update.
    #[inline]
    pub fn record_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed update cycle.
    #[inline]
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a drift reset.
    #[inline]
    pub fn record_drift(&self) {
        self.drift_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record merge results.
    #[inline]
    pub fn record_merge(&self, created: u64, updated: u64, deleted: u64, skipped: u64) {
        self.created.fetch_add(created, Ordering::Relaxed);
        self.updated.fetch_add(updated, Ordering::Relaxed);
        self.deleted.fetch_add(deleted, Ordering::Relaxed);
        self.skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    /// Record failed listener callbacks.
    #[inline]
    pub fn record_listener_errors(&self, count: u64) {
        self.listener_errors.fetch_add(count, Ordering::Relaxed);
    }

    /// Get total update cycles.
    #[inline]
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Get total delta queries.
    #[inline]
    pub fn store_queries(&self) -> u64 {
        self.store_queries.load(Ordering::Relaxed)
    }

    /// Get total deduplicated callers.
    #[inline]
    pub fn deduplicated(&self) -> u64 {
        self.deduplicated.load(Ordering::Relaxed)
    }

    /// Get total failed cycles.
    #[inline]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get total drift resets.
    #[inline]
    pub fn drift_resets(&self) -> u64 {
        self.drift_resets.load(Ordering::Relaxed)
    }

    /// Get total created entities.
    #[inline]
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Get total updated entities.
    #[inline]
    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::Relaxed)
    }

    /// Get total deleted entities.
    #[inline]
    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Get total skipped entities.
    #[inline]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Get total listener errors.
    #[inline]
    pub fn listener_errors(&self) -> u64 {
        self.listener_errors.load(Ordering::Relaxed)
    }

    /// Fraction of update cycles that failed (0.0 to 1.0).
    pub fn failure_rate(&self) -> f64 {
        let updates = self.updates() as f64;
        if updates == 0.0 {
            0.0
        } else {
            self.failures() as f64 / updates
        }
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.updates.store(0, Ordering::Relaxed);
        self.store_queries.store(0, Ordering::Relaxed);
        self.deduplicated.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.drift_resets.store(0, Ordering::Relaxed);
        self.created.store(0, Ordering::Relaxed);
        self.updated.store(0, Ordering::Relaxed);
        self.deleted.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.listener_errors.store(0, Ordering::Relaxed);
    }
}

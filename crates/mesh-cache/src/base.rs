//! The refresh skeleton shared by every cache.
//!
//! [`BaseCache`] owns the state that makes incremental fetching safe:
//!
//! - the watermark (`last_fetch_time`), advanced only to modify times seen
//!   in a delta, never to wall-clock time
//! - the rollback window subtracted from the watermark, so rows committed
//!   late with an older modify time are still picked up
//! - the first-load flag, cleared after the first successful fetch
//! - the self-heal probe, which compares authoritative row counts with the
//!   in-memory count and schedules a full reload on mismatch
//! - update deduplication through [`SingleFlight`]
//!
//! Concrete caches implement [`DeltaSync`] (query + merge) and hand
//! themselves to [`BaseCache::update_with`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mesh_core::{CacheKind, MeshError, MeshResult, Timestamp};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::metrics::CacheMetrics;
use crate::singleflight::{Flight, SingleFlight};
use crate::stats::CacheStats;

/// Parameters of one delta query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// Floor for the store's modify-time filter.
    pub since: Timestamp,
    /// First fetch of this cache's lifetime.
    pub first_load: bool,
    /// Fetch scheduled by the self-heal probe. The concrete cache removes
    /// every entry the store did not return.
    pub full_reload: bool,
}

/// What a concrete cache reports back after merging a delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Rows returned by the store.
    pub rows: usize,
    /// Largest modify time among the returned rows.
    pub max_modify_time: Option<Timestamp>,
    /// Entities added to the index.
    pub created: u64,
    /// Entities replaced in the index.
    pub updated: u64,
    /// Entities removed from the index.
    pub deleted: u64,
    /// Malformed rows skipped.
    pub skipped: u64,
}

impl DeltaOutcome {
    /// Track a row's modify time.
    pub fn observe(&mut self, modify_time: Timestamp) {
        self.rows += 1;
        self.max_modify_time = Some(match self.max_modify_time {
            Some(current) => current.max(modify_time),
            None => modify_time,
        });
    }

    /// Whether the merge changed the index.
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

/// Result of one [`BaseCache::update_with`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Cache that ran the cycle.
    pub kind: CacheKind,
    /// Floor used for the query.
    pub since: Timestamp,
    /// Rows returned by the store.
    pub rows: usize,
    /// Entities added.
    pub created: u64,
    /// Entities replaced.
    pub updated: u64,
    /// Entities removed.
    pub deleted: u64,
    /// Malformed rows skipped.
    pub skipped: u64,
    /// Watermark after the cycle.
    pub watermark: Timestamp,
    /// The cycle was the cache's first load.
    pub first_load: bool,
    /// The cycle was a drift-triggered full reload.
    pub full_reload: bool,
    /// The row-count probe found a mismatch; the next cycle reloads fully.
    pub drift_detected: bool,
    /// The caller joined another caller's cycle.
    pub deduplicated: bool,
}

/// Query-and-merge half of a cache, driven by [`BaseCache`].
#[async_trait]
pub trait DeltaSync: Send + Sync {
    /// Query the store for `request` and merge the rows into the indices.
    async fn fetch_and_merge(&self, request: FetchRequest) -> MeshResult<DeltaOutcome>;

    /// `(store rows, cached rows)` for the self-heal probe, or `None` when
    /// the cache cannot compare counts.
    async fn row_counts(&self) -> MeshResult<Option<(u64, u64)>>;

    /// The store's clock, for the clock-skew diagnostic.
    async fn store_clock(&self) -> MeshResult<Option<Timestamp>> {
        Ok(None)
    }
}

/// A cache the [`CacheManager`](crate::CacheManager) can schedule.
#[async_trait]
pub trait ResourceCache: Send + Sync + fmt::Debug {
    /// Kind this cache is registered under.
    fn kind(&self) -> CacheKind;

    /// Run one refresh cycle.
    async fn update(&self) -> MeshResult<UpdateOutcome>;

    /// Drop every cached entry and restart from a first load.
    fn clear(&self);

    /// Number of cached entities.
    fn len(&self) -> usize;

    /// Whether the cache holds no entity.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The shared refresh state.
    fn base(&self) -> &BaseCache;
}

/// Watermark, first-load, self-heal, and dedup state of one cache.
#[derive(Debug)]
pub struct BaseCache {
    kind: CacheKind,
    rollback_window: Duration,
    self_heal_interval: Duration,
    last_fetch_time: AtomicI64,
    first_load: AtomicBool,
    full_reload: AtomicBool,
    /// `None` means the probe is due on the next cycle.
    last_heal_check: Mutex<Option<Instant>>,
    flight: SingleFlight<UpdateOutcome>,
    stats: CacheStats,
    metrics: CacheMetrics,
}

impl BaseCache {
    /// Create the refresh state for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Configuration`] if the rollback window or the
    /// self-heal interval is zero.
    pub fn new(kind: CacheKind, config: &CacheConfig, metrics: CacheMetrics) -> MeshResult<Self> {
        if config.rollback_window.is_zero() {
            return Err(MeshError::Configuration(format!(
                "{kind}: rollback_window must be positive"
            )));
        }
        if config.self_heal_interval.is_zero() {
            return Err(MeshError::Configuration(format!(
                "{kind}: self_heal_interval must be positive"
            )));
        }
        Ok(Self {
            kind,
            rollback_window: config.rollback_window,
            self_heal_interval: config.self_heal_interval,
            last_fetch_time: AtomicI64::new(0),
            first_load: AtomicBool::new(true),
            full_reload: AtomicBool::new(false),
            last_heal_check: Mutex::new(Some(Instant::now())),
            flight: SingleFlight::new(),
            stats: CacheStats::new(),
            metrics,
        })
    }

    /// Kind of the owning cache.
    #[inline]
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    /// Current watermark.
    #[inline]
    pub fn last_fetch_time(&self) -> Timestamp {
        Timestamp::from_millis(self.last_fetch_time.load(Ordering::SeqCst))
    }

    /// Whether the next cycle is the first load.
    #[inline]
    pub fn is_first_load(&self) -> bool {
        self.first_load.load(Ordering::SeqCst)
    }

    /// Whether the next cycle is a drift-triggered full reload.
    #[inline]
    pub fn is_full_reload_pending(&self) -> bool {
        self.full_reload.load(Ordering::SeqCst)
    }

    /// Floor the next incremental query will use.
    pub fn query_floor(&self) -> Timestamp {
        self.last_fetch_time().saturating_sub(self.rollback_window)
    }

    /// Reset the watermark to zero.
    pub fn reset_last_fetch_time(&self) {
        self.last_fetch_time.store(0, Ordering::SeqCst);
    }

    /// Restart from a first load, as after [`ResourceCache::clear`].
    pub fn reset(&self) {
        self.reset_last_fetch_time();
        self.first_load.store(true, Ordering::SeqCst);
        self.full_reload.store(false, Ordering::SeqCst);
    }

    /// Run the self-heal probe on the next cycle regardless of the interval.
    pub fn force_heal_check(&self) {
        *self
            .last_heal_check
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Refresh statistics.
    #[inline]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Metrics handle.
    #[inline]
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Whether a cycle is running right now.
    pub fn is_updating(&self) -> bool {
        self.flight.is_in_flight(self.kind.as_str())
    }

    /// Run one refresh cycle against `sync`.
    ///
    /// Concurrent callers share a single cycle; joined callers get a copy of
    /// the leader's outcome with `deduplicated` set.
    ///
    /// # Errors
    ///
    /// Returns the store error of a failed query. The watermark is left
    /// untouched so the next cycle retries from the same floor.
    pub async fn update_with<S>(&self, sync: &S) -> MeshResult<UpdateOutcome>
    where
        S: DeltaSync + ?Sized,
    {
        let flight = self
            .flight
            .run(self.kind.as_str(), || self.run_cycle(sync))
            .await?;
        match flight {
            Flight::Led(outcome) => Ok(outcome),
            Flight::Joined(mut outcome) => {
                self.stats.record_deduplicated();
                self.metrics.record_deduplicated(self.kind);
                outcome.deduplicated = true;
                Ok(outcome)
            }
        }
    }

    async fn run_cycle<S>(&self, sync: &S) -> MeshResult<UpdateOutcome>
    where
        S: DeltaSync + ?Sized,
    {
        let started = Instant::now();
        let first_load = self.is_first_load();
        let full_reload = self.is_full_reload_pending();
        let since = if first_load || full_reload {
            Timestamp::ZERO
        } else {
            self.query_floor()
        };

        self.stats.record_update();
        self.stats.record_store_query();

        let request = FetchRequest {
            since,
            first_load,
            full_reload,
        };
        let delta = match sync.fetch_and_merge(request).await {
            Ok(delta) => delta,
            Err(error) => {
                self.stats.record_failure();
                self.metrics
                    .record_update(self.kind, false, started.elapsed());
                warn!(cache = %self.kind, since = %since, %error, "cache update failed");
                return Err(error);
            }
        };

        self.first_load.store(false, Ordering::SeqCst);
        self.full_reload.store(false, Ordering::SeqCst);
        if let Some(max) = delta.max_modify_time {
            self.last_fetch_time
                .fetch_max(max.as_millis(), Ordering::SeqCst);
        }
        let watermark = self.last_fetch_time();
        self.stats
            .record_merge(delta.created, delta.updated, delta.deleted, delta.skipped);

        if first_load || full_reload {
            info!(
                cache = %self.kind,
                rows = delta.rows,
                watermark = %watermark,
                full_reload,
                "cache loaded"
            );
        } else if delta.rows > 0 {
            debug!(
                cache = %self.kind,
                since = %since,
                rows = delta.rows,
                created = delta.created,
                updated = delta.updated,
                deleted = delta.deleted,
                watermark = %watermark,
                "merged delta"
            );
        }

        self.check_clock_skew(sync, watermark).await;
        let drift_detected = self.probe_drift(sync).await;
        self.metrics
            .record_update(self.kind, true, started.elapsed());

        Ok(UpdateOutcome {
            kind: self.kind,
            since,
            rows: delta.rows,
            created: delta.created,
            updated: delta.updated,
            deleted: delta.deleted,
            skipped: delta.skipped,
            watermark: self.last_fetch_time(),
            first_load,
            full_reload,
            drift_detected,
            deduplicated: false,
        })
    }

    async fn check_clock_skew<S>(&self, sync: &S, watermark: Timestamp)
    where
        S: DeltaSync + ?Sized,
    {
        match sync.store_clock().await {
            Ok(Some(clock)) => {
                let ahead = watermark.millis_since(clock);
                if ahead > self.rollback_window.as_millis() as i64 {
                    warn!(
                        cache = %self.kind,
                        watermark = %watermark,
                        store_clock = %clock,
                        ahead_ms = ahead,
                        "watermark is ahead of the store clock"
                    );
                }
            }
            Ok(None) => {}
            Err(error) => debug!(cache = %self.kind, %error, "store clock probe failed"),
        }
    }

    fn heal_due(&self) -> bool {
        let mut last = self
            .last_heal_check
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let due = match *last {
            None => true,
            Some(at) => now.duration_since(at) >= self.self_heal_interval,
        };
        if due {
            *last = Some(now);
        }
        due
    }

    async fn probe_drift<S>(&self, sync: &S) -> bool
    where
        S: DeltaSync + ?Sized,
    {
        if !self.heal_due() {
            return false;
        }
        match sync.row_counts().await {
            Ok(Some((store_rows, cached_rows))) if store_rows != cached_rows => {
                info!(
                    cache = %self.kind,
                    store_rows,
                    cached_rows,
                    "drift detected, scheduling full reload"
                );
                self.reset_last_fetch_time();
                self.full_reload.store(true, Ordering::SeqCst);
                self.stats.record_drift();
                self.metrics.record_drift(self.kind);
                true
            }
            Ok(_) => false,
            Err(error) => {
                warn!(cache = %self.kind, %error, "row count probe failed");
                false
            }
        }
    }
}

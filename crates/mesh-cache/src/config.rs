//! Cache engine configuration.

use std::time::Duration;

use mesh_core::{CacheKind, MeshError, MeshResult};
use serde::{Deserialize, Serialize};

/// Shortest self-heal interval accepted outside of tests.
const MIN_SELF_HEAL_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration shared by every cache.
///
/// Durations are (de)serialized as integer milliseconds.
///
/// # Example
///
/// ```rust
/// use mesh_cache::CacheConfig;
/// use std::time::Duration;
///
/// let config = CacheConfig {
///     rollback_window: Duration::from_millis(500),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Subtracted from the watermark before each delta query.
    #[serde(with = "duration_ms")]
    pub rollback_window: Duration,
    /// How often the row-count drift probe runs.
    #[serde(with = "duration_ms")]
    pub self_heal_interval: Duration,
    /// Tick interval of each cache's refresh task.
    #[serde(with = "duration_ms")]
    pub refresh_interval: Duration,
    /// Capacity of the instance-to-service notification queue.
    pub notify_queue_capacity: usize,
    /// How often unresolved service ids are retried without new traffic.
    #[serde(with = "duration_ms")]
    pub pending_retry_interval: Duration,
    /// Load entity metadata.
    pub need_meta: bool,
    /// Load only services of the system namespace.
    pub disable_business: bool,
    /// Restrict the instance cache to these service ids. Empty loads all.
    pub instance_scope: Vec<String>,
    /// Kinds that are built but never refreshed.
    pub disabled: Vec<CacheKind>,
    /// Accept self-heal intervals under one minute.
    pub allow_short_self_heal: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rollback_window: Duration::from_secs(1),
            self_heal_interval: MIN_SELF_HEAL_INTERVAL,
            refresh_interval: Duration::from_secs(1),
            notify_queue_capacity: 20_480,
            pending_retry_interval: Duration::from_secs(1),
            need_meta: true,
            disable_business: false,
            instance_scope: Vec::new(),
            disabled: Vec::new(),
            allow_short_self_heal: false,
        }
    }
}

impl CacheConfig {
    /// Check the configuration for values that would break the refresh cycle.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Configuration`] if:
    /// - the rollback window is zero
    /// - the refresh interval or pending retry interval is zero
    /// - the notification queue capacity is zero
    /// - the self-heal interval is under one minute without `allow_short_self_heal`
    pub fn validate(&self) -> MeshResult<()> {
        if self.rollback_window.is_zero() {
            return Err(MeshError::Configuration(
                "rollback_window must be positive".into(),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(MeshError::Configuration(
                "refresh_interval must be positive".into(),
            ));
        }
        if self.pending_retry_interval.is_zero() {
            return Err(MeshError::Configuration(
                "pending_retry_interval must be positive".into(),
            ));
        }
        if self.notify_queue_capacity == 0 {
            return Err(MeshError::Configuration(
                "notify_queue_capacity must be positive".into(),
            ));
        }
        if self.self_heal_interval.is_zero()
            || (!self.allow_short_self_heal && self.self_heal_interval < MIN_SELF_HEAL_INTERVAL)
        {
            return Err(MeshError::Configuration(format!(
                "self_heal_interval must be at least {}s, got {:?}",
                MIN_SELF_HEAL_INTERVAL.as_secs(),
                self.self_heal_interval
            )));
        }
        Ok(())
    }

    /// Whether the refresh task for `kind` should run.
    #[must_use]
    pub fn is_enabled(&self, kind: CacheKind) -> bool {
        !self.disabled.contains(&kind)
    }
}

/// Serde helper storing a [`Duration`] as integer milliseconds.
///
/// Use with `#[serde(with = "mesh_cache::duration_ms")]`.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Builder for configuring and creating the control plane.

use std::sync::Arc;
use std::time::Duration;

use mesh_cache::{CacheConfig, CacheContext, CacheManager, CacheMetrics, ResourceCache};
use mesh_core::{MeshError, MeshResult, Store};

use crate::config::ControlPlaneConfig;
use crate::health::Readiness;
use crate::shutdown::{ShutdownConfig, ShutdownController};
use crate::ControlPlane;

type CacheFactory =
    Box<dyn FnOnce(&CacheContext) -> MeshResult<Arc<dyn ResourceCache>> + Send + 'static>;

/// Builder for creating a [`ControlPlane`].
///
/// # Example
///
/// ```rust,ignore
/// use mesh_server::ControlPlaneBuilder;
/// use mesh_core::MemoryStore;
/// use std::sync::Arc;
///
/// let plane = ControlPlaneBuilder::new()
///     .store(Arc::new(MemoryStore::new()))
///     .refresh_interval(Duration::from_millis(500))
///     .grace_period(Duration::from_secs(10))
///     .build()?;
/// ```
#[derive(Default)]
pub struct ControlPlaneBuilder {
    store: Option<Arc<dyn Store>>,
    config: ControlPlaneConfig,
    metrics: Option<CacheMetrics>,
    extra_caches: Vec<CacheFactory>,
}

impl std::fmt::Debug for ControlPlaneBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneBuilder")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("extra_caches", &self.extra_caches.len())
            .finish()
    }
}

impl ControlPlaneBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store to synchronize from.
    ///
    /// This is required.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ControlPlaneConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the cache section of the configuration.
    pub fn cache_config(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    /// Replace the shutdown section of the configuration.
    pub fn shutdown_config(mut self, shutdown: ShutdownConfig) -> Self {
        self.config.shutdown = shutdown;
        self
    }

    /// Set the refresh tick of every cache.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.cache.refresh_interval = interval;
        self
    }

    /// Set the watermark rollback window.
    pub fn rollback_window(mut self, window: Duration) -> Self {
        self.config.cache.rollback_window = window;
        self
    }

    /// Set the shutdown grace period.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.shutdown.grace_period = grace;
        self
    }

    /// Share a metrics handle with other components.
    pub fn metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register an extra cache built from the manager's shared parts.
    pub fn register_cache<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&CacheContext) -> MeshResult<Arc<dyn ResourceCache>> + Send + 'static,
    {
        self.extra_caches.push(Box::new(factory));
        self
    }

    /// Build the control plane.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Configuration`] if no store was set or the
    /// configuration is invalid.
    pub fn build(self) -> MeshResult<ControlPlane> {
        let store = self
            .store
            .ok_or_else(|| MeshError::Configuration("store is required".into()))?;
        self.config.validate()?;

        let mut manager = CacheManager::builder()
            .store(store)
            .config(self.config.cache.clone());
        if let Some(metrics) = self.metrics {
            manager = manager.metrics(metrics);
        }
        for factory in self.extra_caches {
            manager = manager.register_with(factory);
        }

        Ok(ControlPlane {
            manager: Arc::new(manager.build()?),
            config: self.config,
            readiness: Readiness::new(),
            shutdown: ShutdownController::new(),
        })
    }
}

//! # mesh-server
//!
//! Process runtime for the nebucloud-mesh control plane.
//!
//! This crate wraps the cache engine with the pieces a long-running process
//! needs:
//!
//! - [`ControlPlane`] - Owns the [`CacheManager`] and drives its lifecycle
//! - [`ControlPlaneBuilder`] - Builder for configuring the control plane
//! - [`ControlPlaneConfig`] - JSON-loadable configuration
//! - [`Readiness`] - Flips to ready once warm-up has completed
//! - Graceful shutdown on SIGTERM/SIGINT bounded by a grace period
//!
//! ## Example
//!
//! ```rust,ignore
//! use mesh_server::ControlPlaneBuilder;
//! use mesh_core::MemoryStore;
//! use std::sync::Arc;
//!
//! mesh_server::telemetry::init_tracing("info");
//!
//! let plane = ControlPlaneBuilder::new()
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()?;
//!
//! plane.start().await?;
//! plane.run_until_signal().await?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod config;
pub mod health;
pub mod shutdown;
pub mod telemetry;

pub use builder::ControlPlaneBuilder;
pub use config::ControlPlaneConfig;
pub use health::{CacheHealth, HealthReport, Readiness};
pub use shutdown::{ShutdownConfig, ShutdownController, ShutdownSignal};

use std::sync::Arc;

use mesh_cache::CacheManager;
use mesh_core::{MeshError, MeshResult};
use tracing::{info, warn};

/// The control plane process.
///
/// Holds the cache manager, a readiness tracker and the shutdown
/// controller that stops the manager's background tasks.
#[derive(Debug)]
pub struct ControlPlane {
    manager: Arc<CacheManager>,
    config: ControlPlaneConfig,
    readiness: Readiness,
    shutdown: ShutdownController,
}

impl ControlPlane {
    /// Create a new builder for configuring the control plane.
    pub fn builder() -> ControlPlaneBuilder {
        ControlPlaneBuilder::new()
    }

    /// Get the cache manager.
    #[inline]
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Get the readiness tracker.
    #[inline]
    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Get the shutdown controller.
    #[inline]
    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    /// Snapshot the health of every cache.
    pub fn health(&self) -> HealthReport {
        HealthReport::collect(&self.manager, &self.readiness)
    }

    /// Warm every cache up, start the background tasks and mark ready.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Shutdown`] once shutdown has begun, or the
    /// first warm-up failure. A failed start leaves the plane not ready and
    /// can be retried.
    pub async fn start(&self) -> MeshResult<()> {
        if self.shutdown.is_shutdown() {
            return Err(MeshError::Shutdown);
        }
        self.manager.start().await?;

        // The manager's stop counts as an in-flight operation, so the grace
        // period bounds how long it may take.
        let guard = self.shutdown.register_operation();
        let signal = self.shutdown.shutdown_signal();
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            signal.wait().await;
            manager.stop().await;
            drop(guard);
        });

        self.readiness.set_ready();
        info!(caches = ?self.manager.kinds(), "control plane started");
        Ok(())
    }

    /// Block until SIGTERM or SIGINT, then shut down gracefully.
    ///
    /// Without signal handling configured this waits for a programmatic
    /// [`shutdown`](Self::shutdown) instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be installed.
    pub async fn run_until_signal(&self) -> MeshResult<bool> {
        if self.config.shutdown.listen_for_signals {
            tokio::select! {
                result = shutdown::wait_for_signal() => {
                    result.map_err(|e| MeshError::internal("installing signal handlers", e))?;
                }
                _ = self.shutdown.shutdown_signal().wait() => {}
            }
        } else {
            self.shutdown.shutdown_signal().wait().await;
        }
        Ok(self.shutdown().await)
    }

    /// Mark not ready and stop the cache manager within the grace period.
    ///
    /// Returns `false` if stopping took longer than the grace period.
    pub async fn shutdown(&self) -> bool {
        self.readiness.set_not_ready();
        let graceful = self
            .shutdown
            .shutdown(self.config.shutdown.grace_period)
            .await;
        if !graceful {
            warn!("cache manager did not stop within the grace period");
        }
        graceful
    }
}

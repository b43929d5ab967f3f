//! Graceful shutdown handling for the control plane.
//!
//! A [`ShutdownController`] broadcasts a single "stop" signal to every
//! subscriber and then waits, bounded by a grace period, for registered
//! operations to finish. The control plane registers the cache manager's
//! stop as one such operation, so the grace period bounds how long
//! in-flight refresh cycles may take to wind down.
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_server::shutdown::ShutdownController;
//! use std::time::Duration;
//!
//! let controller = ShutdownController::new();
//! let signal = controller.shutdown_signal();
//!
//! tokio::spawn(async move {
//!     signal.wait().await;
//!     // stop background work
//! });
//!
//! controller.shutdown(Duration::from_secs(30)).await;
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use mesh_cache::duration_ms;

/// Controller for coordinating graceful shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug)]
struct ShutdownInner {
    initiated: AtomicBool,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
    active_ops: AtomicUsize,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    /// Create a new shutdown controller.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner {
                initiated: AtomicBool::new(false),
                tx,
                rx,
                active_ops: AtomicUsize::new(0),
            }),
        }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.rx.clone()
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutdown(&self) -> bool {
        self.inner.initiated.load(Ordering::SeqCst)
    }

    /// Get a future that resolves when shutdown is initiated.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.inner.rx.clone(),
        }
    }

    /// Initiate graceful shutdown.
    ///
    /// Notifies every subscriber, then waits for registered operations.
    /// Returns `true` if they all completed within `grace_period`, `false`
    /// if it timed out. A second call returns `true` immediately.
    pub async fn shutdown(&self, grace_period: Duration) -> bool {
        if self
            .inner
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return true;
        }

        info!(grace_period_ms = grace_period.as_millis() as u64, "initiating graceful shutdown");
        self.inner.tx.send_replace(true);

        match timeout(grace_period, self.wait_for_completion()).await {
            Ok(()) => {
                info!("graceful shutdown completed");
                true
            }
            Err(_) => {
                warn!(
                    remaining_ops = self.active_operations(),
                    "graceful shutdown timed out, forcing shutdown"
                );
                false
            }
        }
    }

    async fn wait_for_completion(&self) {
        while self.active_operations() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Register an active operation.
    ///
    /// Returns a guard that decrements the counter when dropped.
    pub fn register_operation(&self) -> OperationGuard {
        self.inner.active_ops.fetch_add(1, Ordering::SeqCst);
        OperationGuard {
            controller: self.clone(),
        }
    }

    /// Get the number of active operations.
    pub fn active_operations(&self) -> usize {
        self.inner.active_ops.load(Ordering::SeqCst)
    }
}

/// Guard for tracking an active operation.
#[derive(Debug)]
pub struct OperationGuard {
    controller: ShutdownController,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.controller.inner.active_ops.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Future that resolves when shutdown is initiated.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for the shutdown signal. A dropped controller counts as one.
    pub async fn wait(mut self) {
        // `wait_for` returns immediately if the value is already `true`.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Wait for OS shutdown signals (SIGTERM, SIGINT).
///
/// # Errors
///
/// Returns an error if a signal handler cannot be installed.
pub async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C");
    }

    Ok(())
}

/// Shutdown configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound on how long stopping may take, in milliseconds.
    #[serde(with = "duration_ms")]
    pub grace_period: Duration,
    /// Whether to listen for OS signals.
    pub listen_for_signals: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            listen_for_signals: true,
        }
    }
}

//! Bounded hand-off from producer caches to the service cache.
//!
//! The instance cache (and the service cache itself) push one
//! [`ServiceNotification`] per affected service onto a bounded
//! [`NotificationQueue`]. A single consumer, [`run_consumer`], drains it in
//! batches and lets the [`ServiceCache`] recompute revisions and namespace
//! aggregates. Producers never drop a notification: a full queue is logged
//! and counted, then the producer waits for capacity.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_core::{CacheKind, InstanceCount, MeshError, MeshResult};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::metrics::CacheMetrics;
use crate::service::ServiceCache;

/// Largest batch the consumer applies at once.
const CONSUMER_BATCH: usize = 512;

/// Why a service needs its derived state refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// The service's instance aggregate changed.
    InstanceCountChanged {
        /// Aggregate before the merge.
        previous: InstanceCount,
        /// Aggregate after the merge.
        current: InstanceCount,
    },
    /// Instances changed without moving the aggregate.
    InstancesChanged,
    /// The service record was created or updated.
    ServiceChanged,
    /// The service record was removed.
    ServiceDeleted,
    /// A rule contributing to the service revision changed.
    RuleChanged,
}

/// A request to refresh one service's derived state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNotification {
    /// Affected service id.
    pub service_id: String,
    /// Namespace to recount, when the producer knows it.
    pub namespace: Option<String>,
    /// Cache that produced the notification.
    pub source: CacheKind,
    /// What changed.
    pub reason: ChangeReason,
}

impl ServiceNotification {
    /// Notification from the instance cache.
    pub fn instances(
        service_id: impl Into<String>,
        previous: InstanceCount,
        current: InstanceCount,
    ) -> Self {
        let reason = if previous == current {
            ChangeReason::InstancesChanged
        } else {
            ChangeReason::InstanceCountChanged { previous, current }
        };
        Self {
            service_id: service_id.into(),
            namespace: None,
            source: CacheKind::Instance,
            reason,
        }
    }

    /// Notification from the service cache.
    pub fn service(
        service_id: impl Into<String>,
        namespace: impl Into<String>,
        deleted: bool,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            namespace: Some(namespace.into()),
            source: CacheKind::Service,
            reason: if deleted {
                ChangeReason::ServiceDeleted
            } else {
                ChangeReason::ServiceChanged
            },
        }
    }
}

/// Consumer half of the queue.
#[derive(Debug)]
pub struct NotificationReceiver {
    rx: mpsc::Receiver<ServiceNotification>,
    metrics: CacheMetrics,
}

impl NotificationReceiver {
    /// Wait for at least one notification and return up to `max`.
    ///
    /// Returns an empty batch once every producer is gone.
    pub async fn recv_batch(&mut self, max: usize) -> Vec<ServiceNotification> {
        let mut batch = Vec::with_capacity(max.min(CONSUMER_BATCH));
        self.rx.recv_many(&mut batch, max.max(1)).await;
        self.metrics.set_queue_depth(self.rx.len());
        batch
    }

    /// Take everything queued right now without waiting.
    pub fn try_drain(&mut self) -> Vec<ServiceNotification> {
        let mut batch = Vec::new();
        while let Ok(notification) = self.rx.try_recv() {
            batch.push(notification);
        }
        self.metrics.set_queue_depth(self.rx.len());
        batch
    }
}

/// Bounded multi-producer, single-consumer notification queue.
#[derive(Debug)]
pub struct NotificationQueue {
    tx: mpsc::Sender<ServiceNotification>,
    rx: Mutex<Option<NotificationReceiver>>,
    metrics: CacheMetrics,
}

impl NotificationQueue {
    /// Create a queue holding at most `capacity` notifications.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Configuration`] if `capacity` is zero.
    pub fn new(capacity: usize, metrics: CacheMetrics) -> MeshResult<Self> {
        if capacity == 0 {
            return Err(MeshError::Configuration(
                "notification queue capacity must be positive".into(),
            ));
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok(Self {
            tx,
            rx: Mutex::new(Some(NotificationReceiver {
                rx,
                metrics: metrics.clone(),
            })),
            metrics,
        })
    }

    /// Enqueue a notification, waiting for capacity if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::QueueClosed`] if the receiver was dropped.
    pub async fn publish(&self, notification: ServiceNotification) -> MeshResult<()> {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(notification)) => {
                self.metrics.record_queue_full();
                warn!(
                    capacity = self.capacity(),
                    service_id = %notification.service_id,
                    "notification queue full, waiting for the consumer"
                );
                self.tx
                    .send(notification)
                    .await
                    .map_err(|_| self.closed())?;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(self.closed()),
        }
        self.metrics.set_queue_depth(self.depth());
        trace!(depth = self.depth(), "queued service notification");
        Ok(())
    }

    /// Notifications waiting for the consumer.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Maximum number of queued notifications.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Take the consumer half. Returns `None` if a consumer already holds it.
    pub fn take_receiver(&self) -> Option<NotificationReceiver> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Hand the consumer half back, e.g. after a manual drain.
    pub fn restore_receiver(&self, receiver: NotificationReceiver) {
        *self.rx.lock().unwrap_or_else(|e| e.into_inner()) = Some(receiver);
    }

    /// Drain everything queued right now.
    ///
    /// Returns an empty batch while a consumer task holds the receiver.
    pub fn drain_now(&self) -> Vec<ServiceNotification> {
        self.rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .map(NotificationReceiver::try_drain)
            .unwrap_or_default()
    }

    fn closed(&self) -> MeshError {
        MeshError::QueueClosed {
            queue: "service_notifications".into(),
        }
    }
}

/// Consume notifications until `shutdown` flips to `true`.
///
/// Each batch is applied to `services`. While unresolved service ids are
/// pending, they are also retried every `retry_interval` without waiting
/// for new traffic. Whatever is still queued at shutdown is applied before
/// returning.
pub async fn run_consumer(
    mut receiver: NotificationReceiver,
    services: Arc<ServiceCache>,
    retry_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> NotificationReceiver {
    let mut retry = tokio::time::interval(retry_interval);
    retry.set_missed_tick_behavior(MissedTickBehavior::Skip);
    retry.tick().await;

    info!("notification consumer started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            batch = receiver.recv_batch(CONSUMER_BATCH) => {
                if batch.is_empty() {
                    debug!("notification queue closed");
                    break;
                }
                let report = services.apply_notifications(batch);
                trace!(
                    resolved = report.resolved,
                    pending = report.pending,
                    namespaces = report.namespaces,
                    "applied notification batch"
                );
            }
            _ = retry.tick(), if services.pending_count() > 0 => {
                let report = services.apply_notifications(Vec::new());
                debug!(
                    resolved = report.resolved,
                    pending = report.pending,
                    "retried pending services"
                );
            }
        }
    }

    let rest = receiver.try_drain();
    if !rest.is_empty() {
        services.apply_notifications(rest);
    }
    info!("notification consumer stopped");
    receiver
}

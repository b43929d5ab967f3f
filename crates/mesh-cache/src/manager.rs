//! Registry and refresh scheduler for every cache.
//!
//! The [`CacheManager`] is assembled explicitly through
//! [`CacheManagerBuilder`]; there is no global registry. On
//! [`start`](CacheManager::start) it warms every enabled cache up in
//! dependency order, then spawns one periodic refresh task per cache plus
//! the notification consumer. [`stop`](CacheManager::stop) flips a `watch`
//! channel and waits for every refresh task; a task always finishes the cycle
//! it is running before it looks at the signal. The consumer has its own
//! channel and keeps draining until the last refresh task is gone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use mesh_core::{CacheKind, MeshError, MeshResult, Store};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::base::{ResourceCache, UpdateOutcome};
use crate::config::CacheConfig;
use crate::instance::InstanceCache;
use crate::metrics::CacheMetrics;
use crate::namespace::NamespaceCache;
use crate::notify::{run_consumer, NotificationQueue, NotificationReceiver};
use crate::service::{ApplyReport, ServiceCache};

/// Batch size used while draining the queue during warm-up.
const WARM_UP_BATCH: usize = 1024;

/// Everything an extra cache may need to wire itself up.
#[derive(Debug, Clone)]
pub struct CacheContext {
    /// The shared store.
    pub store: Arc<dyn Store>,
    /// Validated configuration.
    pub config: CacheConfig,
    /// Notification queue feeding the service cache.
    pub queue: Arc<NotificationQueue>,
    /// The service cache, e.g. to register a revision contributor.
    pub services: Arc<ServiceCache>,
    /// The instance cache.
    pub instances: Arc<InstanceCache>,
    /// Shared metrics handle.
    pub metrics: CacheMetrics,
}

type Registration =
    Box<dyn FnOnce(&CacheContext) -> MeshResult<Arc<dyn ResourceCache>> + Send + 'static>;

/// Builder for [`CacheManager`].
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use mesh_cache::{CacheConfig, CacheManager};
/// use mesh_core::MemoryStore;
///
/// let manager = CacheManager::builder()
///     .store(Arc::new(MemoryStore::new()))
///     .config(CacheConfig::default())
///     .build()?;
/// ```
#[derive(Default)]
pub struct CacheManagerBuilder {
    store: Option<Arc<dyn Store>>,
    config: CacheConfig,
    metrics: Option<CacheMetrics>,
    registrations: Vec<Registration>,
}

impl fmt::Debug for CacheManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManagerBuilder")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

impl CacheManagerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store every cache reads from. Required.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing metrics handle.
    #[must_use]
    pub fn metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register an extra cache built outside the manager.
    #[must_use]
    pub fn register(self, cache: Arc<dyn ResourceCache>) -> Self {
        self.register_with(move |_| Ok(cache))
    }

    /// Register an extra cache built from the manager's shared parts.
    #[must_use]
    pub fn register_with<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&CacheContext) -> MeshResult<Arc<dyn ResourceCache>> + Send + 'static,
    {
        self.registrations.push(Box::new(factory));
        self
    }

    /// Validate the configuration and wire every cache together.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Configuration`] if the store is missing, the
    /// configuration is invalid, or two caches share a kind.
    pub fn build(self) -> MeshResult<CacheManager> {
        let store = self
            .store
            .ok_or_else(|| MeshError::Configuration("cache manager needs a store".into()))?;
        self.config.validate()?;
        let config = self.config;
        let metrics = self.metrics.unwrap_or_default();

        let queue = Arc::new(NotificationQueue::new(
            config.notify_queue_capacity,
            metrics.clone(),
        )?);
        let namespace = Arc::new(NamespaceCache::new(
            Arc::clone(&store),
            &config,
            metrics.clone(),
        )?);
        let instance = Arc::new(InstanceCache::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            &config,
            metrics.clone(),
        )?);
        let service = Arc::new(ServiceCache::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&instance),
            &config,
            metrics.clone(),
        )?);

        let mut caches: BTreeMap<CacheKind, Arc<dyn ResourceCache>> = BTreeMap::new();
        caches.insert(CacheKind::Namespace, namespace.clone());
        caches.insert(CacheKind::Service, service.clone());
        caches.insert(CacheKind::Instance, instance.clone());

        let context = CacheContext {
            store,
            config: config.clone(),
            queue: Arc::clone(&queue),
            services: Arc::clone(&service),
            instances: Arc::clone(&instance),
            metrics,
        };
        for registration in self.registrations {
            let cache = registration(&context)?;
            let kind = cache.kind();
            if caches.contains_key(&kind) {
                return Err(MeshError::Configuration(format!(
                    "a cache is already registered for {kind}"
                )));
            }
            debug!(cache = %kind, "registered cache");
            caches.insert(kind, cache);
        }

        let (shutdown, _) = watch::channel(false);
        let (consumer_stop, _) = watch::channel(false);
        Ok(CacheManager {
            config,
            queue,
            namespace,
            service,
            instance,
            caches,
            shutdown,
            consumer_stop,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            consumer: Mutex::new(None),
        })
    }
}

/// Owns every cache and their refresh tasks.
pub struct CacheManager {
    config: CacheConfig,
    queue: Arc<NotificationQueue>,
    namespace: Arc<NamespaceCache>,
    service: Arc<ServiceCache>,
    instance: Arc<InstanceCache>,
    caches: BTreeMap<CacheKind, Arc<dyn ResourceCache>>,
    shutdown: watch::Sender<bool>,
    consumer_stop: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    consumer: Mutex<Option<JoinHandle<NotificationReceiver>>>,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("caches", &self.kinds())
            .field("started", &self.is_started())
            .field("queue_depth", &self.queue.depth())
            .finish()
    }
}

impl CacheManager {
    /// Start building a manager.
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::new()
    }

    /// Warm every enabled cache up, then spawn the refresh tasks and the
    /// notification consumer.
    ///
    /// Warm-up runs in dependency order. The notification queue is drained
    /// while warming up and once more afterwards, so aggregates are
    /// consistent when this returns.
    ///
    /// # Errors
    ///
    /// Returns the first warm-up failure, [`MeshError::Shutdown`] after
    /// [`stop`](Self::stop), or [`MeshError::Configuration`] if already
    /// started.
    pub async fn start(&self) -> MeshResult<()> {
        if *self.shutdown.borrow() {
            return Err(MeshError::Shutdown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MeshError::Configuration(
                "cache manager already started".into(),
            ));
        }

        let mut receiver = match self.queue.take_receiver() {
            Some(receiver) => receiver,
            None => {
                self.started.store(false, Ordering::SeqCst);
                return Err(MeshError::Internal {
                    message: "notification receiver is held elsewhere".into(),
                    source: None,
                });
            }
        };

        info!(caches = self.caches.len(), "warming up caches");
        for (kind, cache) in self.enabled() {
            match self.update_draining(&cache, &mut receiver).await {
                Ok(outcome) => info!(
                    cache = %kind,
                    rows = outcome.rows,
                    watermark = %outcome.watermark,
                    "cache warmed up"
                ),
                Err(err) => {
                    error!(cache = %kind, error = %err, "cache warm-up failed");
                    self.queue.restore_receiver(receiver);
                    self.started.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        let report = self.service.apply_notifications(receiver.try_drain());
        debug!(
            resolved = report.resolved,
            pending = report.pending,
            "drained warm-up notifications"
        );

        let consumer = tokio::spawn(run_consumer(
            receiver,
            Arc::clone(&self.service),
            self.config.pending_retry_interval,
            self.consumer_stop.subscribe(),
        ));
        *self.consumer.lock().unwrap_or_else(|e| e.into_inner()) = Some(consumer);

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for (_, cache) in self.enabled() {
            tasks.push(tokio::spawn(run_refresh_task(
                cache,
                self.config.refresh_interval,
                self.shutdown.subscribe(),
            )));
        }
        info!(tasks = tasks.len(), "cache manager started");
        Ok(())
    }

    /// Signal every task to stop and wait for them.
    ///
    /// Refresh tasks stop first. The consumer keeps draining while they
    /// finish their cycles, so a producer blocked on a full queue always
    /// gets through; then the consumer applies the backlog and stops.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for result in join_all(tasks).await {
            if let Err(err) = result {
                warn!(error = %err, "refresh task ended abnormally");
            }
        }

        self.consumer_stop.send_replace(true);
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(consumer) = consumer {
            match consumer.await {
                Ok(receiver) => self.queue.restore_receiver(receiver),
                Err(err) => warn!(error = %err, "notification consumer ended abnormally"),
            }
        }
        info!("cache manager stopped");
    }

    /// Run one update of every enabled cache in dependency order.
    ///
    /// Without a running consumer, the queue is drained alongside and the
    /// notifications are applied before returning.
    ///
    /// # Errors
    ///
    /// Returns the first cache failure; later caches are not updated.
    pub async fn refresh_once(&self) -> MeshResult<Vec<UpdateOutcome>> {
        let mut outcomes = Vec::new();
        let mut receiver = self.queue.take_receiver();
        let mut failure = None;
        for (_, cache) in self.enabled() {
            let result = match receiver.as_mut() {
                Some(receiver) => self.update_draining(&cache, receiver).await,
                None => cache.update().await,
            };
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(mut receiver) = receiver {
            self.service.apply_notifications(receiver.try_drain());
            self.queue.restore_receiver(receiver);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }

    /// Apply queued notifications now and retry pending service ids.
    ///
    /// While the consumer task runs it owns the queue; only the pending set
    /// is retried then.
    pub fn drain_notifications(&self) -> ApplyReport {
        let batch = self.queue.drain_now();
        self.service.apply_notifications(batch)
    }

    /// The namespace cache.
    pub fn namespace(&self) -> &Arc<NamespaceCache> {
        &self.namespace
    }

    /// The service cache.
    pub fn service(&self) -> &Arc<ServiceCache> {
        &self.service
    }

    /// The instance cache.
    pub fn instance(&self) -> &Arc<InstanceCache> {
        &self.instance
    }

    /// The cache registered for `kind`.
    pub fn get(&self, kind: CacheKind) -> Option<Arc<dyn ResourceCache>> {
        self.caches.get(&kind).cloned()
    }

    /// Registered kinds in dependency order.
    pub fn kinds(&self) -> Vec<CacheKind> {
        self.caches.keys().copied().collect()
    }

    /// The notification queue.
    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.queue
    }

    /// The configuration the manager was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether [`start`](Self::start) succeeded and [`stop`](Self::stop)
    /// has not been called.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !*self.shutdown.borrow()
    }

    fn enabled(&self) -> Vec<(CacheKind, Arc<dyn ResourceCache>)> {
        self.caches
            .iter()
            .filter(|(kind, _)| self.config.is_enabled(**kind))
            .map(|(kind, cache)| (*kind, Arc::clone(cache)))
            .collect()
    }

    /// Update `cache` while applying whatever it publishes, so a bounded
    /// queue cannot stall a large load.
    async fn update_draining(
        &self,
        cache: &Arc<dyn ResourceCache>,
        receiver: &mut NotificationReceiver,
    ) -> MeshResult<UpdateOutcome> {
        let update = cache.update();
        tokio::pin!(update);
        loop {
            tokio::select! {
                biased;
                result = &mut update => return result,
                batch = receiver.recv_batch(WARM_UP_BATCH) => {
                    if !batch.is_empty() {
                        self.service.apply_notifications(batch);
                    }
                }
            }
        }
    }
}

/// Refresh `cache` every `period` until `shutdown` flips to `true`.
async fn run_refresh_task(
    cache: Arc<dyn ResourceCache>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let kind = cache.kind();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; warm-up already covered it.
    ticker.tick().await;

    debug!(cache = %kind, period_ms = period.as_millis() as u64, "refresh task started");
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
            _ = ticker.tick() => {
                if let Err(err) = cache.update().await {
                    debug!(cache = %kind, error = %err, "refresh cycle failed");
                }
            }
        }
    }
    debug!(cache = %kind, "refresh task stopped");
}

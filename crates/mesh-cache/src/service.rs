//! Service cache: services by id and by (namespace, name), their content
//! revisions, per-namespace aggregates, and the pending set of service ids
//! that instance notifications referenced before the service was cached.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use mesh_core::{
    CacheKind, Entity, MeshResult, NamespaceCount, Service, ServiceRevision, Store, Timestamp,
};
use tracing::{debug, trace, warn};

use crate::base::{
    BaseCache, DeltaOutcome, DeltaSync, FetchRequest, ResourceCache, UpdateOutcome,
};
use crate::config::CacheConfig;
use crate::event::CacheEvent;
use crate::instance::InstanceCache;
use crate::listener::{Listener, ListenerId, ListenerManager};
use crate::metrics::CacheMetrics;
use crate::notify::{NotificationQueue, ServiceNotification};

type NameBucket = Arc<DashMap<String, Arc<Service>>>;

/// A source of rule identifiers folded into service revisions.
///
/// Rule caches register themselves with the service cache; whenever a
/// revision is computed, every contributor is asked for the identifiers of
/// the rules that apply to the service.
pub trait RevisionContributor: Send + Sync {
    /// Kind of the contributing cache.
    fn kind(&self) -> CacheKind;

    /// Identifiers of the rules bound to `service_id`.
    fn revision_parts(&self, service_id: &str) -> Vec<String>;
}

/// Summary of one [`ServiceCache::apply_notifications`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Service ids found in the cache and refreshed.
    pub resolved: usize,
    /// Service ids still unresolved after the pass.
    pub pending: usize,
    /// Namespaces whose aggregate was recomputed.
    pub namespaces: usize,
}

/// Mirror of the store's service table.
pub struct ServiceCache {
    base: BaseCache,
    store: Arc<dyn Store>,
    queue: Arc<NotificationQueue>,
    instances: Arc<InstanceCache>,
    listeners: ListenerManager<Service>,
    ids: DashMap<String, Arc<Service>>,
    names: DashMap<String, NameBucket>,
    /// Source service id to the ids of services aliasing it.
    aliases: DashMap<String, BTreeSet<String>>,
    revisions: DashMap<String, ServiceRevision>,
    namespace_counts: DashMap<String, NamespaceCount>,
    pending: Mutex<HashSet<String>>,
    /// Ids of live store rows the merge skipped as malformed.
    malformed: DashSet<String>,
    contributors: RwLock<Vec<Arc<dyn RevisionContributor>>>,
    need_meta: bool,
    disable_business: bool,
}

impl fmt::Debug for ServiceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCache")
            .field("services", &self.ids.len())
            .field("namespaces", &self.names.len())
            .field("pending", &self.pending_count())
            .field("watermark", &self.base.last_fetch_time())
            .finish()
    }
}

impl ServiceCache {
    /// Create an empty cache reading from `store`.
    ///
    /// `instances` is read when revisions and namespace aggregates are
    /// computed.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<NotificationQueue>,
        instances: Arc<InstanceCache>,
        config: &CacheConfig,
        metrics: CacheMetrics,
    ) -> MeshResult<Self> {
        Ok(Self {
            base: BaseCache::new(CacheKind::Service, config, metrics)?,
            store,
            queue,
            instances,
            listeners: ListenerManager::new(),
            ids: DashMap::new(),
            names: DashMap::new(),
            aliases: DashMap::new(),
            revisions: DashMap::new(),
            namespace_counts: DashMap::new(),
            pending: Mutex::new(HashSet::new()),
            malformed: DashSet::new(),
            contributors: RwLock::new(Vec::new()),
            need_meta: config.need_meta,
            disable_business: config.disable_business,
        })
    }

    /// Register a listener for service events.
    pub fn add_listener(&self, listener: Arc<dyn Listener<Service>>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Remove a listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Fold `contributor`'s rule identifiers into every revision computed
    /// from now on.
    pub fn add_revision_contributor(&self, contributor: Arc<dyn RevisionContributor>) {
        debug!(kind = %contributor.kind(), "registered revision contributor");
        self.contributors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(contributor);
    }

    /// Get a service by id.
    pub fn get_service_by_id(&self, id: &str) -> Option<Arc<Service>> {
        self.ids.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Get a service by namespace and name.
    pub fn get_service_by_name(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.bucket(namespace)
            .and_then(|bucket| bucket.get(name).map(|e| Arc::clone(e.value())))
    }

    /// Aggregate maintained for `namespace` by the notification consumer.
    pub fn get_namespace_count(&self, namespace: &str) -> NamespaceCount {
        self.namespace_counts
            .get(namespace)
            .map(|c| *c.value())
            .unwrap_or_default()
    }

    /// Aggregate of `namespace` computed on demand from the live indices.
    pub fn compute_namespace_count(&self, namespace: &str) -> NamespaceCount {
        let mut count = NamespaceCount::default();
        if let Some(bucket) = self.bucket(namespace) {
            for entry in bucket.iter() {
                count.service_count += 1;
                count.instance_count += self.instances.instance_count(&entry.value().id);
            }
        }
        count
    }

    /// Total number of cached services.
    pub fn services_count(&self) -> usize {
        self.ids.len()
    }

    /// Visit every service until `f` returns `false`.
    pub fn iterate_services<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Service>) -> bool,
    {
        for entry in self.ids.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// Services of one namespace, in no particular order.
    pub fn namespace_services(&self, namespace: &str) -> Vec<Arc<Service>> {
        self.bucket(namespace)
            .map(|bucket| bucket.iter().map(|e| Arc::clone(e.value())).collect())
            .unwrap_or_default()
    }

    /// Names of every namespace with at least one cached service.
    pub fn namespaces(&self) -> Vec<String> {
        self.names.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of unresolved service ids.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Current revision of a service.
    pub fn get_service_revision(&self, id: &str) -> Option<ServiceRevision> {
        self.revisions.get(id).map(|r| r.value().clone())
    }

    /// Compute the revision of `service` from its own revision, its
    /// instances, and every registered contributor.
    ///
    /// Aliases hash the instances of the service they reference.
    pub fn compute_revision(&self, service: &Service) -> ServiceRevision {
        let source = service.reference.as_deref().unwrap_or(&service.id);
        let mut parts = self.instances.instance_revisions(source);
        let contributors: Vec<Arc<dyn RevisionContributor>> = self
            .contributors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for contributor in contributors {
            let kind = contributor.kind();
            parts.extend(
                contributor
                    .revision_parts(&service.id)
                    .into_iter()
                    .map(|part| format!("{kind}:{part}")),
            );
        }
        ServiceRevision::compute(&service.revision, parts)
    }

    /// Refresh derived state for the ids in `batch` and for every pending id.
    ///
    /// Resolved ids get their revision recomputed and their namespace
    /// marked dirty. Ids that do not resolve stay pending as long as the
    /// instance cache still holds instances for them. Dirty namespaces are
    /// recounted last; a namespace without services loses its entry.
    pub fn apply_notifications(&self, batch: Vec<ServiceNotification>) -> ApplyReport {
        let mut ids: BTreeSet<String> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        let mut dirty: BTreeSet<String> = BTreeSet::new();
        for notification in batch {
            if let Some(namespace) = notification.namespace {
                dirty.insert(namespace);
            }
            ids.insert(notification.service_id);
        }

        let mut report = ApplyReport::default();
        let mut unresolved = Vec::new();
        for id in ids {
            match self.get_service_by_id(&id) {
                Some(service) => {
                    self.refresh_revision(&service);
                    for alias in self.aliases_of(&id) {
                        if let Some(alias) = self.get_service_by_id(&alias) {
                            self.refresh_revision(&alias);
                        }
                    }
                    dirty.insert(service.namespace.clone());
                    report.resolved += 1;
                }
                None if self.instances.has_service(&id) => unresolved.push(id),
                None => trace!(service_id = %id, "dropping notification for unknown service"),
            }
        }

        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.extend(unresolved);
            report.pending = pending.len();
        }
        self.base.metrics().set_pending(report.pending);

        for namespace in &dirty {
            self.recount_namespace(namespace);
        }
        report.namespaces = dirty.len();
        report
    }

    /// Refresh state.
    pub fn base(&self) -> &BaseCache {
        &self.base
    }

    fn bucket(&self, namespace: &str) -> Option<NameBucket> {
        self.names.get(namespace).map(|b| Arc::clone(b.value()))
    }

    fn aliases_of(&self, id: &str) -> Vec<String> {
        self.aliases
            .get(id)
            .map(|a| a.value().iter().cloned().collect())
            .unwrap_or_default()
    }

    fn refresh_revision(&self, service: &Service) -> bool {
        let revision = self.compute_revision(service);
        let changed = self
            .revisions
            .get(&service.id)
            .map_or(true, |current| *current.value() != revision);
        if changed {
            trace!(service_id = %service.id, revision = %revision, "service revision changed");
            self.revisions.insert(service.id.clone(), revision);
        }
        changed
    }

    fn recount_namespace(&self, namespace: &str) {
        let count = self.compute_namespace_count(namespace);
        if count.service_count == 0 {
            self.namespace_counts.remove(namespace);
        } else {
            self.namespace_counts.insert(namespace.to_string(), count);
        }
    }

    fn detach(&self, service: &Service) {
        if let Some(bucket) = self.bucket(&service.namespace) {
            bucket.remove_if(&service.name, |_, s| s.id == service.id);
        }
        self.names
            .remove_if(&service.namespace, |_, bucket| bucket.is_empty());
        if let Some(source) = &service.reference {
            if let Some(mut aliases) = self.aliases.get_mut(source) {
                aliases.remove(&service.id);
            }
            self.aliases.remove_if(source, |_, a| a.is_empty());
        }
    }

    fn attach(&self, service: &Arc<Service>) {
        let bucket = Arc::clone(
            self.names
                .entry(service.namespace.clone())
                .or_default()
                .value(),
        );
        bucket.insert(service.name.clone(), Arc::clone(service));
        if let Some(source) = &service.reference {
            self.aliases
                .entry(source.clone())
                .or_default()
                .insert(service.id.clone());
        }
    }

    fn remove_entry(&self, id: &str) -> Option<Arc<Service>> {
        let (_, old) = self.ids.remove(id)?;
        self.detach(&old);
        self.revisions.remove(id);
        Some(old)
    }

    /// Apply a delta to the indices. Returns the notifications to publish:
    /// one per changed service, carrying the namespace to recount.
    fn merge(
        &self,
        rows: Vec<Service>,
        full_reload: bool,
    ) -> (DeltaOutcome, Vec<ServiceNotification>) {
        let mut outcome = DeltaOutcome::default();
        let mut notifications = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut upserted = Vec::new();
        let mut removed = Vec::new();
        let mut failures = 0;
        if full_reload {
            self.malformed.clear();
        }

        for row in rows {
            outcome.observe(row.modify_time);
            self.malformed.remove(&row.id);
            let malformed = row.id.is_empty() || row.namespace.is_empty() || row.name.is_empty();
            // A tombstone only needs its id.
            if malformed && (row.valid || row.id.is_empty()) {
                outcome.skipped += 1;
                if row.valid {
                    warn!(
                        id = %row.id,
                        namespace = %row.namespace,
                        name = %row.name,
                        "skipping malformed service"
                    );
                    // A cached entry keeps its last good version.
                    if full_reload {
                        seen.insert(row.id.clone());
                    }
                    if !self.ids.contains_key(&row.id) {
                        self.malformed.insert(row.id);
                    }
                }
                continue;
            }

            if !row.valid {
                if let Some(old) = self.remove_entry(&row.id) {
                    trace!(id = %old.id, namespace = %old.namespace, "service removed");
                    outcome.deleted += 1;
                    notifications.push(ServiceNotification::service(&old.id, &old.namespace, true));
                    failures += self.listeners.emit(&CacheEvent::Deleted(Arc::clone(&old)));
                    removed.push(old);
                }
                continue;
            }

            if full_reload {
                seen.insert(row.id.clone());
            }
            let existing = self.get_service_by_id(&row.id);
            if existing.as_ref().is_some_and(|cur| cur.same_version(&row)) {
                continue;
            }

            let row = Arc::new(row);
            // Notify the namespace the service left, if it moved; the
            // consumer recounts the current one on resolution.
            let namespace = match &existing {
                Some(prev) => {
                    if prev.namespace != row.namespace
                        || prev.name != row.name
                        || prev.reference != row.reference
                    {
                        self.detach(prev);
                    }
                    prev.namespace.clone()
                }
                None => row.namespace.clone(),
            };
            self.ids.insert(row.id.clone(), Arc::clone(&row));
            self.attach(&row);
            self.refresh_revision(&row);
            notifications.push(ServiceNotification::service(&row.id, namespace, false));
            trace!(id = %row.id, namespace = %row.namespace, name = %row.name, "service upserted");

            let event = if existing.is_some() {
                outcome.updated += 1;
                CacheEvent::Updated(Arc::clone(&row))
            } else {
                outcome.created += 1;
                CacheEvent::Created(Arc::clone(&row))
            };
            failures += self.listeners.emit(&event);
            upserted.push(row);
        }

        if full_reload {
            let stale: Vec<String> = self
                .ids
                .iter()
                .filter(|e| !seen.contains(e.key()))
                .map(|e| e.key().clone())
                .collect();
            for id in stale {
                if let Some(old) = self.remove_entry(&id) {
                    outcome.deleted += 1;
                    notifications.push(ServiceNotification::service(&old.id, &old.namespace, true));
                    failures += self.listeners.emit(&CacheEvent::Deleted(Arc::clone(&old)));
                    removed.push(old);
                }
            }
        }

        if !upserted.is_empty() {
            failures += self.listeners.emit(&CacheEvent::BatchUpdated(upserted));
        }
        if !removed.is_empty() {
            failures += self.listeners.emit(&CacheEvent::BatchDeleted(removed));
        }
        if failures > 0 {
            self.base.stats().record_listener_errors(failures);
            self.base
                .metrics()
                .record_listener_errors(CacheKind::Service, failures);
        }
        self.base
            .metrics()
            .set_entities(CacheKind::Service, self.ids.len());
        (outcome, notifications)
    }

    async fn publish(&self, notifications: Vec<ServiceNotification>) {
        for notification in notifications {
            if let Err(error) = self.queue.publish(notification).await {
                warn!(%error, "dropping service notifications");
                return;
            }
        }
    }
}

#[async_trait]
impl DeltaSync for ServiceCache {
    async fn fetch_and_merge(&self, request: FetchRequest) -> MeshResult<DeltaOutcome> {
        let rows = self
            .store
            .get_more_services(
                request.since,
                request.first_load,
                self.disable_business,
                self.need_meta,
            )
            .await?;
        let (outcome, notifications) = self.merge(rows, request.full_reload);
        self.publish(notifications).await;
        Ok(outcome)
    }

    async fn row_counts(&self) -> MeshResult<Option<(u64, u64)>> {
        // The store counts every namespace; a filtered cache never matches.
        if self.disable_business {
            return Ok(None);
        }
        let store_rows = self.store.services_count().await?;
        let cached = self.ids.len() + self.malformed.len();
        Ok(Some((store_rows, cached as u64)))
    }

    async fn store_clock(&self) -> MeshResult<Option<Timestamp>> {
        self.store.unix_millis().await.map(Some)
    }
}

#[async_trait]
impl ResourceCache for ServiceCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Service
    }

    async fn update(&self) -> MeshResult<UpdateOutcome> {
        self.base.update_with(self).await
    }

    fn clear(&self) {
        self.ids.clear();
        self.names.clear();
        self.aliases.clear();
        self.revisions.clear();
        self.namespace_counts.clear();
        self.malformed.clear();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.base.reset();
        self.base.metrics().set_entities(CacheKind::Service, 0);
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn base(&self) -> &BaseCache {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{Instance, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<NotificationQueue>,
        instances: Arc<InstanceCache>,
        services: ServiceCache,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let metrics = CacheMetrics::new();
        let queue = Arc::new(NotificationQueue::new(1024, metrics.clone()).unwrap());
        let config = CacheConfig::default();
        let instances = Arc::new(
            InstanceCache::new(store.clone(), queue.clone(), &config, metrics.clone()).unwrap(),
        );
        let services = ServiceCache::new(
            store.clone(),
            queue.clone(),
            instances.clone(),
            &config,
            metrics,
        )
        .unwrap();
        Fixture {
            store,
            queue,
            instances,
            services,
        }
    }

    impl Fixture {
        async fn cycle(&self) -> ApplyReport {
            self.services.update().await.unwrap();
            self.instances.update().await.unwrap();
            self.services.apply_notifications(self.queue.drain_now())
        }
    }

    struct Rules;

    impl RevisionContributor for Rules {
        fn kind(&self) -> CacheKind {
            CacheKind::RateLimit
        }

        fn revision_parts(&self, service_id: &str) -> Vec<String> {
            vec![format!("limit-{service_id}")]
        }
    }

    #[tokio::test]
    async fn malformed_services_do_not_cause_drift() {
        let f = fixture();
        f.store.upsert_service(Service::new("svc-a", "default", "orders"));
        f.store.upsert_service(Service::new("bad", "default", ""));
        f.cycle().await;
        assert!(f.services.get_service_by_id("bad").is_none());

        // A cached service turning malformed keeps its last good version.
        f.store.upsert_service(Service::new("svc-a", "", "orders"));
        f.cycle().await;
        assert_eq!(
            f.services.get_service_by_id("svc-a").unwrap().namespace,
            "default"
        );

        for _ in 0..3 {
            f.services.base().force_heal_check();
            let outcome = f.services.update().await.unwrap();
            assert!(!outcome.drift_detected);
        }
        assert_eq!(f.services.base().stats().drift_resets(), 0);

        // Its tombstone still removes it.
        f.store.delete_service("svc-a");
        f.cycle().await;
        assert!(f.services.get_service_by_id("svc-a").is_none());
    }

    #[tokio::test]
    async fn lookups_by_id_and_name() {
        let f = fixture();
        f.store.upsert_service(Service::new("svc-a", "default", "orders"));
        f.cycle().await;

        assert_eq!(f.services.services_count(), 1);
        let by_name = f.services.get_service_by_name("default", "orders").unwrap();
        assert_eq!(by_name.id, "svc-a");
        assert!(f.services.get_service_by_id("svc-a").is_some());
        assert!(f.services.get_service_revision("svc-a").is_some());
    }

    #[tokio::test]
    async fn namespace_counts_follow_instances() {
        let f = fixture();
        f.store.upsert_service(Service::new("svc-a", "default", "orders"));
        f.store.upsert_service(Service::new("svc-b", "default", "billing"));
        for i in 0..3 {
            f.store
                .upsert_instance(Instance::new(format!("a-{i}"), "svc-a", "h", 80));
        }
        f.store
            .upsert_instance(Instance::new("b-0", "svc-b", "h", 80).healthy(false));
        f.cycle().await;

        let count = f.services.get_namespace_count("default");
        assert_eq!(count.service_count, 2);
        assert_eq!(count.instance_count.total, 4);
        assert_eq!(count.instance_count.healthy, 3);
        assert_eq!(count, f.services.compute_namespace_count("default"));
    }

    #[tokio::test]
    async fn revision_changes_with_instances() {
        let f = fixture();
        f.store.upsert_service(Service::new("svc-a", "default", "orders"));
        f.store.upsert_instance(Instance::new("a-0", "svc-a", "h", 80));
        f.cycle().await;
        let before = f.services.get_service_revision("svc-a").unwrap();

        f.store
            .upsert_instance(Instance::new("a-0", "svc-a", "h", 80).with_revision("a-0-r1"));
        f.cycle().await;
        let after = f.services.get_service_revision("svc-a").unwrap();
        assert_ne!(before, after);

        // Nothing changed, nothing moves.
        f.cycle().await;
        assert_eq!(f.services.get_service_revision("svc-a").unwrap(), after);
    }

    #[tokio::test]
    async fn unknown_service_stays_pending_until_cached() {
        let f = fixture();
        f.store.upsert_instance(Instance::new("b-0", "svc-b", "h", 80));
        let report = f.cycle().await;
        assert_eq!(report.pending, 1);
        assert_eq!(f.services.pending_count(), 1);

        f.store.upsert_service(Service::new("svc-b", "prod", "search"));
        f.services.update().await.unwrap();
        let report = f.services.apply_notifications(f.queue.drain_now());
        assert_eq!(report.pending, 0);
        assert_eq!(f.services.get_namespace_count("prod").instance_count.total, 1);
    }

    #[tokio::test]
    async fn pending_dropped_when_instances_vanish() {
        let f = fixture();
        f.store.upsert_instance(Instance::new("b-0", "svc-b", "h", 80));
        f.cycle().await;
        assert_eq!(f.services.pending_count(), 1);

        f.store.delete_instance("b-0");
        let report = f.cycle().await;
        assert_eq!(report.pending, 0);
    }

    #[tokio::test]
    async fn delete_and_rename() {
        let f = fixture();
        f.store.upsert_service(Service::new("svc-a", "default", "orders"));
        f.store.upsert_service(Service::new("svc-b", "default", "billing"));
        f.cycle().await;

        let mut renamed = Service::new("svc-a", "default", "orders-v2");
        renamed.revision = "svc-a-r1".into();
        f.store.upsert_service(renamed);
        f.store.delete_service("svc-b");
        f.cycle().await;

        assert!(f.services.get_service_by_name("default", "orders").is_none());
        assert!(f.services.get_service_by_name("default", "orders-v2").is_some());
        assert!(f.services.get_service_by_id("svc-b").is_none());
        assert!(f.services.get_service_revision("svc-b").is_none());
        assert_eq!(f.services.get_namespace_count("default").service_count, 1);

        f.store.delete_service("svc-a");
        f.cycle().await;
        assert!(f.services.namespace_services("default").is_empty());
        assert_eq!(f.services.get_namespace_count("default"), NamespaceCount::default());
    }

    #[tokio::test]
    async fn alias_hashes_source_instances() {
        let f = fixture();
        f.store.upsert_service(Service::new("svc-a", "default", "orders"));
        f.store
            .upsert_service(Service::new("alias-a", "default", "orders-alias").alias_of("svc-a"));
        f.store.upsert_instance(Instance::new("a-0", "svc-a", "h", 80));
        f.cycle().await;
        let before = f.services.get_service_revision("alias-a").unwrap();

        f.store.upsert_instance(Instance::new("a-1", "svc-a", "h", 81));
        f.cycle().await;
        assert_ne!(f.services.get_service_revision("alias-a").unwrap(), before);
    }

    #[tokio::test]
    async fn contributors_feed_revisions() {
        let f = fixture();
        f.store.upsert_service(Service::new("svc-a", "default", "orders"));
        f.cycle().await;
        let service = f.services.get_service_by_id("svc-a").unwrap();
        let plain = f.services.compute_revision(&service);

        f.services.add_revision_contributor(Arc::new(Rules));
        assert_ne!(f.services.compute_revision(&service), plain);
    }
}

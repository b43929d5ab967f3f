//! Instance cache: instances by id and by owning service, plus per-service
//! aggregates.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use mesh_core::{CacheKind, Entity, Instance, InstanceCount, MeshResult, Store, Timestamp};
use tracing::{trace, warn};

use crate::base::{
    BaseCache, DeltaOutcome, DeltaSync, FetchRequest, ResourceCache, UpdateOutcome,
};
use crate::config::CacheConfig;
use crate::event::CacheEvent;
use crate::listener::{Listener, ListenerId, ListenerManager};
use crate::metrics::CacheMetrics;
use crate::notify::{NotificationQueue, ServiceNotification};

type Bucket = Arc<DashMap<String, Arc<Instance>>>;

/// Mirror of the store's instance table.
///
/// Reads are lock-free with respect to each other and to the merging task.
/// After every merge, each affected service gets its [`InstanceCount`]
/// recomputed from its own bucket and one [`ServiceNotification`] is pushed
/// onto the queue.
pub struct InstanceCache {
    base: BaseCache,
    store: Arc<dyn Store>,
    queue: Arc<NotificationQueue>,
    listeners: ListenerManager<Instance>,
    ids: DashMap<String, Arc<Instance>>,
    by_service: DashMap<String, Bucket>,
    counts: DashMap<String, InstanceCount>,
    /// Ids of live store rows the merge skipped as malformed.
    malformed: DashSet<String>,
    need_meta: bool,
    scope: Vec<String>,
}

impl fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCache")
            .field("instances", &self.ids.len())
            .field("services", &self.by_service.len())
            .field("watermark", &self.base.last_fetch_time())
            .finish()
    }
}

/// Per-service count before and after a merge.
type CountChange = (String, InstanceCount, InstanceCount);

impl InstanceCache {
    /// Create an empty cache reading from `store`.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Configuration`](mesh_core::MeshError) for an
    /// invalid refresh configuration.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<NotificationQueue>,
        config: &CacheConfig,
        metrics: CacheMetrics,
    ) -> MeshResult<Self> {
        Ok(Self {
            base: BaseCache::new(CacheKind::Instance, config, metrics)?,
            store,
            queue,
            listeners: ListenerManager::new(),
            ids: DashMap::new(),
            by_service: DashMap::new(),
            counts: DashMap::new(),
            malformed: DashSet::new(),
            need_meta: config.need_meta,
            scope: config.instance_scope.clone(),
        })
    }

    /// Register a listener for instance events.
    pub fn add_listener(&self, listener: Arc<dyn Listener<Instance>>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Remove a listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Get an instance by id.
    pub fn get_instance(&self, id: &str) -> Option<Arc<Instance>> {
        self.ids.get(id).map(|e| Arc::clone(e.value()))
    }

    /// All instances of a service, in no particular order.
    pub fn get_instances_by_service_id(&self, service_id: &str) -> Vec<Arc<Instance>> {
        self.bucket(service_id)
            .map(|bucket| bucket.iter().map(|e| Arc::clone(e.value())).collect())
            .unwrap_or_default()
    }

    /// Aggregate of a service's instances. Zero for unknown services.
    pub fn instance_count(&self, service_id: &str) -> InstanceCount {
        self.counts
            .get(service_id)
            .map(|c| *c.value())
            .unwrap_or_default()
    }

    /// Total number of cached instances.
    pub fn instances_count(&self) -> usize {
        self.ids.len()
    }

    /// Visit every instance until `f` returns `false`.
    pub fn iterate_instances<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Instance>) -> bool,
    {
        for entry in self.ids.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// Visit a service's instances until `f` returns `false`.
    pub fn iterate_instances_by_service<F>(&self, service_id: &str, mut f: F)
    where
        F: FnMut(&Arc<Instance>) -> bool,
    {
        let Some(bucket) = self.bucket(service_id) else {
            return;
        };
        for entry in bucket.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// Ids of every service with at least one cached instance.
    pub fn service_ids(&self) -> Vec<String> {
        self.by_service.iter().map(|e| e.key().clone()).collect()
    }

    /// Whether any instance of `service_id` is cached.
    pub fn has_service(&self, service_id: &str) -> bool {
        self.by_service.contains_key(service_id)
    }

    /// Sorted instance revisions of a service, for revision computation.
    pub fn instance_revisions(&self, service_id: &str) -> Vec<String> {
        let mut revisions: Vec<String> = self
            .bucket(service_id)
            .map(|bucket| bucket.iter().map(|e| e.value().revision.clone()).collect())
            .unwrap_or_default();
        revisions.sort_unstable();
        revisions
    }

    /// Refresh state.
    pub fn base(&self) -> &BaseCache {
        &self.base
    }

    fn bucket(&self, service_id: &str) -> Option<Bucket> {
        self.by_service.get(service_id).map(|b| Arc::clone(b.value()))
    }

    fn detach(&self, service_id: &str, id: &str) {
        if let Some(bucket) = self.bucket(service_id) {
            bucket.remove(id);
        }
    }

    fn remove_entry(&self, id: &str) -> Option<Arc<Instance>> {
        let (_, old) = self.ids.remove(id)?;
        self.detach(&old.service_id, id);
        Some(old)
    }

    fn count_bucket(&self, service_id: &str) -> InstanceCount {
        self.bucket(service_id)
            .map(|bucket| {
                let mut count = InstanceCount::default();
                for entry in bucket.iter() {
                    count.record(entry.value());
                }
                count
            })
            .unwrap_or_default()
    }

    /// Apply a delta to the indices. No `.await` happens in here, so no
    /// map guard can outlive it.
    fn merge(&self, rows: Vec<Instance>, full_reload: bool) -> (DeltaOutcome, Vec<CountChange>) {
        let mut outcome = DeltaOutcome::default();
        let mut touched: BTreeSet<String> = BTreeSet::new();
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
            let malformed = row.id.is_empty() || row.service_id.is_empty();
            // A tombstone only needs its id.
            if malformed && (row.valid || row.id.is_empty()) {
                outcome.skipped += 1;
                if row.valid {
                    warn!(
                        id = %row.id,
                        service_id = %row.service_id,
                        "skipping malformed instance"
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
                    trace!(id = %old.id, service_id = %old.service_id, "instance removed");
                    touched.insert(old.service_id.clone());
                    outcome.deleted += 1;
                    failures += self.listeners.emit(&CacheEvent::Deleted(Arc::clone(&old)));
                    removed.push(old);
                }
                continue;
            }

            if full_reload {
                seen.insert(row.id.clone());
            }
            let existing = self.get_instance(&row.id);
            if existing.as_ref().is_some_and(|cur| cur.same_version(&row)) {
                continue;
            }

            let row = Arc::new(row);
            if let Some(prev) = &existing {
                if prev.service_id != row.service_id {
                    self.detach(&prev.service_id, &prev.id);
                    touched.insert(prev.service_id.clone());
                }
            }
            self.ids.insert(row.id.clone(), Arc::clone(&row));
            let bucket = Arc::clone(
                self.by_service
                    .entry(row.service_id.clone())
                    .or_default()
                    .value(),
            );
            bucket.insert(row.id.clone(), Arc::clone(&row));
            touched.insert(row.service_id.clone());
            trace!(id = %row.id, service_id = %row.service_id, "instance upserted");

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
                    touched.insert(old.service_id.clone());
                    outcome.deleted += 1;
                    failures += self.listeners.emit(&CacheEvent::Deleted(Arc::clone(&old)));
                    removed.push(old);
                }
            }
            touched.extend(self.by_service.iter().map(|e| e.key().clone()));
            touched.extend(self.counts.iter().map(|e| e.key().clone()));
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
                .record_listener_errors(CacheKind::Instance, failures);
        }

        let changes = touched
            .into_iter()
            .map(|service_id| {
                let previous = self.instance_count(&service_id);
                let current = self.count_bucket(&service_id);
                if current.is_empty() {
                    self.counts.remove(&service_id);
                    self.by_service.remove_if(&service_id, |_, b| b.is_empty());
                } else {
                    self.counts.insert(service_id.clone(), current);
                }
                (service_id, previous, current)
            })
            .collect();

        self.base
            .metrics()
            .set_entities(CacheKind::Instance, self.ids.len());
        (outcome, changes)
    }

    async fn publish(&self, changes: Vec<CountChange>) {
        for (service_id, previous, current) in changes {
            let notification = ServiceNotification::instances(service_id, previous, current);
            if let Err(error) = self.queue.publish(notification).await {
                warn!(%error, "dropping instance notifications");
                return;
            }
        }
    }
}

#[async_trait]
impl DeltaSync for InstanceCache {
    async fn fetch_and_merge(&self, request: FetchRequest) -> MeshResult<DeltaOutcome> {
        let rows = self
            .store
            .get_more_instances(request.since, request.first_load, self.need_meta, &self.scope)
            .await?;
        let (outcome, changes) = self.merge(rows, request.full_reload);
        self.publish(changes).await;
        Ok(outcome)
    }

    async fn row_counts(&self) -> MeshResult<Option<(u64, u64)>> {
        // A scoped cache holds a subset by construction.
        if !self.scope.is_empty() {
            return Ok(None);
        }
        let store_rows = self.store.instances_count().await?;
        let cached = self.ids.len() + self.malformed.len();
        Ok(Some((store_rows, cached as u64)))
    }

    async fn store_clock(&self) -> MeshResult<Option<Timestamp>> {
        self.store.unix_millis().await.map(Some)
    }
}

#[async_trait]
impl ResourceCache for InstanceCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Instance
    }

    async fn update(&self) -> MeshResult<UpdateOutcome> {
        self.base.update_with(self).await
    }

    fn clear(&self) {
        self.ids.clear();
        self.by_service.clear();
        self.counts.clear();
        self.malformed.clear();
        self.base.reset();
        self.base.metrics().set_entities(CacheKind::Instance, 0);
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
    use mesh_core::MemoryStore;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::listener::listener_fn;

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<NotificationQueue>,
        cache: InstanceCache,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let metrics = CacheMetrics::new();
        let queue = Arc::new(NotificationQueue::new(1024, metrics.clone()).unwrap());
        let config = CacheConfig {
            self_heal_interval: Duration::from_millis(10),
            allow_short_self_heal: true,
            ..Default::default()
        };
        let cache = InstanceCache::new(store.clone(), queue.clone(), &config, metrics).unwrap();
        Fixture {
            store,
            queue,
            cache,
        }
    }

    fn seed(store: &MemoryStore, service: &str, n: usize) {
        for i in 0..n {
            store.upsert_instance(Instance::new(
                format!("{service}-ins-{i}"),
                service,
                "10.0.0.1",
                8000 + i as u16,
            ));
        }
    }

    /// Per-service counts computed from scratch.
    fn recount(cache: &InstanceCache) -> BTreeMap<String, InstanceCount> {
        let mut counts: BTreeMap<String, InstanceCount> = BTreeMap::new();
        cache.iterate_instances(|instance| {
            counts
                .entry(instance.service_id.clone())
                .or_default()
                .record(instance);
            true
        });
        counts
    }

    #[tokio::test]
    async fn first_load_indexes_by_service() {
        let f = fixture();
        seed(&f.store, "svc-a", 3);
        seed(&f.store, "svc-b", 2);

        let outcome = f.cache.update().await.unwrap();
        assert!(outcome.first_load);
        assert_eq!(outcome.created, 5);
        assert_eq!(f.cache.instances_count(), 5);
        assert_eq!(f.cache.get_instances_by_service_id("svc-a").len(), 3);
        assert_eq!(f.cache.instance_count("svc-b").total, 2);

        let mut services = f.cache.service_ids();
        services.sort();
        assert_eq!(services, vec!["svc-a", "svc-b"]);
        assert_eq!(f.queue.drain_now().len(), 2);
    }

    #[tokio::test]
    async fn reapplying_a_delta_is_a_no_op() {
        let f = fixture();
        seed(&f.store, "svc-a", 4);
        f.cache.update().await.unwrap();
        f.queue.drain_now();

        // The rollback window re-reads the same rows.
        let again = f.cache.update().await.unwrap();
        assert_eq!(again.rows, 4);
        assert_eq!(again.created + again.updated + again.deleted, 0);
        assert_eq!(f.cache.instance_count("svc-a").total, 4);
        assert!(f.queue.drain_now().is_empty());
    }

    #[tokio::test]
    async fn invalid_row_removes_everywhere() {
        let f = fixture();
        seed(&f.store, "svc-a", 2);
        f.cache.update().await.unwrap();

        f.store.delete_instance("svc-a-ins-0");
        let outcome = f.cache.update().await.unwrap();
        assert_eq!(outcome.deleted, 1);
        assert!(f.cache.get_instance("svc-a-ins-0").is_none());
        assert_eq!(f.cache.get_instances_by_service_id("svc-a").len(), 1);
        assert_eq!(f.cache.instance_count("svc-a").total, 1);

        f.store.delete_instance("svc-a-ins-1");
        f.cache.update().await.unwrap();
        assert!(!f.cache.has_service("svc-a"));
        assert!(f.cache.instance_count("svc-a").is_empty());
    }

    #[tokio::test]
    async fn unknown_tombstone_is_ignored() {
        let f = fixture();
        f.store.put_instance_raw(
            Instance::new("ghost", "svc-a", "h", 1)
                .invalidated()
                .with_modify_time(f.store.tick()),
        );
        f.cache.update().await.unwrap();
        let outcome = f.cache.update().await.unwrap();
        assert_eq!(outcome.deleted, 0);
        assert_eq!(f.cache.instances_count(), 0);
    }

    #[tokio::test]
    async fn moving_service_updates_both_buckets() {
        let f = fixture();
        seed(&f.store, "svc-a", 1);
        f.cache.update().await.unwrap();

        let moved = Instance::new("svc-a-ins-0", "svc-b", "10.0.0.1", 8000).with_revision("r1");
        f.store.upsert_instance(moved);
        let outcome = f.cache.update().await.unwrap();
        assert_eq!(outcome.updated, 1);
        assert!(!f.cache.has_service("svc-a"));
        assert_eq!(f.cache.instance_count("svc-b").total, 1);
    }

    #[tokio::test]
    async fn counts_follow_health_rules() {
        let f = fixture();
        f.store.upsert_instance(Instance::new("a", "svc", "h", 1));
        f.store.upsert_instance(Instance::new("b", "svc", "h", 2).healthy(false));
        f.store.upsert_instance(Instance::new("c", "svc", "h", 3).isolated(true));
        f.store.upsert_instance(Instance::new("d", "svc", "h", 4).with_weight(0));
        f.cache.update().await.unwrap();

        let count = f.cache.instance_count("svc");
        assert_eq!(count.total, 4);
        assert_eq!(count.healthy, 1);
        assert_eq!(count.isolated, 1);
        assert_eq!(recount(&f.cache).get("svc"), Some(&count));
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped() {
        let f = fixture();
        f.store
            .put_instance_raw(Instance::new("bad", "", "h", 1).with_modify_time(f.store.tick()));
        seed(&f.store, "svc-a", 1);

        let outcome = f.cache.update().await.unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(f.cache.instances_count(), 1);
    }

    #[tokio::test]
    async fn malformed_rows_do_not_cause_drift() {
        let f = fixture();
        f.store
            .put_instance_raw(Instance::new("bad", "", "h", 1).with_modify_time(f.store.tick()));
        seed(&f.store, "svc-a", 1);
        f.cache.update().await.unwrap();

        for _ in 0..5 {
            f.cache.base().force_heal_check();
            let outcome = f.cache.update().await.unwrap();
            assert!(!outcome.drift_detected);
            assert!(!outcome.full_reload);
        }
        assert_eq!(f.cache.base().stats().drift_resets(), 0);

        // Deleting the bad row keeps the counts aligned.
        f.store.delete_instance("bad");
        f.cache.update().await.unwrap();
        f.cache.base().force_heal_check();
        assert!(!f.cache.update().await.unwrap().drift_detected);

        // So does repairing it.
        f.store
            .put_instance_raw(Instance::new("bad", "", "h", 1).with_modify_time(f.store.tick()));
        f.cache.update().await.unwrap();
        f.store.upsert_instance(Instance::new("bad", "svc-b", "h", 1));
        f.cache.update().await.unwrap();
        assert_eq!(f.cache.instance_count("svc-b").total, 1);
        f.cache.base().force_heal_check();
        assert!(!f.cache.update().await.unwrap().drift_detected);
        assert_eq!(f.cache.base().stats().drift_resets(), 0);
    }

    #[tokio::test]
    async fn full_reload_sweeps_purged_rows() {
        let f = fixture();
        seed(&f.store, "svc-a", 3);
        f.cache.update().await.unwrap();

        f.store.purge_instance("svc-a-ins-2");
        f.cache.base().force_heal_check();
        let drift = f.cache.update().await.unwrap();
        assert!(drift.drift_detected);

        let reload = f.cache.update().await.unwrap();
        assert!(reload.full_reload);
        assert_eq!(reload.since, Timestamp::ZERO);
        assert_eq!(reload.deleted, 1);
        assert_eq!(f.cache.instance_count("svc-a").total, 2);
        assert!(f.cache.get_instance("svc-a-ins-2").is_none());
    }

    #[tokio::test]
    async fn listeners_see_created_and_batch_events() {
        let f = fixture();
        let singles = Arc::new(AtomicUsize::new(0));
        let batches = Arc::new(AtomicUsize::new(0));
        {
            let singles = Arc::clone(&singles);
            let batches = Arc::clone(&batches);
            f.cache
                .add_listener(listener_fn("count", move |event: &CacheEvent<Instance>| {
                    match event {
                        CacheEvent::BatchUpdated(items) => {
                            batches.fetch_add(items.len(), Ordering::SeqCst);
                        }
                        _ => {
                            singles.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    Ok(())
                }));
        }
        seed(&f.store, "svc-a", 3);
        f.cache.update().await.unwrap();

        assert_eq!(singles.load(Ordering::SeqCst), 3);
        assert_eq!(batches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn clear_restarts_from_first_load() {
        let f = fixture();
        seed(&f.store, "svc-a", 2);
        f.cache.update().await.unwrap();

        f.cache.clear();
        assert!(f.cache.is_empty());
        assert!(f.cache.base().is_first_load());

        let outcome = f.cache.update().await.unwrap();
        assert!(outcome.first_load);
        assert_eq!(f.cache.instances_count(), 2);
    }

    #[tokio::test]
    async fn iteration_stops_early() {
        let f = fixture();
        seed(&f.store, "svc-a", 5);
        f.cache.update().await.unwrap();

        let mut visited = 0;
        f.cache.iterate_instances(|_| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
        assert_eq!(f.cache.instance_revisions("svc-a").len(), 5);
    }
}

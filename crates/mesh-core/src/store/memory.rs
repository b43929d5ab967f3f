//! In-process [`Store`] implementation.
//!
//! Used by tests, benchmarks, and the demo binary. Rows are kept in
//! `DashMap`s; a logical clock stamps every write so modify times are
//! strictly increasing. Deletes are logical (`valid = false`), matching the
//! contract caches rely on.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{Store, SYSTEM_NAMESPACE};
use crate::{Entity, Instance, MeshError, MeshResult, Namespace, Service, Timestamp};

/// A query observed by the store, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    /// Store operation name.
    pub operation: &'static str,
    /// Floor passed by the cache.
    pub since: Timestamp,
    /// First-load flag passed by the cache.
    pub first_load: bool,
}

/// In-memory store with a logical clock and fault injection hooks.
///
/// # Example
///
/// ```rust
/// use mesh_core::{Instance, MemoryStore};
///
/// let store = MemoryStore::new();
/// let ins = store.upsert_instance(Instance::new("ins-1", "svc-a", "10.0.0.1", 80));
/// assert!(ins.modify_time.as_millis() > 0);
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    instances: DashMap<String, Instance>,
    services: DashMap<String, Service>,
    namespaces: DashMap<String, Namespace>,
    /// Last timestamp handed out by the logical clock.
    clock: AtomicI64,
    /// Offset applied to the clock probe only, to simulate skew.
    clock_offset: AtomicI64,
    /// Number of upcoming queries that fail.
    fail_next: AtomicUsize,
    /// Artificial latency per delta query, in milliseconds.
    latency_ms: AtomicU64,
    /// Overrides the instance row-count probe when set.
    instances_count_override: Mutex<Option<u64>>,
    queries: Mutex<Vec<QueryRecord>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store whose clock starts at the current time.
    pub fn new() -> Self {
        Self::with_clock(Timestamp::now())
    }

    /// Create an empty store whose clock starts at `start`.
    pub fn with_clock(start: Timestamp) -> Self {
        Self {
            instances: DashMap::new(),
            services: DashMap::new(),
            namespaces: DashMap::new(),
            clock: AtomicI64::new(start.as_millis()),
            clock_offset: AtomicI64::new(0),
            fail_next: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
            instances_count_override: Mutex::new(None),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Advance the logical clock and return the new time.
    ///
    /// Each call returns a strictly greater value than the previous one and
    /// never falls behind the process wall clock.
    pub fn tick(&self) -> Timestamp {
        let wall = Timestamp::now().as_millis();
        let mut current = self.clock.load(Ordering::SeqCst);
        loop {
            let next = (current + 1).max(wall);
            match self
                .clock
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Timestamp::from_millis(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Current logical time without advancing.
    pub fn current_time(&self) -> Timestamp {
        Timestamp::from_millis(self.clock.load(Ordering::SeqCst))
    }

    /// Insert or update an instance, stamping it with a fresh modify time.
    pub fn upsert_instance(&self, mut instance: Instance) -> Instance {
        instance.modify_time = self.tick();
        self.instances.insert(instance.id.clone(), instance.clone());
        instance
    }

    /// Insert an instance exactly as given, modify time included.
    pub fn put_instance_raw(&self, instance: Instance) {
        self.instances.insert(instance.id.clone(), instance);
    }

    /// Logically delete an instance. Returns the tombstone, if it existed.
    pub fn delete_instance(&self, id: &str) -> Option<Instance> {
        let now = self.tick();
        self.instances.get_mut(id).map(|mut entry| {
            entry.valid = false;
            entry.modify_time = now;
            entry.clone()
        })
    }

    /// Remove an instance row outright, bypassing the tombstone protocol.
    ///
    /// Caches cannot observe this through deltas; only the self-heal row
    /// count probe notices it.
    pub fn purge_instance(&self, id: &str) -> Option<Instance> {
        self.instances.remove(id).map(|(_, v)| v)
    }

    /// Insert or update a service, stamping it with a fresh modify time.
    pub fn upsert_service(&self, mut service: Service) -> Service {
        service.modify_time = self.tick();
        self.services.insert(service.id.clone(), service.clone());
        service
    }

    /// Logically delete a service.
    pub fn delete_service(&self, id: &str) -> Option<Service> {
        let now = self.tick();
        self.services.get_mut(id).map(|mut entry| {
            entry.valid = false;
            entry.modify_time = now;
            entry.clone()
        })
    }

    /// Insert or update a namespace, stamping it with a fresh modify time.
    pub fn upsert_namespace(&self, mut namespace: Namespace) -> Namespace {
        namespace.modify_time = self.tick();
        self.namespaces
            .insert(namespace.name.clone(), namespace.clone());
        namespace
    }

    /// Logically delete a namespace.
    pub fn delete_namespace(&self, name: &str) -> Option<Namespace> {
        let now = self.tick();
        self.namespaces.get_mut(name).map(|mut entry| {
            entry.valid = false;
            entry.modify_time = now;
            entry.clone()
        })
    }

    /// Skew the clock probe by `offset_ms` without touching modify times.
    pub fn set_clock_offset(&self, offset_ms: i64) {
        self.clock_offset.store(offset_ms, Ordering::SeqCst);
    }

    /// Make the next `count` queries fail with a store error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delay every delta query by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Force the instance row-count probe to report `count`.
    pub fn override_instances_count(&self, count: Option<u64>) {
        *self
            .instances_count_override
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = count;
    }

    /// Queries observed so far, oldest first.
    pub fn queries(&self) -> Vec<QueryRecord> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Queries observed for one operation.
    pub fn queries_for(&self, operation: &str) -> Vec<QueryRecord> {
        self.queries()
            .into_iter()
            .filter(|q| q.operation == operation)
            .collect()
    }

    /// Forget all recorded queries.
    pub fn clear_queries(&self) {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn check_fault(&self, operation: &str) -> MeshResult<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MeshError::store_message(operation, "injected failure"));
        }
        Ok(())
    }

    async fn begin_query(
        &self,
        operation: &'static str,
        since: Timestamp,
        first_load: bool,
    ) -> MeshResult<()> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(QueryRecord {
                operation,
                since,
                first_load,
            });

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        self.check_fault(operation)
    }
}

/// Select rows for a delta query, sorted by modify time like a SQL
/// `ORDER BY mtime` would return them.
fn select_delta<T, F>(
    rows: &DashMap<String, T>,
    since: Timestamp,
    first_load: bool,
    filter: F,
) -> Vec<T>
where
    T: Entity,
    F: Fn(&T) -> bool,
{
    let mut out: Vec<T> = rows
        .iter()
        .filter(|r| {
            let row = r.value();
            let in_window = if first_load {
                row.is_valid()
            } else {
                row.modify_time() >= since
            };
            in_window && filter(row)
        })
        .map(|r| r.value().clone())
        .collect();
    out.sort_by(|a, b| {
        a.modify_time()
            .cmp(&b.modify_time())
            .then_with(|| a.id().cmp(b.id()))
    });
    out
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_more_instances(
        &self,
        since: Timestamp,
        first_load: bool,
        need_meta: bool,
        scope: &[String],
    ) -> MeshResult<Vec<Instance>> {
        self.begin_query("get_more_instances", since, first_load)
            .await?;
        let mut rows = select_delta(&self.instances, since, first_load, |i: &Instance| {
            scope.is_empty() || scope.contains(&i.service_id)
        });
        if !need_meta {
            for row in &mut rows {
                row.metadata.clear();
            }
        }
        trace!(since = %since, first_load, rows = rows.len(), "served instance delta");
        Ok(rows)
    }

    async fn get_more_services(
        &self,
        since: Timestamp,
        first_load: bool,
        disable_business: bool,
        need_meta: bool,
    ) -> MeshResult<Vec<Service>> {
        self.begin_query("get_more_services", since, first_load)
            .await?;
        let mut rows = select_delta(&self.services, since, first_load, |s: &Service| {
            !disable_business || s.namespace == SYSTEM_NAMESPACE
        });
        if !need_meta {
            for row in &mut rows {
                row.metadata.clear();
            }
        }
        trace!(since = %since, first_load, rows = rows.len(), "served service delta");
        Ok(rows)
    }

    async fn get_more_namespaces(
        &self,
        since: Timestamp,
        first_load: bool,
    ) -> MeshResult<Vec<Namespace>> {
        self.begin_query("get_more_namespaces", since, first_load)
            .await?;
        Ok(select_delta(&self.namespaces, since, first_load, |_| true))
    }

    async fn instances_count(&self) -> MeshResult<u64> {
        self.check_fault("instances_count")?;
        let forced = *self
            .instances_count_override
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(count) = forced {
            return Ok(count);
        }
        Ok(self.instances.iter().filter(|r| r.valid).count() as u64)
    }

    async fn services_count(&self) -> MeshResult<u64> {
        self.check_fault("services_count")?;
        Ok(self.services.iter().filter(|r| r.valid).count() as u64)
    }

    async fn namespaces_count(&self) -> MeshResult<u64> {
        self.check_fault("namespaces_count")?;
        Ok(self.namespaces.iter().filter(|r| r.valid).count() as u64)
    }

    async fn unix_millis(&self) -> MeshResult<Timestamp> {
        let offset = self.clock_offset.load(Ordering::SeqCst);
        Ok(Timestamp::from_millis(
            self.current_time().as_millis().saturating_add(offset),
        ))
    }
}

//! Namespace cache, the leaf of the dependency graph.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use mesh_core::{CacheKind, Entity, MeshResult, Namespace, Store};
use tracing::{trace, warn};

use crate::base::{
    BaseCache, DeltaOutcome, DeltaSync, FetchRequest, ResourceCache, UpdateOutcome,
};
use crate::config::CacheConfig;
use crate::event::CacheEvent;
use crate::listener::{Listener, ListenerId, ListenerManager};
use crate::metrics::CacheMetrics;

/// Mirror of the store's namespace table, keyed by name.
pub struct NamespaceCache {
    base: BaseCache,
    store: Arc<dyn Store>,
    listeners: ListenerManager<Namespace>,
    names: DashMap<String, Arc<Namespace>>,
    /// Live store rows the merge skipped as malformed.
    malformed: DashSet<String>,
}

impl fmt::Debug for NamespaceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceCache")
            .field("namespaces", &self.names.len())
            .field("watermark", &self.base.last_fetch_time())
            .finish()
    }
}

impl NamespaceCache {
    /// Create an empty cache reading from `store`.
    pub fn new(
        store: Arc<dyn Store>,
        config: &CacheConfig,
        metrics: CacheMetrics,
    ) -> MeshResult<Self> {
        Ok(Self {
            base: BaseCache::new(CacheKind::Namespace, config, metrics)?,
            store,
            listeners: ListenerManager::new(),
            names: DashMap::new(),
            malformed: DashSet::new(),
        })
    }

    /// Register a listener for namespace events.
    pub fn add_listener(&self, listener: Arc<dyn Listener<Namespace>>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Get a namespace by name.
    pub fn get_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.names.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Every cached namespace, sorted by name.
    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        let mut all: Vec<Arc<Namespace>> =
            self.names.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn merge(&self, rows: Vec<Namespace>, full_reload: bool) -> DeltaOutcome {
        let mut outcome = DeltaOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut upserted = Vec::new();
        let mut removed = Vec::new();
        let mut failures = 0;
        if full_reload {
            self.malformed.clear();
        }

        for row in rows {
            outcome.observe(row.modify_time);
            if row.name.is_empty() {
                outcome.skipped += 1;
                if row.valid {
                    warn!("skipping namespace without a name");
                    self.malformed.insert(row.name);
                } else {
                    self.malformed.remove(&row.name);
                }
                continue;
            }
            if !row.valid {
                if let Some((_, old)) = self.names.remove(&row.name) {
                    outcome.deleted += 1;
                    failures += self.listeners.emit(&CacheEvent::Deleted(Arc::clone(&old)));
                    removed.push(old);
                }
                continue;
            }
            if full_reload {
                seen.insert(row.name.clone());
            }
            let existing = self.get_namespace(&row.name);
            if existing.as_ref().is_some_and(|cur| cur.same_version(&row)) {
                continue;
            }

            let row = Arc::new(row);
            self.names.insert(row.name.clone(), Arc::clone(&row));
            trace!(namespace = %row.name, "namespace upserted");
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
                .names
                .iter()
                .filter(|e| !seen.contains(e.key()))
                .map(|e| e.key().clone())
                .collect();
            for name in stale {
                if let Some((_, old)) = self.names.remove(&name) {
                    outcome.deleted += 1;
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
                .record_listener_errors(CacheKind::Namespace, failures);
        }
        self.base
            .metrics()
            .set_entities(CacheKind::Namespace, self.names.len());
        outcome
    }
}

#[async_trait]
impl DeltaSync for NamespaceCache {
    async fn fetch_and_merge(&self, request: FetchRequest) -> MeshResult<DeltaOutcome> {
        let rows = self
            .store
            .get_more_namespaces(request.since, request.first_load)
            .await?;
        Ok(self.merge(rows, request.full_reload))
    }

    async fn row_counts(&self) -> MeshResult<Option<(u64, u64)>> {
        let store_rows = self.store.namespaces_count().await?;
        let cached = self.names.len() + self.malformed.len();
        Ok(Some((store_rows, cached as u64)))
    }
}

#[async_trait]
impl ResourceCache for NamespaceCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Namespace
    }

    async fn update(&self) -> MeshResult<UpdateOutcome> {
        self.base.update_with(self).await
    }

    fn clear(&self) {
        self.names.clear();
        self.malformed.clear();
        self.base.reset();
        self.base.metrics().set_entities(CacheKind::Namespace, 0);
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn base(&self) -> &BaseCache {
        &self.base
    }
}

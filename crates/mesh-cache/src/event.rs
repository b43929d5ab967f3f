//! Change events emitted by cache merges.

use std::sync::Arc;

/// Discriminant of a [`CacheEvent`], used for logging and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// One entity was added.
    Created,
    /// One entity was replaced.
    Updated,
    /// One entity was removed.
    Deleted,
    /// All entities added or replaced by one merge.
    BatchUpdated,
    /// All entities removed by one merge.
    BatchDeleted,
}

impl EventKind {
    /// Stable lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::BatchUpdated => "batch_updated",
            EventKind::BatchDeleted => "batch_deleted",
        }
    }
}

/// A change applied to a cache index.
///
/// Per-entity events are emitted while a delta is merged; the batch variants
/// follow once per merge with every entity the delta touched.
#[derive(Debug, Clone)]
pub enum CacheEvent<T> {
    /// The entity was not cached before.
    Created(Arc<T>),
    /// The entity replaced a cached version.
    Updated(Arc<T>),
    /// The entity was removed; carries the last cached version.
    Deleted(Arc<T>),
    /// Entities created or updated in one merge.
    BatchUpdated(Vec<Arc<T>>),
    /// Entities deleted in one merge.
    BatchDeleted(Vec<Arc<T>>),
}

impl<T> CacheEvent<T> {
    /// The event's discriminant.
    pub fn kind(&self) -> EventKind {
        match self {
            CacheEvent::Created(_) => EventKind::Created,
            CacheEvent::Updated(_) => EventKind::Updated,
            CacheEvent::Deleted(_) => EventKind::Deleted,
            CacheEvent::BatchUpdated(_) => EventKind::BatchUpdated,
            CacheEvent::BatchDeleted(_) => EventKind::BatchDeleted,
        }
    }

    /// Number of entities carried.
    pub fn len(&self) -> usize {
        match self {
            CacheEvent::Created(_) | CacheEvent::Updated(_) | CacheEvent::Deleted(_) => 1,
            CacheEvent::BatchUpdated(items) | CacheEvent::BatchDeleted(items) => items.len(),
        }
    }

    /// Whether the event carries no entity.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entities carried, in merge order.
    pub fn entities(&self) -> &[Arc<T>] {
        match self {
            CacheEvent::Created(item) | CacheEvent::Updated(item) | CacheEvent::Deleted(item) => {
                std::slice::from_ref(item)
            }
            CacheEvent::BatchUpdated(items) | CacheEvent::BatchDeleted(items) => items,
        }
    }

    /// Whether the event removes entities.
    pub fn is_delete(&self) -> bool {
        matches!(self, CacheEvent::Deleted(_) | CacheEvent::BatchDeleted(_))
    }
}

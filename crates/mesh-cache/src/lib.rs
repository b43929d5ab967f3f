//! # mesh-cache
//!
//! Incremental cache synchronization engine for the control plane.
//!
//! This crate keeps in-memory, read-optimized views eventually consistent
//! with the backing [`Store`](mesh_core::Store):
//!
//! - [`BaseCache`] - Watermark-based delta fetch, update dedup, and self-heal
//! - [`ListenerManager`] - Fan-out of [`CacheEvent`]s to registered listeners
//! - [`InstanceCache`] / [`ServiceCache`] / [`NamespaceCache`] - Concrete views
//! - [`NotificationQueue`] - Bounded hand-off from instance to service cache
//! - [`CacheManager`] - Registry and refresh scheduler for every cache
//!
//! ## Key Design Decisions
//!
//! - Uses `DashMap` for every index; readers never take a global lock
//! - All `DashMap` references are dropped before any `.await` to prevent deadlocks
//! - The watermark only advances to modify times observed in a delta
//! - Cross-cache propagation goes through a single bounded queue
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mesh_cache::{CacheConfig, CacheManager};
//! use mesh_core::MemoryStore;
//!
//! let store = Arc::new(MemoryStore::new());
//! let manager = CacheManager::builder()
//!     .store(store)
//!     .config(CacheConfig::default())
//!     .build()?;
//!
//! manager.start().await?;
//! let count = manager.instance().instance_count("svc-a");
//! manager.stop().await;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod base;
mod config;
mod event;
mod instance;
mod listener;
mod manager;
pub mod metrics;
mod namespace;
mod notify;
mod service;
mod singleflight;
mod stats;

pub use base::{BaseCache, DeltaOutcome, DeltaSync, FetchRequest, ResourceCache, UpdateOutcome};
pub use config::{duration_ms, CacheConfig};
pub use event::{CacheEvent, EventKind};
pub use instance::InstanceCache;
pub use listener::{listener_fn, Listener, ListenerId, ListenerManager};
pub use manager::{CacheContext, CacheManager, CacheManagerBuilder};
pub use metrics::CacheMetrics;
pub use namespace::NamespaceCache;
pub use notify::{
    run_consumer, ChangeReason, NotificationQueue, NotificationReceiver, ServiceNotification,
};
pub use service::{ApplyReport, RevisionContributor, ServiceCache};
pub use singleflight::{Flight, SingleFlight};
pub use stats::CacheStats;

//! # nebucloud-mesh
//!
//! Cache synchronization engine for service-mesh control planes.
//!
//! Discovery handlers read services, instances and namespaces from
//! in-memory caches that are kept eventually consistent with a persistent
//! store through periodic, watermark-based delta pulls:
//!
//! - Incremental fetch with a rollback window for late commits
//! - Deduplicated concurrent refreshes
//! - Row-count self-heal that forces a full reload on drift
//! - Per-service revisions and per-namespace aggregates
//! - Lifecycle events for registered listeners
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nebucloud_mesh::prelude::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! store.upsert_service(Service::new("svc-a", "default", "orders"));
//!
//! let plane = ControlPlane::builder().store(store).build()?;
//! plane.start().await?;
//!
//! let count = plane.manager().service().get_namespace_count("default");
//! ```
//!
//! ## Architecture
//!
//! This library is organized into several crates:
//!
//! - `mesh-core` - Entities, the store contract, and error handling
//! - `mesh-cache` - Base cache, concrete caches, notification queue, manager
//! - `mesh-server` - Process runtime: readiness and graceful shutdown
//!
//! This crate (`nebucloud-mesh`) re-exports all public APIs for convenience.
//!
//! ## Design Principles
//!
//! 1. **No panics in library code** - All errors are returned as `Result`
//! 2. **No locks held across await points** - Uses DashMap and careful design
//! 3. **Readers never block writers** - Entities are shared as `Arc`s
//! 4. **Observable** - Built-in metrics and tracing support

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use mesh_cache as cache;
pub use mesh_core as core;
pub use mesh_server as server;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use nebucloud_mesh::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use mesh_core::{
        CacheKind, Entity, Instance, InstanceCount, MemoryStore, MeshError, MeshResult,
        Namespace, NamespaceCount, Service, ServiceRevision, Store, Timestamp,
    };

    // Cache types
    pub use mesh_cache::{
        listener_fn, CacheConfig, CacheEvent, CacheManager, CacheStats, InstanceCache, Listener,
        NamespaceCache, ResourceCache, ServiceCache,
    };

    // Runtime types
    pub use mesh_server::{
        ControlPlane, ControlPlaneBuilder, ControlPlaneConfig, Readiness, ShutdownSignal,
    };
}

/// Version information for this crate.
pub mod version {
    /// Crate version.
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Minimum supported Rust version.
    pub const MSRV: &str = "1.75";

    /// Get version info as a string.
    pub fn version_string() -> String {
        format!("nebucloud-mesh {} (MSRV {})", VERSION, MSRV)
    }
}

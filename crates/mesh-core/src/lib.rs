//! # mesh-core
//!
//! Core types, traits, and error handling for the nebucloud-mesh cache engine.
//!
//! This crate provides the foundational types shared by every cache:
//!
//! - [`MeshError`] - Error type covering store, configuration and pipeline failures
//! - [`Timestamp`] - Millisecond modify-time used for watermarks
//! - [`ServiceRevision`] - Order-independent content hash for change detection
//! - [`CacheKind`] - Resource kinds a cache can be registered under
//! - [`Entity`] - Trait every cached record implements
//! - [`Store`] - The persistent store contract caches pull deltas from
//!
//! ## Example
//!
//! ```rust
//! use mesh_core::{Instance, Entity, Timestamp};
//!
//! let instance = Instance::new("ins-1", "svc-a", "10.0.0.1", 8080)
//!     .with_modify_time(Timestamp::from_millis(1_000));
//!
//! assert!(instance.is_valid());
//! assert_eq!(instance.modify_time().as_millis(), 1_000);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod kind;
mod model;
mod revision;
pub mod store;
mod time;

pub use error::MeshError;
pub use kind::CacheKind;
pub use model::{Entity, Instance, InstanceCount, Namespace, NamespaceCount, Service};
pub use revision::{RevisionHasher, ServiceRevision};
pub use store::{MemoryStore, Store};
pub use time::Timestamp;

/// Result type alias using [`MeshError`].
pub type Result<T> = std::result::Result<T, MeshError>;

/// Alias for Result used throughout the cache crates.
pub type MeshResult<T> = Result<T>;

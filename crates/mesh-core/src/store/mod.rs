//! The persistent store contract.
//!
//! Caches never write to the store; they pull deltas from it. A delta is
//! the set of rows whose modify time is at or after a floor. On a first
//! load the store returns a full snapshot of valid rows instead.

use std::fmt;

use async_trait::async_trait;

use crate::{Instance, MeshResult, Namespace, Service, Timestamp};

pub mod memory;

pub use memory::MemoryStore;

/// Name of the namespace holding the control plane's own services.
///
/// When business services are disabled, only services of this namespace
/// are loaded.
pub const SYSTEM_NAMESPACE: &str = "Polaris";

/// Query interface consumed by the caches.
///
/// Implementations must be safe to share between every cache's refresh
/// task. Each method is a single request/response round trip.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    /// Instances modified at or after `since`.
    ///
    /// With `first_load`, returns every valid instance regardless of
    /// `since`. `scope` restricts the result to the given service ids when
    /// non-empty. Without `need_meta`, metadata maps are left empty.
    async fn get_more_instances(
        &self,
        since: Timestamp,
        first_load: bool,
        need_meta: bool,
        scope: &[String],
    ) -> MeshResult<Vec<Instance>>;

    /// Services modified at or after `since`.
    ///
    /// With `disable_business`, only services of [`SYSTEM_NAMESPACE`] are
    /// returned.
    async fn get_more_services(
        &self,
        since: Timestamp,
        first_load: bool,
        disable_business: bool,
        need_meta: bool,
    ) -> MeshResult<Vec<Service>>;

    /// Namespaces modified at or after `since`.
    async fn get_more_namespaces(
        &self,
        since: Timestamp,
        first_load: bool,
    ) -> MeshResult<Vec<Namespace>>;

    /// Authoritative number of valid instances.
    async fn instances_count(&self) -> MeshResult<u64>;

    /// Authoritative number of valid services.
    async fn services_count(&self) -> MeshResult<u64>;

    /// Authoritative number of valid namespaces.
    async fn namespaces_count(&self) -> MeshResult<u64>;

    /// The store's wall clock.
    async fn unix_millis(&self) -> MeshResult<Timestamp>;
}

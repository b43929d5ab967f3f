//! Cached entity types.
//!
//! The store owns every entity; caches only mirror them. Each entity
//! carries a validity flag and a modify time, and the store never
//! physically deletes, so `valid == false` is the only delete signal a
//! cache ever sees.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::{CacheKind, Timestamp};

/// Trait for records a cache can mirror.
///
/// The cache skeleton only needs identity, validity, modify time, and a
/// revision to merge deltas, emit events, and advance watermarks.
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    /// Resource kind of this entity type.
    const KIND: CacheKind;

    /// Unique identifier within the kind.
    fn id(&self) -> &str;

    /// Whether the entity is alive in the store.
    fn is_valid(&self) -> bool;

    /// Last modification time recorded by the store.
    fn modify_time(&self) -> Timestamp;

    /// Store-assigned content revision.
    fn revision(&self) -> &str;

    /// Whether `other` carries exactly the state already held in `self`.
    ///
    /// Re-applying such a record is a no-op.
    fn same_version(&self, other: &Self) -> bool {
        self.is_valid() == other.is_valid()
            && self.modify_time() == other.modify_time()
            && self.revision() == other.revision()
    }
}

/// A registered instance of a service.
///
/// # Example
///
/// ```rust
/// use mesh_core::Instance;
///
/// let ins = Instance::new("ins-1", "svc-a", "10.0.0.1", 8080).isolated(true);
/// assert!(!ins.counts_as_healthy());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique instance id.
    pub id: String,
    /// Owning service id.
    pub service_id: String,
    /// Host address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Protocol, e.g. `grpc`.
    #[serde(default)]
    pub protocol: String,
    /// Application version.
    #[serde(default)]
    pub version: String,
    /// Load-balancing weight. Zero removes it from the healthy count.
    pub weight: u32,
    /// Health flag reported by health checks.
    pub healthy: bool,
    /// Isolated instances stay registered but receive no traffic.
    pub isolated: bool,
    /// Free-form metadata. Empty when loaded without metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Store-assigned content revision.
    #[serde(default)]
    pub revision: String,
    /// Validity flag.
    pub valid: bool,
    /// Last modify time.
    pub modify_time: Timestamp,
}

impl Instance {
    /// Create a valid, healthy instance with default weight.
    pub fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let id = id.into();
        Self {
            revision: format!("{id}-r0"),
            id,
            service_id: service_id.into(),
            host: host.into(),
            port,
            protocol: String::new(),
            version: String::new(),
            weight: 100,
            healthy: true,
            isolated: false,
            metadata: BTreeMap::new(),
            valid: true,
            modify_time: Timestamp::ZERO,
        }
    }

    /// Set the modify time.
    #[must_use]
    pub fn with_modify_time(mut self, modify_time: Timestamp) -> Self {
        self.modify_time = modify_time;
        self
    }

    /// Set the revision.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Set the health flag.
    #[must_use]
    pub fn healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// Set the isolate flag.
    #[must_use]
    pub fn isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    /// Set the weight.
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mark as deleted.
    #[must_use]
    pub fn invalidated(mut self) -> Self {
        self.valid = false;
        self
    }

    /// Whether this instance counts towards the healthy total.
    #[must_use]
    pub fn counts_as_healthy(&self) -> bool {
        self.healthy && !self.isolated && self.weight > 0
    }

    /// `host:port` endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Entity for Instance {
    const KIND: CacheKind = CacheKind::Instance;

    fn id(&self) -> &str {
        &self.id
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn modify_time(&self) -> Timestamp {
        self.modify_time
    }

    fn revision(&self) -> &str {
        &self.revision
    }
}

/// A registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Unique service id.
    pub id: String,
    /// Namespace name.
    pub namespace: String,
    /// Service name, unique within the namespace.
    pub name: String,
    /// Comma-separated ports.
    #[serde(default)]
    pub ports: String,
    /// Owning business line.
    #[serde(default)]
    pub business: String,
    /// Owning department.
    #[serde(default)]
    pub department: String,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Source service id when this service is an alias.
    #[serde(default)]
    pub reference: Option<String>,
    /// Store-assigned content revision.
    #[serde(default)]
    pub revision: String,
    /// Validity flag.
    pub valid: bool,
    /// Last modify time.
    pub modify_time: Timestamp,
}

impl Service {
    /// Create a valid service.
    pub fn new(
        id: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            revision: format!("{id}-r0"),
            id,
            namespace: namespace.into(),
            name: name.into(),
            ports: String::new(),
            business: String::new(),
            department: String::new(),
            metadata: BTreeMap::new(),
            reference: None,
            valid: true,
            modify_time: Timestamp::ZERO,
        }
    }

    /// Set the modify time.
    #[must_use]
    pub fn with_modify_time(mut self, modify_time: Timestamp) -> Self {
        self.modify_time = modify_time;
        self
    }

    /// Set the revision.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Make this service an alias of `source_id`.
    #[must_use]
    pub fn alias_of(mut self, source_id: impl Into<String>) -> Self {
        self.reference = Some(source_id.into());
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mark as deleted.
    #[must_use]
    pub fn invalidated(mut self) -> Self {
        self.valid = false;
        self
    }

    /// Whether this service is an alias of another one.
    #[must_use]
    pub fn is_alias(&self) -> bool {
        self.reference.is_some()
    }
}

impl Entity for Service {
    const KIND: CacheKind = CacheKind::Service;

    fn id(&self) -> &str {
        &self.id
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn modify_time(&self) -> Timestamp {
        self.modify_time
    }

    fn revision(&self) -> &str {
        &self.revision
    }
}

/// A namespace; services belong to one by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace name, its identity.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub comment: String,
    /// Owner.
    #[serde(default)]
    pub owner: String,
    /// Store-assigned content revision.
    #[serde(default)]
    pub revision: String,
    /// Validity flag.
    pub valid: bool,
    /// Last modify time.
    pub modify_time: Timestamp,
}

impl Namespace {
    /// Create a valid namespace.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            revision: format!("{name}-r0"),
            name,
            comment: String::new(),
            owner: String::new(),
            valid: true,
            modify_time: Timestamp::ZERO,
        }
    }

    /// Set the modify time.
    #[must_use]
    pub fn with_modify_time(mut self, modify_time: Timestamp) -> Self {
        self.modify_time = modify_time;
        self
    }

    /// Mark as deleted.
    #[must_use]
    pub fn invalidated(mut self) -> Self {
        self.valid = false;
        self
    }
}

impl Entity for Namespace {
    const KIND: CacheKind = CacheKind::Namespace;

    fn id(&self) -> &str {
        &self.name
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn modify_time(&self) -> Timestamp {
        self.modify_time
    }

    fn revision(&self) -> &str {
        &self.revision
    }
}

/// Per-service instance aggregate, derived from the instance index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCount {
    /// Number of valid instances.
    pub total: u32,
    /// Healthy, non-isolated instances with positive weight.
    pub healthy: u32,
    /// Isolated instances.
    pub isolated: u32,
}

impl InstanceCount {
    /// Account for one instance.
    pub fn record(&mut self, instance: &Instance) {
        self.total += 1;
        if instance.counts_as_healthy() {
            self.healthy += 1;
        }
        if instance.isolated {
            self.isolated += 1;
        }
    }

    /// Check if no instance was counted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl AddAssign for InstanceCount {
    fn add_assign(&mut self, rhs: Self) {
        self.total += rhs.total;
        self.healthy += rhs.healthy;
        self.isolated += rhs.isolated;
    }
}

impl<'a> FromIterator<&'a Instance> for InstanceCount {
    fn from_iter<I: IntoIterator<Item = &'a Instance>>(iter: I) -> Self {
        let mut count = InstanceCount::default();
        for instance in iter {
            count.record(instance);
        }
        count
    }
}

/// Per-namespace aggregate kept by the service cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceCount {
    /// Number of valid services in the namespace.
    pub service_count: u32,
    /// Summed instance counts of those services.
    pub instance_count: InstanceCount,
}

//! Resource kinds a cache can be registered under.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::MeshError;

/// Identifies the resource type a cache mirrors.
///
/// Every kind maps to one store table family. The cache manager uses the
/// kind as registry key, dedup key, and metric label. Kinds are ordered by
/// their position in the dependency graph, so warm-up can iterate them in
/// declaration order.
///
/// # Example
///
/// ```rust
/// use mesh_core::CacheKind;
///
/// let kind: CacheKind = "instance".parse().unwrap();
/// assert_eq!(kind, CacheKind::Instance);
/// assert_eq!(kind.as_str(), "instance");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    /// Namespaces, the leaf of the dependency graph.
    Namespace,
    /// Services, keyed by id and by (namespace, name).
    Service,
    /// Service instances, keyed by id and by owning service.
    Instance,
    /// Routing rules.
    RoutingConfig,
    /// Rate limit rules.
    RateLimit,
    /// Circuit breaker rules.
    CircuitBreaker,
    /// Fault detection rules.
    FaultDetect,
    /// Legacy routing records.
    L5,
    /// Config file releases.
    ConfigFile,
    /// Config file groups.
    ConfigGroup,
    /// Users and user groups.
    User,
    /// Auth strategies.
    Strategy,
    /// SDK clients.
    Client,
}

impl CacheKind {
    /// All kinds in dependency order.
    pub const ALL: [CacheKind; 13] = [
        CacheKind::Namespace,
        CacheKind::Service,
        CacheKind::Instance,
        CacheKind::RoutingConfig,
        CacheKind::RateLimit,
        CacheKind::CircuitBreaker,
        CacheKind::FaultDetect,
        CacheKind::L5,
        CacheKind::ConfigFile,
        CacheKind::ConfigGroup,
        CacheKind::User,
        CacheKind::Strategy,
        CacheKind::Client,
    ];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Namespace => "namespace",
            CacheKind::Service => "service",
            CacheKind::Instance => "instance",
            CacheKind::RoutingConfig => "routing_config",
            CacheKind::RateLimit => "rate_limit",
            CacheKind::CircuitBreaker => "circuit_breaker",
            CacheKind::FaultDetect => "fault_detect",
            CacheKind::L5 => "l5",
            CacheKind::ConfigFile => "config_file",
            CacheKind::ConfigGroup => "config_group",
            CacheKind::User => "user",
            CacheKind::Strategy => "strategy",
            CacheKind::Client => "client",
        }
    }

    /// Whether this kind contributes to service revisions.
    #[must_use]
    pub const fn affects_service_revision(&self) -> bool {
        matches!(
            self,
            CacheKind::Instance
                | CacheKind::RoutingConfig
                | CacheKind::RateLimit
                | CacheKind::CircuitBreaker
                | CacheKind::FaultDetect
        )
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| MeshError::Configuration(format!("unknown cache kind: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for kind in CacheKind::ALL {
            assert_eq!(kind.as_str().parse::<CacheKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind() {
        assert!("bogus".parse::<CacheKind>().is_err());
    }

    #[test]
    fn test_dependency_order() {
        assert!(CacheKind::Namespace < CacheKind::Service);
        assert!(CacheKind::Service < CacheKind::Instance);
    }

    #[test]
    fn test_revision_contributors() {
        assert!(CacheKind::Instance.affects_service_revision());
        assert!(!CacheKind::Namespace.affects_service_revision());
        assert!(!CacheKind::User.affects_service_revision());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&CacheKind::RateLimit).unwrap();
        assert_eq!(json, "\"rate_limit\"");
    }
}

//! Control plane configuration.

use std::path::Path;

use mesh_cache::CacheConfig;
use mesh_core::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};

use crate::shutdown::ShutdownConfig;

/// Configuration for the control plane process.
///
/// # Example
///
/// ```rust
/// use mesh_server::ControlPlaneConfig;
///
/// let config: ControlPlaneConfig = serde_json::from_str(
///     r#"{ "cache": { "refresh_interval": 500 }, "shutdown": { "grace_period": 5000 } }"#,
/// ).unwrap();
/// assert_eq!(config.cache.refresh_interval.as_millis(), 500);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Cache engine settings.
    pub cache: CacheConfig,
    /// Shutdown settings.
    pub shutdown: ShutdownConfig,
}

impl ControlPlaneConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Configuration`] if the file cannot be read or
    /// parsed, or if the result fails validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MeshError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            MeshError::Configuration(format!("invalid config in {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Configuration`] on the first invalid value.
    pub fn validate(&self) -> MeshResult<()> {
        self.cache.validate()?;
        if self.shutdown.grace_period.is_zero() {
            return Err(MeshError::Configuration(
                "shutdown.grace_period must be positive".into(),
            ));
        }
        Ok(())
    }
}

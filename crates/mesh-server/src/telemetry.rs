//! Tracing setup for control plane binaries.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a formatted subscriber filtered by `RUST_LOG`.
///
/// Falls back to `default_directive` (e.g. `"info"`) when `RUST_LOG` is
/// unset or unparsable. Calling it twice is harmless; the second call is
/// ignored.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

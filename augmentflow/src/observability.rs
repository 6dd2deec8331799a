//! Logging setup helpers.
//!
//! The engine logs through `tracing` and never installs a subscriber on
//! its own. Embedders that want output call one of these helpers once at
//! startup, or install a subscriber of their own.

use tracing_subscriber::EnvFilter;

/// Installs a human-readable global subscriber.
///
/// The filter comes from `RUST_LOG` when set, falling back to
/// `default_filter`. Safe to call more than once: an already-installed
/// subscriber stays installed.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Installs a JSON-formatted global subscriber for log shippers.
pub fn init_json_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init();
}

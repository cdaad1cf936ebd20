//! Tracing setup.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber. The filter defaults to `info` and is
/// overridable through `KONFLUX_OPERATOR_LOG`.
pub fn init() {
    let filter = EnvFilter::try_from_env("KONFLUX_OPERATOR_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

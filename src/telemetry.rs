//! Log output for harness runs.

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "registry_harness=info,tower_http=warn";

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, writing through the
/// test writer so output is captured per test. Safe to call repeatedly.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(false)
        .try_init();
}

//! Shared helpers for integration tests.

use tracing_subscriber::EnvFilter;

/// Route worker logs to the test harness output. Honors `RUST_LOG`.
///
/// Only call this from test binaries that never fork: a subscriber lock held
/// by another thread at fork time would stay locked in the child.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_target(false)
        .try_init();
}

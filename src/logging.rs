//! Tracing subscriber setup for binaries and tests

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honouring `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"tabula_core=info"`).
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Test-friendly variant writing through the libtest capture
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("tabula_core=debug"))
        .with_test_writer()
        .try_init();
}

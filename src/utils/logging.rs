//! Structured logging bootstrap.
//!
//! Thin wrapper over `tracing-subscriber` so hosting applications (and the
//! integration tests) can switch the transport's diagnostics on with one
//! call. Honors `RUST_LOG` when set.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a global subscriber honoring `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    init_with_level(Level::INFO);
}

/// Install a global subscriber with an explicit default level.
pub fn init_with_level(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

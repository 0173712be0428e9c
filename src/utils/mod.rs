//! Shared utilities: error types, retry policy, tracing setup

pub mod errors;
pub mod retry;

/// Initialize the global tracing subscriber with an env-filter directive
///
/// The core itself never installs a subscriber; embedding hosts (and tests)
/// call this once at startup. Returns quietly if a subscriber is already set.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

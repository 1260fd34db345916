//! Log subscriber setup. Logs go to stderr; stdout carries report lines.

use tracing_subscriber::EnvFilter;

use crate::config::ImportConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// verbosity.
pub fn init(config: &ImportConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

//! Log output setup
//!
//! Logs go to stderr so stdout stays free for a tool protocol.

use tracing_subscriber::EnvFilter;

use crate::config::ENV_LOG_LEVEL;
use crate::error::{GateError, Result};

/// Installs a global fmt subscriber filtered by `directive`
/// (e.g. `info` or `tower_mdgate=debug,warn`).
///
/// Fails if the directive does not parse or a subscriber is already set.
pub fn init_tracing(directive: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directive).map_err(|e| GateError::Config {
        message: format!("invalid log filter {:?}: {}", directive, e),
    })?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .try_init()
        .map_err(|e| GateError::Config {
            message: e.to_string(),
        })
}

/// [`init_tracing`] with the level from `MDGATE_LOG_LEVEL`, defaulting to `info`.
pub fn init_from_env() -> Result<()> {
    let level = std::env::var(ENV_LOG_LEVEL)
        .map(|l| l.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&level)
}

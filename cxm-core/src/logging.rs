//! Logging setup

use crate::config::CxmConfig;
use crate::error::{CxmError, CxmResult};
use tracing_subscriber::EnvFilter;

/// Default filter directive for the given configuration flags.
///
/// `quiet` wins over `debug`.
pub fn default_directive(config: &CxmConfig) -> &'static str {
    if config.quiet {
        "warn"
    } else if config.debug {
        "debug"
    } else {
        "info"
    }
}

/// Install the global fmt subscriber. `RUST_LOG` overrides the level derived
/// from the configuration flags.
pub fn init_logging(config: &CxmConfig) -> CxmResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(config)))
        .map_err(|e| CxmError::ConfigError(format!("Invalid log directive: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| CxmError::ConfigError(format!("Failed to install logger: {}", e)))
}

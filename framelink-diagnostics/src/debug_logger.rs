//! Structured logging setup

use framelink_core::{FramelinkError, FramelinkResult};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Install a `tracing` fmt subscriber
///
/// `RUST_LOG` takes precedence over `default_filter`. Installing twice (for
/// example from several tests in one process) is reported as a configuration
/// error rather than a panic.
pub fn init_logging(default_filter: &str) -> FramelinkResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| FramelinkError::InvalidConfiguration {
            message: format!("logging already initialised: {}", e),
        })
}

//! Structured logging setup.
//!
//! Configures `tracing-subscriber` from a [`LoggingConfig`]. The daemon
//! calls [`init`] once at startup; libraries embedding the bridge should
//! install their own subscriber instead.

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{BridgeError, Result};

/// Initialize global logging from the given configuration.
///
/// # Errors
/// Returns a `Config` error if a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| BridgeError::Config(format!("Failed to install subscriber: {e}")))?;

    info!(app = %config.app_name, "Logging initialized");
    Ok(())
}

/// Initialize logging, ignoring an already-installed subscriber.
///
/// Useful in tests where several cases race to install one.
pub fn try_init(config: &LoggingConfig) {
    let _ = init(config);
}

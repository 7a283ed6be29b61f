//! # Configuration Management
//!
//! Centralized configuration for the bridge daemon.
//!
//! This module provides structured configuration for the daemon process,
//! including listen addresses, transport parameters, auth policy, and
//! logging options.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Security Considerations
//! - Auth defaults to off; production devices should set `auth.required`
//! - The payload limit (1 MiB) bounds per-packet allocations

use crate::error::{BridgeError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed packet payload size (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Payload limit assumed for peers that advertise none
pub const LEGACY_MAX_PAYLOAD: usize = 4096;

/// Default port the daemon listens on
pub const DEFAULT_PORT: u16 = 5555;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BridgeConfig {
    /// Daemon process configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| BridgeError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| BridgeError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addrs) = std::env::var("DEVBRIDGE_LISTEN_ADDRS") {
            config.daemon.listen_addrs = addrs.split(',').map(str::to_string).collect();
        }

        if let Ok(max) = std::env::var("DEVBRIDGE_MAX_PAYLOAD") {
            if let Ok(val) = max.parse::<usize>() {
                config.transport.max_payload = val;
            }
        }

        if let Ok(required) = std::env::var("DEVBRIDGE_AUTH_REQUIRED") {
            config.auth.required = matches!(required.as_str(), "1" | "true" | "yes");
        }

        if let Ok(timeout) = std::env::var("DEVBRIDGE_AUTH_TOKEN_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.auth.token_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| BridgeError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.daemon.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.auth.validate());
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Daemon process configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Listen addresses (e.g., "127.0.0.1:5555")
    pub listen_addrs: Vec<String>,

    /// Maximum number of packets queued per connection for writing
    pub outbound_queue: usize,

    /// Timeout for graceful daemon shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Maximum number of concurrent transports
    pub max_transports: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![format!("127.0.0.1:{DEFAULT_PORT}")],
            outbound_queue: 64,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            max_transports: 64,
        }
    }
}

impl DaemonConfig {
    /// Validate daemon configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.listen_addrs.is_empty() {
            errors.push("At least one listen address is required".to_string());
        }
        for addr in &self.listen_addrs {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!(
                    "Invalid listen address format: '{addr}' (expected format: '0.0.0.0:5555')"
                ));
            }
        }

        if self.outbound_queue == 0 {
            errors.push("Outbound queue depth must be greater than 0".to_string());
        } else if self.outbound_queue > 65_536 {
            errors.push(format!(
                "Outbound queue depth too large: {} (max recommended: 65,536)",
                self.outbound_queue
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_transports == 0 {
            errors.push("Max transports must be greater than 0".to_string());
        }

        errors
    }
}

/// Transport configuration, including the identity advertised in the
/// connect banner.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed packet payload size in bytes
    pub max_payload: usize,

    /// Product name advertised in the banner
    pub product: String,

    /// Model advertised in the banner
    pub model: String,

    /// Device name advertised in the banner
    pub device: String,

    /// Features advertised in the banner
    pub features: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
            product: String::new(),
            model: String::new(),
            device: String::new(),
            features: crate::protocol::banner::default_features(),
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload > 16 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum: 16 MB)",
                self.max_payload
            ));
        }

        for feature in &self.features {
            if feature.is_empty() || feature.contains(',') || feature.contains(';') {
                errors.push(format!("Invalid feature name: '{feature}'"));
            }
        }

        errors
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Whether connecting hosts must authenticate
    pub required: bool,

    /// How long to wait for the host to answer an auth token
    #[serde(with = "duration_serde")]
    pub token_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required: false,
            token_timeout: timeout::AUTH_TOKEN_TIMEOUT,
        }
    }
}

impl AuthConfig {
    /// Validate authentication configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.token_timeout.as_secs() < 1 {
            errors.push("Auth token timeout too short (minimum: 1s)".to_string());
        } else if self.token_timeout.as_secs() > 600 {
            errors.push("Auth token timeout too long (maximum: 600s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("devbridge"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

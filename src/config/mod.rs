//! Bus configuration.
//!
//! A single `BusConfig` struct that can be loaded from YAML files or
//! environment variables, plus validation of the numeric ranges the
//! reconnect and queue logic relies on.

use std::time::Duration;

use serde::Deserialize;

use crate::connection::ReconnectPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "starbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "STARBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "STARBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "STARBUS_LOG";
/// Reserved topic the bus publishes its own failures on.
pub const DEFAULT_ERROR_TOPIC: &str = "bus/error";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// What to do when a publish arrives and the outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Refuse the incoming publish with `PublishError::QueueFull`.
    #[default]
    #[serde(alias = "rejectNewest")]
    RejectNewest,
    /// Evict the oldest queued envelope to make room.
    #[serde(alias = "dropOldest")]
    DropOldest,
}

/// Log verbosity used when `STARBUS_LOG` is not set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Message bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Backend URL (used by the WebSocket connector).
    pub endpoint: Option<String>,
    /// Reconnect attempts allowed after a failure before the bus fails.
    #[serde(alias = "maxRetries")]
    pub max_retries: u32,
    /// Delay before the first reconnect attempt.
    #[serde(alias = "baseDelayMs")]
    pub base_delay_ms: u64,
    /// Upper bound on any single reconnect delay.
    #[serde(alias = "maxDelayMs")]
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    #[serde(alias = "backoffFactor")]
    pub backoff_factor: f64,
    /// Envelopes buffered while disconnected.
    #[serde(alias = "outboundQueueCapacity")]
    pub outbound_queue_capacity: usize,
    #[serde(alias = "backpressurePolicy")]
    pub backpressure_policy: BackpressurePolicy,
    /// Frames handed to the live link but not yet written. When full,
    /// publishes go to the outbound queue.
    #[serde(alias = "writeBuffer")]
    pub write_buffer: usize,
    #[serde(alias = "logLevel")]
    pub log_level: LogLevel,
    /// Topic the bus publishes terminal failures on.
    #[serde(alias = "errorTopic")]
    pub error_topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_retries: 5,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            outbound_queue_capacity: 256,
            backpressure_policy: BackpressurePolicy::RejectNewest,
            write_buffer: 64,
            log_level: LogLevel::Info,
            error_topic: DEFAULT_ERROR_TOPIC.to_string(),
        }
    }
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `starbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BusConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the ranges the reconnect and queue logic depend on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "base_delay_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid {
                field: "max_delay_ms",
                reason: format!(
                    "must be >= base_delay_ms ({} < {})",
                    self.max_delay_ms, self.base_delay_ms
                ),
            });
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 1.0 {
            return Err(ConfigError::Invalid {
                field: "backoff_factor",
                reason: format!("must be a finite number > 1 (got {})", self.backoff_factor),
            });
        }
        if self.write_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "write_buffer",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.error_topic.is_empty() {
            return Err(ConfigError::Invalid {
                field: "error_topic",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Reconnect policy derived from the backoff settings.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            factor: self.backoff_factor,
        }
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..Self::default()
        }
    }
}

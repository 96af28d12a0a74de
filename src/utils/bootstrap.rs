//! Bootstrap utilities for starbus binaries and embedding applications.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogLevel, LOG_ENV_VAR};

/// Build the log filter: `STARBUS_LOG` wins, otherwise the configured level.
pub fn log_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(level.as_directive()))
}

/// Initialize tracing with the STARBUS_LOG environment variable.
///
/// Falls back to `level` if STARBUS_LOG is not set. Does nothing if a
/// global subscriber is already installed (e.g. by the embedding app).
pub fn init_tracing(level: LogLevel) {
    let _ = tracing_subscriber::registry()
        .with(log_filter(level))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

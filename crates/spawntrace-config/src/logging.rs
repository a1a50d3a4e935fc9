//! Structured logging utilities for spawntrace components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use spawntrace_config::logging::*;
//!
//! log_tracker_warn!("Start without queued spawn", parent = 0, child = 3);
//! log_cli_info!("Replaying events", path = "trace.jsonl");
//! ```

use serde::{Deserialize, Serialize};

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const TRACKER: &'static str = "TRACKER";
    pub const DISPATCH: &'static str = "DISPATCH";
    pub const PROBE: &'static str = "PROBE";
    pub const CLI: &'static str = "CLI";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// === TRACKER logging macros ===

#[macro_export]
macro_rules! log_tracker_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "TRACKER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_tracker_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "TRACKER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_tracker_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "TRACKER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_tracker_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "TRACKER", $($key = $value,)* $msg)
    };
}

// === DISPATCH logging macros ===

#[macro_export]
macro_rules! log_dispatch_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DISPATCH", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_dispatch_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DISPATCH", $($key = $value,)* $msg)
    };
}

// === PROBE logging macros ===

#[macro_export]
macro_rules! log_probe_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "PROBE", $($key = $value,)* $msg)
    };
}

// === CLI logging macros ===

#[macro_export]
macro_rules! log_cli_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CLI", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cli_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "CLI", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
///
/// `SPAWNTRACE_LOG` wins over `RUST_LOG`, which wins over `level`.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("SPAWNTRACE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

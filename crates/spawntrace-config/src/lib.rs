//! # spawntrace-config
//!
//! Configuration management for spawntrace.
//!
//! Loads configuration from:
//! 1. `~/.spawntrace/config.toml` (global)
//! 2. `.spawntrace/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML render error: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// What the tracker does after a protocol violation.
///
/// The error is returned to the caller either way; the policy only decides
/// whether the trace keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Halt the trace; later events are rejected.
    #[default]
    Abort,
    /// Log the fault, keep a partial record and carry on.
    Continue,
}

impl FromStr for ErrorPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" | "fatal" => Ok(ErrorPolicy::Abort),
            "continue" | "record" => Ok(ErrorPolicy::Continue),
            _ => Err(ConfigError::InvalidValue {
                key: "on_error",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Abort => write!(f, "abort"),
            ErrorPolicy::Continue => write!(f, "continue"),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub hooks: HookConfig,
    pub report: ReportConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let project = Path::new(".spawntrace/config.toml");
        let mut config = Self::load_from(global.as_deref(), Some(project))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from explicit global/project files. Missing files are skipped.
    ///
    /// Tables from the project file are merged key by key over the global
    /// file, so a project only needs to name what it changes.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                debug!("Loading config from {:?}", path);
                let contents = std::fs::read_to_string(path)?;
                let table: toml::Table = toml::from_str(&contents)?;
                merge_tables(&mut merged, table);
            }
        }

        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.spawntrace/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".spawntrace/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are
    /// ignored with a debug log.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(policy) = lookup("SPAWNTRACE_ON_ERROR") {
            match policy.parse() {
                Ok(p) => self.tracker.on_error = p,
                Err(e) => debug!("Ignoring SPAWNTRACE_ON_ERROR: {}", e),
            }
        }
        if let Some(max) = lookup("SPAWNTRACE_MAX_THREADS") {
            if let Ok(n) = max.parse() {
                self.tracker.max_threads = n;
            }
        }
        if let Some(ms) = lookup("SPAWNTRACE_SNAPSHOT_TIMEOUT_MS") {
            if let Ok(n) = ms.parse() {
                self.tracker.snapshot_timeout_ms = n;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Dependency tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Abort or continue after a protocol violation
    pub on_error: ErrorPolicy,
    /// Number of per-thread instruction counter slots
    pub max_threads: usize,
    /// Bounded wait per contended record while taking a snapshot
    pub snapshot_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            on_error: ErrorPolicy::Abort,
            max_threads: 1024,
            snapshot_timeout_ms: 50,
        }
    }
}

/// Which intercepted call sites count as the thread-spawn primitive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub spawn_symbols: Vec<String>,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            spawn_symbols: vec!["pthread_create".to_string(), "_pthread_create".to_string()],
        }
    }
}

/// Report rendering toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Print the external id to thread index table
    pub show_identities: bool,
    /// Print per-parent spawn order against start order
    pub show_spawn_order: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            show_identities: true,
            show_spawn_order: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: logging::LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: logging::LogLevel::Warn,
        }
    }
}

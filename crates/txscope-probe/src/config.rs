//! Probe configuration loading from file and environment variables.

use serde::Deserialize;
use thiserror::Error;
use txscope_db::SqliteConfig;

/// Top-level probe configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: SqliteConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// What the probe checks after connecting.
    #[serde(default)]
    pub probe: ProbeConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "txscope_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Deadline for the health check, in milliseconds.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    /// Also run a read inside a transaction after the health check.
    #[serde(default = "default_transactional_check")]
    pub transactional_check: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_timeout_ms() -> u64 {
    2_000
}

fn default_transactional_check() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            health_timeout_ms: default_health_timeout_ms(),
            transactional_check: default_transactional_check(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be applied.
    #[error("invalid environment override: {0}")]
    Env(#[from] txscope_db::ConfigError),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - every `SQLITE_*` variable understood by [`SqliteConfig::apply_env`]
/// - `TXSCOPE_LOG_LEVEL` overrides `logging.level`
/// - `TXSCOPE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `TXSCOPE_HEALTH_TIMEOUT_MS` overrides `probe.health_timeout_ms`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if an override holds an unparseable value.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    load_config_with(path, |var| std::env::var(var).ok())
}

fn load_config_with<F>(path: Option<&str>, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    config.database.apply_overrides(&lookup)?;

    if let Some(level) = lookup("TXSCOPE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("TXSCOPE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(timeout) = lookup("TXSCOPE_HEALTH_TIMEOUT_MS") {
        if let Ok(parsed) = timeout.parse() {
            config.probe.health_timeout_ms = parsed;
        }
    }

    Ok(config)
}

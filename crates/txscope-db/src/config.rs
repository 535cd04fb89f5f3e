//! SQLite connection parameters.
//!
//! [`SqliteParameters`] is the narrow view the connection manager reads;
//! [`SqliteConfig`] is the stock implementation, deserialisable from TOML and
//! overridable from `SQLITE_*` environment variables.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::transactions::TxLockMode;

/// Connection parameters consumed by [`crate::Connection`].
pub trait SqliteParameters: Send + Sync {
    /// URI form of the database location, for diagnostics.
    fn database_dsn(&self) -> String;

    fn db_name(&self) -> &str;

    fn db_user(&self) -> &str;

    fn db_password(&self) -> &str;

    /// Upper bound for checking out a connection during connect and health checks.
    fn connect_timeout(&self) -> Duration;

    /// Path handed to SQLite when opening the database.
    fn sqlite_file_path(&self) -> &str;

    /// Maximum number of connection attempts. `0` means retry forever.
    fn connection_retry_count(&self) -> u8;

    /// Delay between two consecutive connection attempts.
    fn connection_retry_timeout(&self) -> Duration;

    /// SQLite busy timeout applied to every pooled connection.
    fn busy_timeout(&self) -> Duration {
        Duration::from_millis(default_timeout_ms())
    }

    /// Maximum number of pooled connections.
    fn pool_max_size(&self) -> u32 {
        default_pool_max_size()
    }

    /// Locking flavour used for `BEGIN`.
    fn tx_lock_mode(&self) -> TxLockMode {
        TxLockMode::default()
    }
}

/// Stock SQLite configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file. Use `:memory:` for an in-memory database.
    #[serde(default = "default_file_path")]
    pub file_path: String,

    #[serde(default = "default_db_name")]
    pub db_name: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Connection checkout timeout, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Maximum number of connection attempts. If 0 - infinite loop.
    #[serde(default)]
    pub retry_count: u8,

    /// Pause between connection attempts, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub retry_timeout_ms: u64,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    #[serde(default)]
    pub tx_lock: TxLockMode,
}

fn default_file_path() -> String {
    "/var/lib/application/db.sqlite".to_string()
}

fn default_db_name() -> String {
    "ca-api-gateway".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            file_path: default_file_path(),
            db_name: default_db_name(),
            username: String::new(),
            password: String::new(),
            connect_timeout_ms: default_timeout_ms(),
            retry_count: 0,
            retry_timeout_ms: default_timeout_ms(),
            busy_timeout_ms: default_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            tx_lock: TxLockMode::default(),
        }
    }
}

/// Errors that can occur when reading configuration overrides.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv {
        /// The offending variable.
        var: &'static str,
        /// Its raw value.
        value: String,
    },
}

impl SqliteConfig {
    /// Defaults with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnv` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Applies overrides from the process environment.
    ///
    /// Environment variable overrides:
    /// - `SQLITE_DATABASE_FILE_PATH` overrides `file_path`
    /// - `SQLITE_DATABASE_DATABASE_NAME` overrides `db_name`
    /// - `SQLITE_DATABASE_USERNAME` overrides `username`
    /// - `SQLITE_DATABASE_PASSWORD` overrides `password`
    /// - `SQLITE_CONNECTION_RETRY_TIMEOUT` overrides `retry_timeout_ms`
    /// - `SQLITE_CONNECTION_RETRY_COUNT` overrides `retry_count`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnv` if a numeric variable does not parse.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnv` if a numeric variable does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("SQLITE_DATABASE_FILE_PATH") {
            self.file_path = path;
        }
        if let Some(name) = lookup("SQLITE_DATABASE_DATABASE_NAME") {
            self.db_name = name;
        }
        if let Some(user) = lookup("SQLITE_DATABASE_USERNAME") {
            self.username = user;
        }
        if let Some(password) = lookup("SQLITE_DATABASE_PASSWORD") {
            self.password = password;
        }
        if let Some(timeout) = lookup("SQLITE_CONNECTION_RETRY_TIMEOUT") {
            self.retry_timeout_ms = parse_env("SQLITE_CONNECTION_RETRY_TIMEOUT", timeout)?;
        }
        if let Some(count) = lookup("SQLITE_CONNECTION_RETRY_COUNT") {
            self.retry_count = parse_env("SQLITE_CONNECTION_RETRY_COUNT", count)?;
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

impl SqliteParameters for SqliteConfig {
    fn database_dsn(&self) -> String {
        format!(
            "file:{}?mode=rwc&_txlock={}",
            self.file_path,
            self.tx_lock.as_str()
        )
    }

    fn db_name(&self) -> &str {
        &self.db_name
    }

    fn db_user(&self) -> &str {
        &self.username
    }

    fn db_password(&self) -> &str {
        &self.password
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn sqlite_file_path(&self) -> &str {
        &self.file_path
    }

    fn connection_retry_count(&self) -> u8 {
        self.retry_count
    }

    fn connection_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    fn pool_max_size(&self) -> u32 {
        self.pool_max_size
    }

    fn tx_lock_mode(&self) -> TxLockMode {
        self.tx_lock
    }
}

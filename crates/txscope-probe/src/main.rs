//! `txscope-probe`: connects to the configured SQLite database, verifies it
//! with the health check and an optional transactional read, then exits.
//!
//! Exit status is non-zero when the database cannot be reached within the
//! configured retry budget or fails its health check.

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use txscope_db::{default_error_formatter, Connection, DbContext, DbError, DefaultLoggerBuilder};

use crate::config::{Config, LoggingConfig};

#[derive(Debug, Error)]
enum ProbeError {
    #[error(transparent)]
    Database(#[from] DbError),

    #[error("database failed its health check")]
    Unhealthy,
}

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("TXSCOPE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> ExitCode {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("txscope.toml"));

    let config = match config::load_config(selected_config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "probe failed");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), ProbeError> {
    let health_timeout = Duration::from_millis(config.probe.health_timeout_ms);
    let mut conn = Connection::new(
        &DefaultLoggerBuilder,
        default_error_formatter(),
        Arc::new(config.database),
    );

    conn.connect()?;

    let ctx = DbContext::background().with_timeout(health_timeout);
    if !conn.is_healed(&ctx) {
        conn.close()?;
        return Err(ProbeError::Unhealthy);
    }

    if config.probe.transactional_check {
        let tables: i64 = conn.begin_read_committed_tx_rollback_on_error(&ctx, |tx_ctx| {
            conn.must_with_transaction(tx_ctx, |db| {
                Ok(db.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )?)
            })
        })?;
        tracing::info!(tables, "transactional check passed");
    }

    conn.close()?;
    tracing::info!("database healthy");
    Ok(())
}

//! SQLite connection management and context-scoped transactions.
//!
//! Provides a single managed database handle with bounded (or unlimited)
//! connect retries, a two-stage health check, and helpers that run code
//! inside a transaction with automatic commit or rollback. An open
//! transaction travels with a [`DbContext`], so nested calls join it
//! instead of opening nested transactions.
//!
//! # Design decisions
//!
//! - **Synchronous API over `r2d2` + `rusqlite`**: callers block during
//!   connect, statements, commit and rollback; retry pauses are deliberate
//!   backpressure against an unavailable database.
//! - **Typed context instead of an untyped key slot**: [`DbContext`] carries
//!   at most one active [`Transaction`] and is passed explicitly.
//! - **Capabilities as traits**: configuration ([`SqliteParameters`]), error
//!   annotation ([`ErrorFormatter`]) and logging ([`LoggerBuilder`]) are
//!   injected, with stock implementations for each.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use txscope_db::{Connection, DbContext, DefaultErrorFormatter, DefaultLoggerBuilder, SqliteConfig};
//!
//! let mut conn = Connection::new(
//!     &DefaultLoggerBuilder,
//!     Arc::new(DefaultErrorFormatter),
//!     Arc::new(SqliteConfig::from_env()?),
//! );
//! conn.connect()?;
//!
//! let ctx = DbContext::background();
//! conn.begin_read_committed_tx_rollback_on_error(&ctx, |tx_ctx| {
//!     conn.must_with_transaction(tx_ctx, |db| {
//!         db.execute("UPDATE accounts SET balance = balance - 10 WHERE id = 1", [])?;
//!         Ok(())
//!     })
//! })?;
//! ```

mod config;
mod connection;
mod context;
mod errors;
mod logger;
mod pool;
mod transactions;
mod utils;

pub use config::{ConfigError, SqliteConfig, SqliteParameters};
pub use connection::{Connection, Opener, PoolOpener, RetryPolicy, Sleeper, ThreadSleeper};
pub use context::{ContextError, DbContext};
pub use errors::{default_error_formatter, wrap_error, DbError, DefaultErrorFormatter, ErrorFormatter};
pub use logger::{DefaultLoggerBuilder, LoggerBuilder};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PooledConn};
pub use transactions::{IsolationLevel, Transaction, TxLockMode, TxState};
pub use utils::{empty_or_error, set_default_error_formatter, OptionalRowExt};

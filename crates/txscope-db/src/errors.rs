//! Error types and the pluggable error formatter.
//!
//! Every failure that leaves this crate is a [`DbError`]. Before crossing the
//! component boundary, errors pass through an [`ErrorFormatter`], which may
//! annotate them with context strings. The stock [`DefaultErrorFormatter`]
//! appends details as `"<error>: <detail>-<detail>"`, so the driver error
//! always stays at the front of the message chain.

use std::fmt;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::context::ContextError;
use crate::transactions::TxState;

/// Errors produced by the connection manager and transaction helpers.
#[derive(Debug, Error)]
pub enum DbError {
    /// The SQLite driver reported a failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Checking a connection out of the pool failed.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// `connect` was called on a manager built around an injected pool.
    #[error("no sqlite configuration provided")]
    MissingConfig,

    /// The manager holds no live handle.
    #[error("database is not connected")]
    NotConnected,

    /// Every permitted connection attempt failed.
    #[error("unable to connect after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        /// Number of attempts that were made.
        attempts: u32,
        /// The error returned by the last attempt.
        source: Box<DbError>,
    },

    /// A transaction was required but the context carries none.
    #[error("unable get transaction from context")]
    NoTransactionInContext,

    /// Commit or rollback was requested outside a contextual transaction.
    #[error("unable to commit transaction statement - not in tx statement")]
    NotInContextualTx,

    /// A new transaction was requested on a context that already has one.
    #[error("context already carries an active transaction")]
    AlreadyInTransaction,

    /// The transaction reached a terminal state and cannot be used again.
    #[error("transaction already {0}")]
    TransactionFinished(TxState),

    /// The transaction is borrowed by an enclosing statement callback.
    #[error("transaction is in use by an enclosing statement")]
    TransactionInUse,

    /// The caller's context was cancelled or ran out of time.
    #[error(transparent)]
    Done(#[from] ContextError),

    /// The functional probe answered with something other than `1`.
    #[error("health probe returned unexpected value {0}")]
    UnexpectedProbe(i64),

    /// A free-form error created through [`ErrorFormatter::new_error`].
    #[error("{0}")]
    Message(String),

    /// An error annotated with context by an [`ErrorFormatter`].
    #[error("{source}: {context}")]
    Wrapped {
        /// Context details joined into one string.
        context: String,
        /// The annotated error.
        source: Box<DbError>,
    },
}

impl DbError {
    /// Returns the innermost error beneath any [`DbError::Wrapped`] layers.
    pub fn root(&self) -> &DbError {
        let mut current = self;
        while let DbError::Wrapped { source, .. } = current {
            current = source;
        }
        current
    }

    /// Whether this error, once unwrapped, is SQLite's "no rows" condition.
    pub fn is_no_rows(&self) -> bool {
        matches!(
            self.root(),
            DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows)
        )
    }
}

/// Capability for annotating errors with contextual detail strings.
///
/// Implementations must be cheap and infallible; they are called on every
/// error path in the connection manager.
pub trait ErrorFormatter: Send + Sync {
    /// Passes the error through untouched.
    fn no_wrap(&self, err: DbError) -> DbError {
        err
    }

    /// Annotates `err` with `details`. An empty slice leaves it untouched.
    fn wrap(&self, err: DbError, details: &[&str]) -> DbError;

    /// Annotates `err` with a formatted detail string.
    fn wrap_fmt(&self, err: DbError, args: fmt::Arguments<'_>) -> DbError {
        let detail = args.to_string();
        self.wrap(err, &[detail.as_str()])
    }

    /// Builds a new error out of detail strings.
    fn new_error(&self, details: &[&str]) -> DbError;

    /// Builds a new error from a format string.
    fn new_error_fmt(&self, args: fmt::Arguments<'_>) -> DbError {
        let detail = args.to_string();
        self.new_error(&[detail.as_str()])
    }
}

/// The formatter used when the application supplies none.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorFormatter;

impl ErrorFormatter for DefaultErrorFormatter {
    fn wrap(&self, err: DbError, details: &[&str]) -> DbError {
        if details.is_empty() {
            return err;
        }

        DbError::Wrapped {
            context: details.join("-"),
            source: Box::new(err),
        }
    }

    fn new_error(&self, details: &[&str]) -> DbError {
        DbError::Message(details.join(", "))
    }
}

pub(crate) static DEFAULT_FORMATTER: OnceLock<Arc<dyn ErrorFormatter>> = OnceLock::new();

/// Returns the process-wide formatter, installing [`DefaultErrorFormatter`]
/// on first use if [`crate::set_default_error_formatter`] was never called.
pub fn default_error_formatter() -> Arc<dyn ErrorFormatter> {
    Arc::clone(DEFAULT_FORMATTER.get_or_init(|| Arc::new(DefaultErrorFormatter)))
}

/// Annotates `err` using the process-wide formatter.
pub fn wrap_error(err: DbError, details: &[&str]) -> DbError {
    default_error_formatter().wrap(err, details)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_appends_details_after_the_source_message() {
        let err = DefaultErrorFormatter.wrap(DbError::NotConnected, &["close", "shutdown"]);
        assert_eq!(err.to_string(), "database is not connected: close-shutdown");
        assert!(matches!(err.root(), DbError::NotConnected));
    }

    #[test]
    fn wrap_without_details_is_identity() {
        let err = DefaultErrorFormatter.wrap(DbError::MissingConfig, &[]);
        assert!(matches!(err, DbError::MissingConfig));
    }

    #[test]
    fn root_walks_nested_wrappers() {
        let fmt = DefaultErrorFormatter;
        let err = fmt.wrap(
            fmt.wrap(DbError::NoTransactionInContext, &["inner"]),
            &["outer"],
        );

        assert_eq!(
            err.to_string(),
            "unable get transaction from context: inner: outer"
        );
        assert!(matches!(err.root(), DbError::NoTransactionInContext));
    }

    #[test]
    fn new_error_joins_details_with_commas() {
        let err = DefaultErrorFormatter.new_error(&["first", "second"]);
        assert_eq!(err.to_string(), "first, second");

        let err = DefaultErrorFormatter.new_error_fmt(format_args!("attempt {}", 3));
        assert_eq!(err.to_string(), "attempt 3");
    }

    #[test]
    fn wrap_fmt_formats_single_detail() {
        let err =
            DefaultErrorFormatter.wrap_fmt(DbError::NotConnected, format_args!("pool {}", "main"));
        assert_eq!(err.to_string(), "database is not connected: pool main");
    }

    #[test]
    fn no_rows_is_detected_through_wrappers() {
        let err = DefaultErrorFormatter.wrap(
            DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows),
            &["lookup"],
        );
        assert!(err.is_no_rows());
        assert!(!DbError::NotConnected.is_no_rows());
    }
}

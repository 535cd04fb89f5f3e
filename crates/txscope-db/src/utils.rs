//! Small helpers shared by callers of the database layer.

use std::sync::Arc;

use crate::errors::{wrap_error, DbError, ErrorFormatter, DEFAULT_FORMATTER};

/// Installs the process-wide error formatter used by [`empty_or_error`] and
/// [`crate::wrap_error`].
///
/// Meant to be called once at startup. Returns `false` if a formatter was
/// already installed (or the default was already used), in which case the
/// call has no effect.
pub fn set_default_error_formatter(formatter: Arc<dyn ErrorFormatter>) -> bool {
    DEFAULT_FORMATTER.set(formatter).is_ok()
}

/// Treats SQLite's "no rows" condition as success and annotates every other
/// error with `message`.
///
/// # Errors
///
/// Returns `err` wrapped with `message` unless it is a "no rows" error.
pub fn empty_or_error(err: DbError, message: &str) -> Result<(), DbError> {
    if err.is_no_rows() {
        return Ok(());
    }

    Err(wrap_error(err, &[message]))
}

/// Optional single-row lookups.
pub trait OptionalRowExt<T> {
    /// Maps "no rows" to `Ok(None)` and wraps any other error with `message`.
    ///
    /// # Errors
    ///
    /// Returns every error other than "no rows", wrapped with `message`.
    fn optional_or(self, message: &str) -> Result<Option<T>, DbError>;
}

impl<T, E> OptionalRowExt<T> for Result<T, E>
where
    E: Into<DbError>,
{
    fn optional_or(self, message: &str) -> Result<Option<T>, DbError> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(err) => empty_or_error(err.into(), message).map(|()| None),
        }
    }
}

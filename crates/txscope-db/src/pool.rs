//! Connection pool creation and configuration.

use std::time::{Duration, Instant};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

use crate::config::SqliteParameters;
use crate::context::DbContext;
use crate::errors::DbError;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,

    /// How long the pool waits for a connection before giving up, in milliseconds.
    pub connection_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            connection_timeout_ms: 5_000,
        }
    }
}

impl DbRuntimeSettings {
    /// Reads the pool tunables out of a parameter provider.
    pub fn from_params(params: &dyn SqliteParameters) -> Self {
        Self {
            busy_timeout_ms: duration_ms(params.busy_timeout()),
            pool_max_size: params.pool_max_size().max(1),
            connection_timeout_ms: duration_ms(params.connect_timeout()),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// A connection checked out of a [`DbPool`].
pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Longest single wait on the pool before the caller's context is re-checked.
const CHECKOUT_SLICE: Duration = Duration::from_millis(50);

/// Creates a new SQLite connection pool.
///
/// Every connection the pool opens runs in WAL mode (in-memory databases
/// report `memory` instead), enforces foreign keys, and waits up to the busy
/// timeout on a locked database before failing.
///
/// # Arguments
///
/// * `db_path` - Path to the SQLite database file. Use `:memory:` for an
///   in-memory database (useful for testing).
///
/// # Errors
///
/// Returns `DbError::Pool` if the connection pool cannot be created, which
/// includes the first connection failing its setup.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, DbError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let busy_timeout = Duration::from_millis(settings.busy_timeout_ms);
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| prepare_connection(conn, busy_timeout));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size.max(1))
        .connection_timeout(Duration::from_millis(settings.connection_timeout_ms.max(1)))
        .build(manager)?;

    Ok(pool)
}

fn prepare_connection(
    conn: &mut rusqlite::Connection,
    busy_timeout: Duration,
) -> rusqlite::Result<()> {
    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    let usable = ["wal", "memory"]
        .iter()
        .any(|mode| journal_mode.eq_ignore_ascii_case(mode));
    if !usable {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode stayed {journal_mode}, expected wal")),
        ));
    }

    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(busy_timeout)
}

/// Checks a connection out of `pool`, giving up after `limit`, at the
/// context's deadline, or as soon as the context is cancelled, whichever
/// comes first.
///
/// The wait is split into short slices so a cancellation that arrives while
/// every connection is busy is noticed within one slice.
pub(crate) fn checkout(
    pool: &DbPool,
    ctx: &DbContext,
    limit: Duration,
) -> Result<PooledConn, DbError> {
    let give_up = Instant::now().checked_add(limit);

    loop {
        ctx.check()?;

        let mut budget = give_up.map(|at| at.saturating_duration_since(Instant::now()));
        if let Some(remaining) = ctx.remaining() {
            budget = Some(budget.map_or(remaining, |left| left.min(remaining)));
        }
        let slice = budget.map_or(CHECKOUT_SLICE, |left| left.min(CHECKOUT_SLICE));

        match pool.get_timeout(slice) {
            Ok(conn) => return Ok(conn),
            Err(err) if budget.is_some_and(|left| left <= slice) => {
                ctx.check()?;
                return Err(err.into());
            }
            Err(_) => {}
        }
    }
}

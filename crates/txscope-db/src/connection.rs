//! The managed database handle: retrying connect, health checks, close.
//!
//! A connection attempt only counts as successful when the pool can hand out
//! a connection that answers both a liveness ping and a functional
//! `SELECT 1` probe. For a file-backed SQLite database the "connection" is a
//! thin wrapper around file access, so the probe is the signal that actually
//! proves statements can run. The same two-stage check backs
//! [`Connection::is_healed`].

use std::num::NonZeroU8;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tracing::Span;

use crate::config::SqliteParameters;
use crate::context::DbContext;
use crate::errors::{DbError, ErrorFormatter};
use crate::logger::LoggerBuilder;
use crate::pool::{checkout, create_pool, DbPool, DbRuntimeSettings};
use crate::transactions::TxLockMode;

const LOGGER_NAME: &str = "txscope-sqlite";

/// SQLite VM steps between two cancellation checks while probing.
const PROBE_PROGRESS_STEPS: i32 = 8;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How many connection attempts [`Connection::connect`] may make.
///
/// A configured count of `0` means *retry forever*, not "zero attempts".
/// This is a deliberate convention carried by the configuration format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Unlimited,
    Limited(NonZeroU8),
}

impl RetryPolicy {
    pub fn from_count(count: u8) -> Self {
        NonZeroU8::new(count).map_or(Self::Unlimited, Self::Limited)
    }

    /// Upper bound on attempts, `None` when unlimited.
    pub fn max_attempts(self) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::Limited(count) => Some(u32::from(count.get())),
        }
    }

    fn allows(self, attempts_made: u32) -> bool {
        self.max_attempts()
            .map_or(true, |max| attempts_made < max)
    }
}

/// Builds the pool for one connection attempt.
pub trait Opener: Send + Sync {
    /// # Errors
    ///
    /// Returns any error that prevents the pool from being built.
    fn open(&self, params: &dyn SqliteParameters) -> Result<DbPool, DbError>;
}

impl<F> Opener for F
where
    F: Fn(&dyn SqliteParameters) -> Result<DbPool, DbError> + Send + Sync,
{
    fn open(&self, params: &dyn SqliteParameters) -> Result<DbPool, DbError> {
        self(params)
    }
}

/// Opens the configured file through [`create_pool`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolOpener;

impl Opener for PoolOpener {
    fn open(&self, params: &dyn SqliteParameters) -> Result<DbPool, DbError> {
        create_pool(
            params.sqlite_file_path(),
            DbRuntimeSettings::from_params(params),
        )
    }
}

/// Waits between two connection attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

impl<F> Sleeper for F
where
    F: Fn(Duration) + Send + Sync,
{
    fn sleep(&self, delay: Duration) {
        self(delay)
    }
}

/// Blocks the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// One managed SQLite handle.
///
/// Created once at startup with [`Connection::new`] and connected with
/// [`Connection::connect`], or wrapped around a pre-built pool with
/// [`Connection::with_pool`]. The pool is `None` until a connect attempt
/// passes both ping and probe.
pub struct Connection {
    span: Span,
    errors: Arc<dyn ErrorFormatter>,
    config: Option<Arc<dyn SqliteParameters>>,
    opener: Box<dyn Opener>,
    sleeper: Box<dyn Sleeper>,
    connect_timeout: Duration,
    tx_lock: TxLockMode,
    pool: Option<DbPool>,
}

impl Connection {
    /// Creates an unconnected manager reading its parameters from `config`.
    pub fn new(
        logs: &dyn LoggerBuilder,
        errors: Arc<dyn ErrorFormatter>,
        config: Arc<dyn SqliteParameters>,
    ) -> Self {
        let span = logs.named_entry_with_fields(
            LOGGER_NAME,
            &[
                ("db", config.db_name().to_string()),
                ("path", config.sqlite_file_path().to_string()),
            ],
        );

        Self {
            span,
            errors,
            connect_timeout: config.connect_timeout(),
            tx_lock: config.tx_lock_mode(),
            config: Some(config),
            opener: Box::new(PoolOpener),
            sleeper: Box::new(ThreadSleeper),
            pool: None,
        }
    }

    /// Wraps an externally built pool. The result has no configuration, so
    /// [`Connection::connect`] is unavailable on it.
    pub fn with_pool(
        pool: DbPool,
        logs: &dyn LoggerBuilder,
        errors: Arc<dyn ErrorFormatter>,
    ) -> Self {
        Self {
            span: logs.named_entry(LOGGER_NAME),
            errors,
            config: None,
            opener: Box::new(PoolOpener),
            sleeper: Box::new(ThreadSleeper),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tx_lock: TxLockMode::default(),
            pool: Some(pool),
        }
    }

    /// Replaces the pool factory used by [`Connection::connect`].
    pub fn with_opener(mut self, opener: impl Opener + 'static) -> Self {
        self.opener = Box::new(opener);
        self
    }

    /// Replaces the wait between connection attempts.
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// Overrides the `BEGIN` flavour for transactions opened through this handle.
    pub fn with_tx_lock(mut self, tx_lock: TxLockMode) -> Self {
        self.tx_lock = tx_lock;
        self
    }

    /// Establishes the handle, retrying according to the configured
    /// [`RetryPolicy`] and pausing the configured delay between attempts.
    ///
    /// Returns as soon as one attempt succeeds.
    ///
    /// # Errors
    ///
    /// Returns `DbError::MissingConfig` when built with [`Connection::with_pool`],
    /// or `DbError::RetriesExhausted` carrying the last attempt's error once
    /// every permitted attempt has failed.
    pub fn connect(&mut self) -> Result<(), DbError> {
        let Some(config) = self.config.clone() else {
            return Err(self.errors.wrap(DbError::MissingConfig, &["connect"]));
        };

        let policy = RetryPolicy::from_count(config.connection_retry_count());
        let delay = config.connection_retry_timeout();
        let mut attempts: u32 = 0;
        let mut last_error = None;

        while policy.allows(attempts) {
            if attempts > 0 {
                self.sleeper.sleep(delay);
            }
            attempts = attempts.saturating_add(1);

            match self.try_connect(config.as_ref()) {
                Ok(pool) => {
                    self.span.in_scope(|| {
                        tracing::info!(
                            attempt = attempts,
                            path = config.sqlite_file_path(),
                            "connected to sqlite database"
                        )
                    });
                    self.pool = Some(pool);
                    return Ok(());
                }
                Err(err) => {
                    self.span.in_scope(|| {
                        tracing::error!(
                            error = %err,
                            attempt = attempts,
                            max_attempts = ?policy.max_attempts(),
                            "unable to connect to database"
                        )
                    });
                    last_error = Some(err);
                }
            }
        }

        let source = last_error.unwrap_or(DbError::NotConnected);
        Err(self.errors.wrap(
            DbError::RetriesExhausted {
                attempts,
                source: Box::new(source),
            },
            &["connect"],
        ))
    }

    fn try_connect(&self, config: &dyn SqliteParameters) -> Result<DbPool, DbError> {
        let pool = self.opener.open(config)?;
        let conn = pool
            .get_timeout(self.connect_timeout)
            .map_err(|err| self.errors.wrap(err.into(), &["checkout connection"]))?;

        ping(&conn).map_err(|err| self.errors.wrap(err, &["ping"]))?;
        probe(&conn).map_err(|err| self.errors.wrap(err, &["probe"]))?;

        drop(conn);
        Ok(pool)
    }

    /// Reports whether the handle answers both the ping and the probe within
    /// the context's deadline. Any failure, including a cancelled or expired
    /// context, yields `false`.
    pub fn is_healed(&self, ctx: &DbContext) -> bool {
        match self.check_health(ctx) {
            Ok(()) => true,
            Err(err) => {
                self.span
                    .in_scope(|| tracing::debug!(error = %err, "health check failed"));
                false
            }
        }
    }

    fn check_health(&self, ctx: &DbContext) -> Result<(), DbError> {
        ctx.check()?;
        let pool = self.pool()?;

        let conn = checkout(pool, ctx, self.connect_timeout)?;

        interruptible(&conn, ctx, |conn| {
            ping(conn)?;
            probe(conn)
        })?;
        ctx.check()?;
        Ok(())
    }

    /// Releases the handle.
    ///
    /// Connections still held by open transactions are closed when those
    /// transactions finish.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NotConnected` if there is no handle, including on a
    /// second call.
    pub fn close(&mut self) -> Result<(), DbError> {
        let Some(pool) = self.pool.take() else {
            return Err(self.errors.wrap(DbError::NotConnected, &["close"]));
        };

        let state = pool.state();
        let in_use = state.connections.saturating_sub(state.idle_connections);
        if in_use > 0 {
            self.span.in_scope(|| {
                tracing::warn!(in_use, "closing database while connections are checked out")
            });
        }
        drop(pool);

        self.span
            .in_scope(|| tracing::info!("sqlite database closed"));
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_some()
    }

    /// The live pool.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NotConnected` before a successful connect or after close.
    pub fn pool(&self) -> Result<&DbPool, DbError> {
        self.pool.as_ref().ok_or(DbError::NotConnected)
    }

    pub(crate) fn errors(&self) -> &dyn ErrorFormatter {
        self.errors.as_ref()
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    /// Upper bound on waiting for a pooled connection.
    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub(crate) fn tx_lock(&self) -> TxLockMode {
        self.tx_lock
    }
}

/// Runs `f` with a progress handler installed that aborts the running
/// statement with `SQLITE_INTERRUPT` once `ctx` is cancelled or expires.
fn interruptible<T, F>(
    conn: &rusqlite::Connection,
    ctx: &DbContext,
    f: F,
) -> Result<T, DbError>
where
    F: FnOnce(&rusqlite::Connection) -> Result<T, DbError>,
{
    let done = AssertUnwindSafe(ctx.done_signal());
    conn.progress_handler(PROBE_PROGRESS_STEPS, Some(move || done.is_done()));
    let result = f(conn);
    conn.progress_handler(0, None::<fn() -> bool>);
    result
}

/// Reads the schema cookie, which makes SQLite take a shared lock and read
/// the database header.
fn ping(conn: &rusqlite::Connection) -> Result<(), DbError> {
    let _: i64 = conn.pragma_query_value(None, "schema_version", |row| row.get(0))?;
    Ok(())
}

fn probe(conn: &rusqlite::Connection) -> Result<(), DbError> {
    let value: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
    if value != 1 {
        return Err(DbError::UnexpectedProbe(value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqliteConfig;
    use crate::errors::DefaultErrorFormatter;
    use crate::logger::DefaultLoggerBuilder;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn config(retry_count: u8) -> Arc<SqliteConfig> {
        Arc::new(SqliteConfig {
            file_path: ":memory:".to_string(),
            retry_count,
            retry_timeout_ms: 40,
            connect_timeout_ms: 1_000,
            ..SqliteConfig::default()
        })
    }

    fn manager(retry_count: u8) -> Connection {
        Connection::new(
            &DefaultLoggerBuilder,
            Arc::new(DefaultErrorFormatter),
            config(retry_count),
        )
    }

    /// Opener that fails until its `succeed_on`-th call (1-based); `0` never succeeds.
    fn flaky_opener(calls: Arc<AtomicU32>, succeed_on: u32) -> impl Opener {
        move |params: &dyn SqliteParameters| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if succeed_on != 0 && call >= succeed_on {
                PoolOpener.open(params)
            } else {
                Err(DbError::Message(format!("refused attempt {call}")))
            }
        }
    }

    fn recording_sleeper(sleeps: Arc<Mutex<Vec<Duration>>>) -> impl Sleeper {
        move |delay: Duration| {
            sleeps.lock().expect("sleep log poisoned").push(delay);
        }
    }

    #[derive(Default)]
    struct RecordingLogs {
        entries: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl LoggerBuilder for RecordingLogs {
        fn named_entry(&self, name: &str) -> Span {
            self.named_entry_with_fields(name, &[])
        }

        fn named_entry_with_fields(&self, name: &str, fields: &[(&str, String)]) -> Span {
            let fields = fields
                .iter()
                .map(|(key, value)| ((*key).to_string(), value.clone()))
                .collect();
            self.entries
                .lock()
                .expect("log record poisoned")
                .push((name.to_string(), fields));
            Span::none()
        }
    }

    #[test]
    fn configured_manager_logs_with_database_fields() {
        let logs = RecordingLogs::default();
        let _conn = Connection::new(&logs, Arc::new(DefaultErrorFormatter), config(1));

        let entries = logs.entries.lock().expect("log record poisoned");
        assert_eq!(entries.len(), 1);
        let (name, fields) = &entries[0];
        assert_eq!(name, "txscope-sqlite");
        assert_eq!(
            fields,
            &vec![
                ("db".to_string(), "ca-api-gateway".to_string()),
                ("path".to_string(), ":memory:".to_string()),
            ]
        );
    }

    #[test]
    fn retry_policy_zero_is_unlimited() {
        assert_eq!(RetryPolicy::from_count(0), RetryPolicy::Unlimited);
        assert_eq!(RetryPolicy::from_count(0).max_attempts(), None);
        assert_eq!(RetryPolicy::from_count(3).max_attempts(), Some(3));
        assert!(RetryPolicy::Unlimited.allows(u32::MAX - 1));
        assert!(!RetryPolicy::from_count(2).allows(2));
    }

    #[test]
    fn limited_retries_stop_after_n_attempts() {
        for retry_count in [1u8, 2, 5] {
            let calls = Arc::new(AtomicU32::new(0));
            let sleeps = Arc::new(Mutex::new(Vec::new()));

            let mut conn = manager(retry_count)
                .with_opener(flaky_opener(Arc::clone(&calls), 0))
                .with_sleeper(recording_sleeper(Arc::clone(&sleeps)));

            let err = conn.connect().expect_err("every attempt fails");

            let expected = u32::from(retry_count);
            assert_eq!(calls.load(Ordering::SeqCst), expected);
            match err.root() {
                DbError::RetriesExhausted { attempts, source } => {
                    assert_eq!(*attempts, expected);
                    assert!(source.to_string().contains(&format!("refused attempt {expected}")));
                }
                other => panic!("unexpected error: {other:?}"),
            }

            let sleeps = sleeps.lock().expect("sleep log poisoned");
            assert_eq!(sleeps.len() as u32, expected - 1, "one pause between attempts");
            assert!(sleeps.iter().all(|d| *d == Duration::from_millis(40)));
            assert!(!conn.is_connected());
        }
    }

    #[test]
    fn success_stops_retrying_early() {
        let calls = Arc::new(AtomicU32::new(0));
        let sleeps = Arc::new(Mutex::new(Vec::new()));

        let mut conn = manager(10)
            .with_opener(flaky_opener(Arc::clone(&calls), 3))
            .with_sleeper(recording_sleeper(Arc::clone(&sleeps)));

        conn.connect().expect("third attempt succeeds");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeps.lock().expect("sleep log poisoned").len(), 2);
        assert!(conn.is_connected());
    }

    #[test]
    fn zero_retry_count_keeps_trying_until_success() {
        for succeed_on in [1u32, 2, 7, 300] {
            let calls = Arc::new(AtomicU32::new(0));
            let sleeps = Arc::new(Mutex::new(Vec::new()));

            let mut conn = manager(0)
                .with_opener(flaky_opener(Arc::clone(&calls), succeed_on))
                .with_sleeper(recording_sleeper(Arc::clone(&sleeps)));

            conn.connect().expect("unlimited retries eventually succeed");

            assert_eq!(calls.load(Ordering::SeqCst), succeed_on);
            assert_eq!(
                sleeps.lock().expect("sleep log poisoned").len() as u32,
                succeed_on - 1
            );
        }
    }

    #[test]
    fn connect_without_config_attempts_nothing() {
        let pool = create_pool(":memory:", DbRuntimeSettings::default()).expect("pool");
        let calls = Arc::new(AtomicU32::new(0));

        let mut conn = Connection::with_pool(
            pool,
            &DefaultLoggerBuilder,
            Arc::new(DefaultErrorFormatter),
        )
        .with_opener(flaky_opener(Arc::clone(&calls), 1));

        let err = conn.connect().expect_err("no config to connect with");
        assert!(matches!(err.root(), DbError::MissingConfig));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(conn.is_connected(), "injected pool is kept");
    }

    #[test]
    fn health_check_requires_a_live_context() {
        let mut conn = manager(1);
        assert!(!conn.is_healed(&DbContext::background()), "not connected yet");

        conn.connect().expect("in-memory connect succeeds");
        assert!(conn.is_healed(&DbContext::background()));

        let (ctx, token) = DbContext::background().with_cancel();
        token.cancel();
        assert!(!conn.is_healed(&ctx));

        let expired = DbContext::background().with_timeout(Duration::ZERO);
        assert!(!conn.is_healed(&expired));
    }

    const SLOW_COUNT: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 500000000) SELECT count(*) FROM c";

    fn is_interrupted(err: &DbError) -> bool {
        matches!(
            err,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::OperationInterrupted
        )
    }

    fn slow_count(db: &rusqlite::Connection) -> Result<i64, DbError> {
        Ok(db.query_row(SLOW_COUNT, [], |row| row.get(0))?)
    }

    #[test]
    fn ping_runs_a_real_statement() {
        let db = rusqlite::Connection::open_in_memory().expect("should open in-memory db");
        ping(&db).expect("schema cookie is readable");

        db.authorizer(Some(|ctx: rusqlite::hooks::AuthContext<'_>| match ctx.action {
            rusqlite::hooks::AuthAction::Pragma { .. } => rusqlite::hooks::Authorization::Deny,
            _ => rusqlite::hooks::Authorization::Allow,
        }));
        let err = ping(&db).expect_err("schema read is refused");
        assert!(matches!(err, DbError::Sqlite(_)), "unexpected error: {err:?}");
    }

    #[test]
    fn running_statement_is_interrupted_at_deadline() {
        let db = rusqlite::Connection::open_in_memory().expect("should open in-memory db");
        let ctx = DbContext::background().with_timeout(Duration::from_millis(60));

        let started = std::time::Instant::now();
        let err = interruptible(&db, &ctx, slow_count).expect_err("deadline hits mid-query");

        assert!(is_interrupted(&err), "unexpected error: {err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn running_statement_is_interrupted_on_cancel() {
        let db = rusqlite::Connection::open_in_memory().expect("should open in-memory db");
        let (ctx, token) = DbContext::background().with_cancel();

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            token.cancel();
        });

        let started = std::time::Instant::now();
        let err = interruptible(&db, &ctx, slow_count).expect_err("cancelled mid-query");
        canceller.join().expect("canceller thread panicked");

        assert!(is_interrupted(&err), "unexpected error: {err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));

        let one: i64 = db
            .query_row("SELECT 1", [], |row| row.get(0))
            .expect("handler is removed once the call returns");
        assert_eq!(one, 1);
    }

    #[test]
    fn close_twice_reports_not_connected() {
        let mut conn = manager(1);
        conn.connect().expect("in-memory connect succeeds");

        conn.close().expect("first close succeeds");
        assert!(!conn.is_connected());

        let err = conn.close().expect_err("second close has nothing to close");
        assert!(matches!(err.root(), DbError::NotConnected));
    }
}

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tempfile::TempDir;
use txscope_db::{
    create_pool, Connection, DbPool, DbRuntimeSettings, DefaultErrorFormatter,
    DefaultLoggerBuilder,
};

pub const SCHEMA: &str = "CREATE TABLE accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    balance INTEGER NOT NULL DEFAULT 0
);";

/// Counts transaction terminations observed by SQLite itself.
#[derive(Clone, Default)]
pub struct Hooks {
    pub commits: Arc<AtomicUsize>,
    pub rollbacks: Arc<AtomicUsize>,
}

impl Hooks {
    pub fn snapshot(&self) -> (usize, usize) {
        (
            self.commits.load(Ordering::SeqCst),
            self.rollbacks.load(Ordering::SeqCst),
        )
    }
}

pub struct TestDb {
    pub dir: TempDir,
    pub conn: Connection,
    pub hooks: Hooks,
}

impl TestDb {
    pub fn path(&self) -> String {
        self.dir
            .path()
            .join("txscope.db")
            .to_str()
            .expect("utf-8 temp path")
            .to_string()
    }

    pub fn pool(&self) -> &DbPool {
        self.conn.pool().expect("test db is connected")
    }

    pub fn owners(&self) -> Vec<String> {
        let conn = self.pool().get().expect("should get a connection");
        let mut stmt = conn
            .prepare("SELECT owner FROM accounts ORDER BY id")
            .expect("should prepare");
        let owners = stmt
            .query_map([], |row| row.get(0))
            .expect("should query")
            .collect::<Result<Vec<String>, _>>()
            .expect("should read rows");
        owners
    }
}

/// File-backed database with the `accounts` table, served by a single pooled
/// connection that reports commits and rollbacks to [`Hooks`].
pub fn hooked_db() -> TestDb {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("txscope.db");
    let hooks = Hooks::default();

    let init_hooks = hooks.clone();
    let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
        conn.execute_batch("PRAGMA busy_timeout = 2000;")?;
        let commits = Arc::clone(&init_hooks.commits);
        conn.commit_hook(Some(move || {
            commits.fetch_add(1, Ordering::SeqCst);
            false
        }));
        let rollbacks = Arc::clone(&init_hooks.rollbacks);
        conn.rollback_hook(Some(move || {
            rollbacks.fetch_add(1, Ordering::SeqCst);
        }));
        Ok(())
    });

    let pool = Pool::builder()
        .max_size(1)
        .connection_timeout(Duration::from_secs(2))
        .build(manager)
        .expect("pool creation should succeed");
    pool.get()
        .expect("should get a connection")
        .execute_batch(SCHEMA)
        .expect("schema should apply");

    let conn = Connection::with_pool(
        pool,
        &DefaultLoggerBuilder,
        Arc::new(DefaultErrorFormatter),
    );

    TestDb { dir, conn, hooks }
}

/// File-backed database built through [`create_pool`] with several connections.
pub fn pooled_db() -> TestDb {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("txscope.db");

    let pool = create_pool(
        path.to_str().expect("utf-8 temp path"),
        DbRuntimeSettings {
            pool_max_size: 4,
            connection_timeout_ms: 2_000,
            ..DbRuntimeSettings::default()
        },
    )
    .expect("pool creation should succeed");
    pool.get()
        .expect("should get a connection")
        .execute_batch(SCHEMA)
        .expect("schema should apply");

    let conn = Connection::with_pool(
        pool,
        &DefaultLoggerBuilder,
        Arc::new(DefaultErrorFormatter),
    );

    TestDb {
        dir,
        conn,
        hooks: Hooks::default(),
    }
}

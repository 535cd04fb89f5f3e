//! Transactions and context-scoped transaction propagation.
//!
//! A [`Transaction`] owns one pooled connection from `BEGIN` until exactly one
//! of commit or rollback. The helpers on [`Connection`] either start a
//! transaction and attach it to a derived [`DbContext`], or discover the one
//! already attached higher up the call chain and run statements against it.
//!
//! ```rust,ignore
//! conn.begin_read_committed_tx_rollback_on_error(&ctx, |tx_ctx| {
//!     conn.must_with_transaction(tx_ctx, |db| {
//!         db.execute("INSERT INTO audit (action) VALUES (?1)", ["login"])?;
//!         Ok(())
//!     })?;
//!     // Joins the same transaction instead of opening a nested one.
//!     record_session(&conn, tx_ctx)
//! })?;
//! ```

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use serde::Deserialize;
use tracing::Span;

use crate::connection::Connection;
use crate::context::DbContext;
use crate::errors::DbError;
use crate::pool::{checkout, PooledConn};

const ENABLE_READ_UNCOMMITTED: &str = "PRAGMA read_uncommitted = ON;";
const DISABLE_READ_UNCOMMITTED: &str = "PRAGMA read_uncommitted = OFF;";

/// Locking flavour used when a transaction begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxLockMode {
    /// Locks are taken lazily on first read or write.
    Deferred,
    /// The write lock is taken at `BEGIN`.
    #[default]
    Immediate,
    /// Readers and writers are locked out at `BEGIN`.
    Exclusive,
}

impl TxLockMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deferred => "deferred",
            Self::Immediate => "immediate",
            Self::Exclusive => "exclusive",
        }
    }

    fn begin_sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Isolation requested for a transaction.
///
/// SQLite transactions are serializable; `ReadUncommitted` additionally sets
/// `PRAGMA read_uncommitted` on the transaction's connection for its lifetime,
/// which relaxes reads against shared-cache tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Default,
    ReadCommitted,
    ReadUncommitted,
}

/// Lifecycle of a [`Transaction`]. Only one terminal transition is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        })
    }
}

struct TxInner {
    conn: Option<PooledConn>,
    state: TxState,
}

/// One open transaction.
///
/// Statement callbacks may re-enter the same transaction from the same thread
/// (a repository function joining the caller's transaction), but the handle is
/// meant for a single call chain; sharing it between concurrent call chains is
/// a caller error. Dropping a still-active transaction rolls it back.
pub struct Transaction {
    inner: ReentrantMutex<RefCell<TxInner>>,
    isolation: IsolationLevel,
    span: Span,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.peek_state();
        f.debug_struct("Transaction")
            .field("isolation", &self.isolation)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn begin(
        conn: PooledConn,
        isolation: IsolationLevel,
        lock: TxLockMode,
        span: Span,
    ) -> Result<Self, DbError> {
        if isolation == IsolationLevel::ReadUncommitted {
            conn.execute_batch(ENABLE_READ_UNCOMMITTED)?;
        }

        if let Err(err) = conn.execute_batch(lock.begin_sql()) {
            if isolation == IsolationLevel::ReadUncommitted {
                reset_read_uncommitted(&conn, &span);
            }
            return Err(err.into());
        }

        Ok(Self {
            inner: ReentrantMutex::new(RefCell::new(TxInner {
                conn: Some(conn),
                state: TxState::Active,
            })),
            isolation,
            span,
        })
    }

    fn peek_state(&self) -> Option<TxState> {
        let guard = self.inner.try_lock()?;
        let state = guard.try_borrow().ok().map(|inner| inner.state);
        state
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxState {
        let guard = self.inner.lock();
        let state = match guard.try_borrow() {
            Ok(inner) => inner.state,
            // Borrowed mutably only while finishing, which happens under this lock.
            Err(_) => TxState::Active,
        };
        state
    }

    /// Runs `f` against the transaction's connection.
    ///
    /// # Errors
    ///
    /// Returns `DbError::TransactionFinished` once the transaction has been
    /// committed or rolled back, otherwise whatever `f` returns.
    pub fn with_connection<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, DbError>,
    {
        let guard = self.inner.lock();
        let inner = guard.try_borrow().map_err(|_| DbError::TransactionInUse)?;
        match (inner.state, inner.conn.as_ref()) {
            (TxState::Active, Some(conn)) => f(&**conn),
            (state, _) => Err(DbError::TransactionFinished(state)),
        }
    }

    /// Commits the transaction.
    ///
    /// A failed `COMMIT` leaves the transaction rolled back.
    ///
    /// # Errors
    ///
    /// Returns the driver error, `DbError::TransactionFinished` if already
    /// terminated, or `DbError::TransactionInUse` if called from inside one of
    /// this transaction's own statement callbacks.
    pub fn commit(&self) -> Result<(), DbError> {
        self.finish(TxState::Committed)
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Transaction::commit`].
    pub fn rollback(&self) -> Result<(), DbError> {
        self.finish(TxState::RolledBack)
    }

    fn finish(&self, target: TxState) -> Result<(), DbError> {
        let guard = self.inner.lock();
        let mut inner = guard
            .try_borrow_mut()
            .map_err(|_| DbError::TransactionInUse)?;

        if inner.state != TxState::Active {
            return Err(DbError::TransactionFinished(inner.state));
        }
        let Some(conn) = inner.conn.take() else {
            return Err(DbError::TransactionFinished(inner.state));
        };

        let sql = match target {
            TxState::Committed => "COMMIT",
            _ => "ROLLBACK",
        };
        let result = conn.execute_batch(sql);

        if result.is_err() && !conn.is_autocommit() {
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                self.span.in_scope(|| {
                    tracing::warn!(error = %err, "unable to release failed transaction")
                });
            }
        }
        self.release(&conn);

        inner.state = if result.is_ok() {
            target
        } else {
            TxState::RolledBack
        };

        result.map_err(DbError::from)
    }

    fn release(&self, conn: &rusqlite::Connection) {
        if self.isolation == IsolationLevel::ReadUncommitted {
            reset_read_uncommitted(conn, &self.span);
        }
    }
}

fn reset_read_uncommitted(conn: &rusqlite::Connection, span: &Span) {
    if let Err(err) = conn.execute_batch(DISABLE_READ_UNCOMMITTED) {
        span.in_scope(|| tracing::warn!(error = %err, "unable to reset read_uncommitted"));
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().get_mut();
        if inner.state != TxState::Active {
            return;
        }
        inner.state = TxState::RolledBack;

        if let Some(conn) = inner.conn.take() {
            self.span
                .in_scope(|| tracing::debug!("rolling back transaction dropped while active"));
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                self.span.in_scope(|| {
                    tracing::warn!(error = %err, "unable to rollback dropped transaction")
                });
            }
            if self.isolation == IsolationLevel::ReadUncommitted {
                reset_read_uncommitted(&conn, &self.span);
            }
        }
    }
}

impl Connection {
    /// Opens a transaction with the default isolation level. The handle is not
    /// attached to any context; the caller commits or rolls it back.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NotConnected`, a pool error, or the driver error from `BEGIN`.
    pub fn begin_tx(&self) -> Result<Transaction, DbError> {
        self.open_tx(&DbContext::background(), IsolationLevel::Default)
            .map_err(|err| self.errors().wrap(err, &["begin transaction"]))
    }

    /// Runs `callback` inside a read-committed transaction and hands back its
    /// error untouched by the formatter.
    ///
    /// # Errors
    ///
    /// See [`Connection::begin_read_committed_tx_rollback_on_error`].
    pub fn begin_tx_with_rollback_on_error<T, F>(
        &self,
        ctx: &DbContext,
        callback: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(&DbContext) -> Result<T, DbError>,
    {
        self.begin_read_committed_tx_rollback_on_error(ctx, callback)
            .map_err(|err| self.errors().no_wrap(err))
    }

    /// Opens a transaction, attaches it to a context derived from `ctx`, and
    /// runs `callback` with that context.
    ///
    /// On `Ok` the transaction is committed. On `Err` it is rolled back; if the
    /// rollback itself fails, the rollback error is returned instead of the
    /// callback's, since the transaction's state is then unknown.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AlreadyInTransaction` if `ctx` already carries an
    /// active transaction, the begin/commit/rollback error, or the callback error.
    pub fn begin_read_committed_tx_rollback_on_error<T, F>(
        &self,
        ctx: &DbContext,
        callback: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(&DbContext) -> Result<T, DbError>,
    {
        self.run_rollback_on_error(ctx, IsolationLevel::ReadCommitted, callback)
    }

    /// Same contract as [`Connection::begin_read_committed_tx_rollback_on_error`]
    /// with read-uncommitted isolation. Rollback failures are logged before
    /// they are returned.
    ///
    /// # Errors
    ///
    /// As for the read-committed variant, plus `DbError::Done` if `ctx` is
    /// already cancelled or expired when the transaction would begin.
    pub fn begin_read_uncommitted_tx_rollback_on_error<T, F>(
        &self,
        ctx: &DbContext,
        callback: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(&DbContext) -> Result<T, DbError>,
    {
        self.run_rollback_on_error(ctx, IsolationLevel::ReadUncommitted, callback)
    }

    fn run_rollback_on_error<T, F>(
        &self,
        ctx: &DbContext,
        isolation: IsolationLevel,
        callback: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(&DbContext) -> Result<T, DbError>,
    {
        let tx = self
            .open_tx(ctx, isolation)
            .map_err(|err| self.errors().wrap(err, &["begin transaction"]))?;
        let tx = Arc::new(tx);
        let tx_ctx = ctx
            .with_transaction(Arc::clone(&tx))
            .map_err(|err| self.errors().wrap(err, &[]))?;

        match callback(&tx_ctx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|err| self.errors().wrap(err, &["commit transaction"]))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    if isolation == IsolationLevel::ReadUncommitted {
                        self.span().in_scope(|| {
                            tracing::warn!(
                                error = %rollback_err,
                                cause = %err,
                                "unable to rollback transaction, probably tx in pending status"
                            )
                        });
                    }
                    return Err(self.errors().wrap(rollback_err, &["rollback transaction"]));
                }

                Err(self.errors().wrap(err, &[]))
            }
        }
    }

    /// Opens a transaction and returns a context carrying it. Finish it with
    /// [`Connection::commit_contextual_tx_statement`] or
    /// [`Connection::rollback_contextual_tx_statement`] on the returned context.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AlreadyInTransaction` if `ctx` already carries an
    /// active transaction, or the begin error.
    pub fn begin_contextual_tx_statement(&self, ctx: &DbContext) -> Result<DbContext, DbError> {
        let tx = self
            .open_tx(ctx, IsolationLevel::Default)
            .map_err(|err| self.errors().wrap(err, &["begin contextual transaction"]))?;

        ctx.with_transaction(Arc::new(tx))
            .map_err(|err| self.errors().wrap(err, &[]))
    }

    /// Commits the transaction carried by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NotInContextualTx` if `ctx` carries no transaction,
    /// or the commit error.
    pub fn commit_contextual_tx_statement(&self, ctx: &DbContext) -> Result<(), DbError> {
        let Some(tx) = ctx.transaction() else {
            return Err(self.errors().wrap(DbError::NotInContextualTx, &[]));
        };

        tx.commit()
            .map_err(|err| self.errors().wrap(err, &["commit contextual transaction"]))
    }

    /// Rolls back the transaction carried by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NotInContextualTx` if `ctx` carries no transaction,
    /// or the rollback error.
    pub fn rollback_contextual_tx_statement(&self, ctx: &DbContext) -> Result<(), DbError> {
        let Some(tx) = ctx.transaction() else {
            return Err(self.errors().wrap(DbError::NotInContextualTx, &[]));
        };

        tx.rollback()
            .map_err(|err| self.errors().wrap(err, &["rollback contextual transaction"]))
    }

    /// Runs `f` inside the context's transaction if there is one, otherwise on
    /// a connection checked out from the pool.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, `DbError::TransactionFinished` if the
    /// context's transaction is already terminated, or a checkout error.
    pub fn try_with_transaction<T, F>(&self, ctx: &DbContext, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, DbError>,
    {
        if let Some(tx) = ctx.transaction() {
            return tx.with_connection(f);
        }

        let conn = self
            .pool()
            .and_then(|pool| checkout(pool, ctx, self.connect_timeout()))
            .map_err(|err| self.errors().wrap(err, &["checkout connection"]))?;

        f(&*conn)
    }

    /// Runs `f` inside the context's transaction. Nothing touches the database
    /// when the context carries none.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NoTransactionInContext` without a transaction, or
    /// whatever `f` returns.
    pub fn must_with_transaction<T, F>(&self, ctx: &DbContext, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, DbError>,
    {
        match ctx.transaction() {
            Some(tx) => tx.with_connection(f),
            None => Err(self.errors().wrap(DbError::NoTransactionInContext, &[])),
        }
    }

    fn open_tx(&self, ctx: &DbContext, isolation: IsolationLevel) -> Result<Transaction, DbError> {
        if ctx.in_transaction() {
            return Err(DbError::AlreadyInTransaction);
        }
        ctx.check()?;

        let conn = checkout(self.pool()?, ctx, self.connect_timeout())?;
        ctx.check()?;

        Transaction::begin(conn, isolation, self.tx_lock(), self.span().clone())
    }
}

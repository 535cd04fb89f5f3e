//! Request-scoped context carrying cancellation, a deadline and at most one
//! active transaction.
//!
//! A [`DbContext`] is threaded explicitly through call signatures. Deriving a
//! context (with a timeout, or with a transaction attached) never mutates the
//! parent: the transaction handle is only visible from the derived value and
//! its own descendants. Cancelling a context cancels every context derived
//! from it, but never its parent.
//!
//! # Invariant
//!
//! At most one *active* transaction is reachable from a context chain.
//! [`DbContext::with_transaction`] refuses to attach a second one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::errors::DbError;
use crate::transactions::{Transaction, TxState};

/// Why a context is no longer usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Request-scoped context for database calls.
#[derive(Debug, Clone, Default)]
pub struct DbContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    tx: Option<Arc<Transaction>>,
}

impl DbContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that expires after `timeout`. A timeout too large to
    /// represent as an `Instant` leaves the parent's deadline in place.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => Self {
                cancel: self.cancel.child_token(),
                deadline: self.deadline,
                tx: self.tx.clone(),
            },
        }
    }

    /// Derives a context that expires at `deadline`, or at the parent's
    /// deadline if that comes first.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };

        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
            tx: self.tx.clone(),
        }
    }

    /// Derives a cancellable context. Cancelling the returned token cancels
    /// the new context and everything derived from it.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let child = Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            tx: self.tx.clone(),
        };
        let token = child.cancel.clone();
        (child, token)
    }

    /// Cancels this context and all contexts derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Fails with the reason the context is done.
    pub fn check(&self) -> Result<(), ContextError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The transaction attached to this context chain, if any.
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.tx.as_ref()
    }

    /// Whether an attached transaction is still active.
    pub fn in_transaction(&self) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.state() == TxState::Active)
    }

    /// Derives a context carrying `tx`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AlreadyInTransaction` if this context already
    /// carries an active transaction.
    pub fn with_transaction(&self, tx: Arc<Transaction>) -> Result<Self, DbError> {
        if self.in_transaction() {
            return Err(DbError::AlreadyInTransaction);
        }

        Ok(Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            tx: Some(tx),
        })
    }

    /// A detached view of the cancellation state, for use inside driver
    /// callbacks that must not hold the transaction handle.
    pub(crate) fn done_signal(&self) -> DoneSignal {
        DoneSignal {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
        }
    }
}

pub(crate) struct DoneSignal {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl DoneSignal {
    pub(crate) fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

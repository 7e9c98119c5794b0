//! Transaction error types.

use std::fmt;

use thiserror::Error;

use crate::db::DriverError;
use crate::transaction::context::TransactionState;
use crate::transaction::hooks::HookEvent;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Steps of the begin sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    SetIsolationLevel,
    Begin,
    DisableAutocommit,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupStep::SetIsolationLevel => write!(f, "set isolation level"),
            SetupStep::Begin => write!(f, "begin"),
            SetupStep::DisableAutocommit => write!(f, "disable autocommit"),
        }
    }
}

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The pool could not hand out a connection; no transaction exists.
    #[error("could not acquire connection: {0}")]
    ConnectionAcquisition(#[source] DriverError),

    /// A step of the begin sequence failed; the connection went back to the pool.
    #[error("transaction setup failed at {step}: {source}")]
    SetupSequence {
        step: SetupStep,
        #[source]
        source: DriverError,
    },

    /// Commit or rollback on a transaction that is resolved or being resolved.
    #[error("transaction {tx_id} is no longer active (state: {state})")]
    InactiveTransaction {
        tx_id: String,
        state: TransactionState,
    },

    /// An observer vetoed the operation.
    #[error("{event} hook aborted: {reason}")]
    HookAbort { event: HookEvent, reason: String },

    /// The driver rejected a commit, rollback or statement.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The commit failed and so did the rollback attempted in its place.
    #[error("commit failed ({commit}) and fallback rollback failed ({rollback})")]
    CommitRollbackFailed {
        commit: DriverError,
        rollback: DriverError,
    },
}

impl TransactionError {
    /// Check if this error leaves the transaction active when returned from
    /// `commit`/`rollback`, so the caller may retry or roll back.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransactionError::HookAbort { .. }
                | TransactionError::Driver(_)
                | TransactionError::CommitRollbackFailed { .. }
        )
    }

    /// The driver error underneath, if there is one.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            TransactionError::ConnectionAcquisition(e)
            | TransactionError::SetupSequence { source: e, .. }
            | TransactionError::Driver(e) => Some(e),
            TransactionError::CommitRollbackFailed { rollback, .. } => Some(rollback),
            TransactionError::InactiveTransaction { .. } | TransactionError::HookAbort { .. } => {
                None
            }
        }
    }

    pub(crate) fn inactive(tx_id: &str, state: TransactionState) -> Self {
        Self::InactiveTransaction {
            tx_id: tx_id.to_string(),
            state,
        }
    }
}

/// How a successful `commit()` call actually ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The driver commit succeeded.
    Committed,
    /// The driver commit failed and the transaction was rolled back instead.
    /// The call still resolves `Ok` because the rollback succeeded.
    RolledBack { commit_error: DriverError },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }

    /// The swallowed commit error when the fallback rollback ran.
    pub fn commit_error(&self) -> Option<&DriverError> {
        match self {
            CommitOutcome::Committed => None,
            CommitOutcome::RolledBack { commit_error } => Some(commit_error),
        }
    }
}

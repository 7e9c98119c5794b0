//! Transaction handle and lifecycle state machine.
//!
//! A [`Transaction`] is a cheap, cloneable handle; every clone drives the
//! same lifecycle. Leaving `ACTIVE` is a two-phase affair:
//!
//! 1. **claim** - a single check-and-set under the lifecycle lock. Exactly
//!    one of {commit, rollback, timeout} can hold the claim; every other
//!    caller sees `InactiveTransaction`.
//! 2. **finish** or **unclaim** - the claim holder either moves the state to
//!    a terminal value (and releases the connection) or hands the claim back
//!    when a `before` hook vetoes or the driver rollback fails, leaving the
//!    transaction `ACTIVE`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, MappedMutexGuard, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::db::{ConnectionHandle, ConnectionPool, DriverError};
use crate::transaction::error::{CommitOutcome, TransactionError, TransactionResult};
use crate::transaction::hooks::{HookContext, HookEvent, HookRegistry, HookResult};
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::timeout::TimeoutMonitor;

/// Transactions currently tracked by a coordinator, keyed by id.
pub(crate) type ActiveSet = Arc<RwLock<HashMap<String, TransactionMetadata>>>;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Connection acquired, setup sequence not yet complete.
    Init,
    /// Setup complete; work, commit and rollback are allowed.
    Active,
    Committed,
    RolledBack,
    /// Rolled back by the watchdog.
    TimedOut,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::TimedOut
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Init => "INIT",
            TransactionState::Active => "ACTIVE",
            TransactionState::Committed => "COMMITTED",
            TransactionState::RolledBack => "ROLLEDBACK",
            TransactionState::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// Transaction metadata stored in the coordinator.
#[derive(Debug, Clone)]
pub struct TransactionMetadata {
    /// Unique transaction ID.
    pub tx_id: String,
    /// Requested isolation level; `None` means the connection default.
    pub isolation_level: Option<IsolationLevel>,
    /// Id of the connection the transaction holds.
    pub connection_id: usize,
    /// Watchdog duration, if armed.
    pub timeout: Option<Duration>,
    /// When the transaction started.
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Lifecycle {
    state: TransactionState,
    claimed: bool,
    /// The deadline passed while someone else held the claim.
    timeout_pending: bool,
}

struct TransactionInner<P: ConnectionPool> {
    metadata: TransactionMetadata,
    pool: Arc<P>,
    /// `Some` from begin until the terminal state releases it.
    connection: tokio::sync::Mutex<Option<P::Connection>>,
    lifecycle: Mutex<Lifecycle>,
    resolved: watch::Sender<TransactionState>,
    hooks: RwLock<HookRegistry>,
    monitor: Mutex<Option<TimeoutMonitor>>,
    active: ActiveSet,
}

/// A database transaction bound to one pooled connection.
pub struct Transaction<P: ConnectionPool> {
    inner: Arc<TransactionInner<P>>,
}

impl<P: ConnectionPool> Clone for Transaction<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: ConnectionPool> Transaction<P> {
    /// Wrap a connection whose setup sequence already succeeded. The
    /// transaction starts in `INIT`; [`activate`](Self::activate) opens it.
    pub(crate) fn new(
        metadata: TransactionMetadata,
        pool: Arc<P>,
        connection: P::Connection,
        active: ActiveSet,
    ) -> Self {
        let (resolved, _) = watch::channel(TransactionState::Init);
        Self {
            inner: Arc::new(TransactionInner {
                metadata,
                pool,
                connection: tokio::sync::Mutex::new(Some(connection)),
                lifecycle: Mutex::new(Lifecycle {
                    state: TransactionState::Init,
                    claimed: false,
                    timeout_pending: false,
                }),
                resolved,
                hooks: RwLock::new(HookRegistry::new()),
                monitor: Mutex::new(None),
                active,
            }),
        }
    }

    /// Move `INIT -> ACTIVE`, register with the coordinator and arm the
    /// watchdog when a timeout is given.
    pub(crate) fn activate(&self, timeout: Option<Duration>) {
        self.inner.lifecycle.lock().state = TransactionState::Active;
        self.inner.resolved.send_replace(TransactionState::Active);
        self.inner
            .active
            .write()
            .insert(self.id().to_string(), self.inner.metadata.clone());

        if let Some(timeout) = timeout {
            let inner = self.inner.clone();
            let monitor = TimeoutMonitor::arm(timeout, move || inner.expire());
            *self.inner.monitor.lock() = Some(monitor);
        }
    }

    /// Get the transaction ID.
    pub fn id(&self) -> &str {
        &self.inner.metadata.tx_id
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.inner.metadata.isolation_level
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.metadata.started_at
    }

    pub fn metadata(&self) -> &TransactionMetadata {
        &self.inner.metadata
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lifecycle.lock().state
    }

    /// True while the transaction is `ACTIVE` and nobody is resolving it.
    pub fn is_active(&self) -> bool {
        let lifecycle = self.inner.lifecycle.lock();
        lifecycle.state == TransactionState::Active && !lifecycle.claimed
    }

    /// When the watchdog fires, if one is armed and has not been disarmed.
    pub fn timeout_deadline(&self) -> Option<Instant> {
        self.inner.monitor.lock().as_ref().map(TimeoutMonitor::deadline)
    }

    /// Register an observer for a lifecycle event.
    ///
    /// Handlers for the same event run one after another in registration
    /// order. Returning an error from a `before` handler vetoes the step.
    pub fn observe<F, Fut>(&self, event: HookEvent, handler: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.inner.hooks.write().observe(event, handler);
    }

    /// Exclusive access to the held connection for application work.
    ///
    /// The guard must be dropped before calling [`commit`](Self::commit) or
    /// [`rollback`](Self::rollback), which lock the same connection.
    pub async fn connection(&self) -> TransactionResult<MappedMutexGuard<'_, P::Connection>> {
        let state = self.state();
        if state != TransactionState::Active {
            return Err(TransactionError::inactive(self.id(), state));
        }
        let guard = self.inner.connection.lock().await;
        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| TransactionError::inactive(self.id(), self.state()))
    }

    /// Execute a statement on the held connection.
    pub async fn execute(&self, statement: &str) -> TransactionResult<()> {
        let mut connection = self.connection().await?;
        connection.execute(statement).await?;
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// A failed driver commit is not surfaced directly: the transaction is
    /// rolled back on the same connection instead and the call resolves
    /// with [`CommitOutcome::RolledBack`], carrying the commit error.
    pub async fn commit(&self) -> TransactionResult<CommitOutcome> {
        debug!(tx_id = %self.id(), "commit");
        let inner = &self.inner;
        inner.claim()?;

        if let Err(e) = inner.dispatch(HookEvent::BeforeCommit).await {
            inner.unclaim();
            return Err(e);
        }

        let committed = {
            let mut connection = inner.connection.lock().await;
            match connection.as_mut() {
                Some(conn) => conn.commit().await,
                None => Err(DriverError::ConnectionClosed),
            }
        };

        match committed {
            Ok(()) => {
                inner
                    .finish(TransactionState::Committed, HookEvent::AfterCommit)
                    .await?;
                Ok(CommitOutcome::Committed)
            }
            Err(commit_error) => {
                warn!(
                    tx_id = %self.id(),
                    error = %commit_error,
                    "commit failed, rolling back"
                );
                match inner.rollback_claimed(TransactionState::RolledBack).await {
                    Ok(()) => Ok(CommitOutcome::RolledBack { commit_error }),
                    Err(TransactionError::Driver(rollback)) => {
                        Err(TransactionError::CommitRollbackFailed {
                            commit: commit_error,
                            rollback,
                        })
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Roll the transaction back. A failed driver rollback leaves the
    /// transaction `ACTIVE`; it is not retried.
    pub async fn rollback(&self) -> TransactionResult<()> {
        debug!(tx_id = %self.id(), "rollback");
        self.inner.claim()?;
        self.inner
            .rollback_claimed(TransactionState::RolledBack)
            .await
    }

    /// Wait until the transaction reaches a terminal state.
    pub async fn wait_resolved(&self) -> TransactionState {
        let mut resolved = self.inner.resolved.subscribe();
        if let Ok(state) = resolved.wait_for(TransactionState::is_terminal).await {
            return *state;
        }
        self.state()
    }
}

impl<P: ConnectionPool> fmt::Debug for Transaction<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("isolation_level", &self.isolation_level())
            .finish()
    }
}

impl<P: ConnectionPool> TransactionInner<P> {
    /// Take the exclusive right to move this transaction out of `ACTIVE`.
    fn claim(&self) -> TransactionResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != TransactionState::Active || lifecycle.claimed {
            return Err(TransactionError::inactive(
                &self.metadata.tx_id,
                lifecycle.state,
            ));
        }
        lifecycle.claimed = true;
        Ok(())
    }

    /// Hand the claim back, leaving the transaction `ACTIVE`. A deadline
    /// that passed in the meantime is honoured now.
    fn unclaim(self: &Arc<Self>) {
        let overdue = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.claimed = false;
            std::mem::take(&mut lifecycle.timeout_pending)
        };
        if overdue {
            debug!(tx_id = %self.metadata.tx_id, "deadline passed while claimed, expiring now");
            tokio::spawn(self.clone().expire());
        }
    }

    /// Claim on behalf of the watchdog. When a commit or rollback holds the
    /// claim, the expiry is deferred to its `unclaim`.
    fn claim_for_timeout(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != TransactionState::Active {
            return false;
        }
        if lifecycle.claimed {
            lifecycle.timeout_pending = true;
            return false;
        }
        lifecycle.claimed = true;
        true
    }

    fn hook_context(&self, event: HookEvent) -> HookContext {
        HookContext {
            tx_id: self.metadata.tx_id.clone(),
            event,
            isolation_level: self.metadata.isolation_level,
        }
    }

    async fn dispatch(&self, event: HookEvent) -> TransactionResult<()> {
        let chain = self.hooks.read().snapshot(event);
        chain.run(self.hook_context(event)).await.map_err(|e| {
            warn!(tx_id = %self.metadata.tx_id, %event, reason = %e, "hook aborted");
            TransactionError::HookAbort {
                event,
                reason: e.reason,
            }
        })
    }

    /// Rollback path shared by explicit rollback, commit fallback and
    /// timeout. The caller must hold the claim.
    async fn rollback_claimed(self: &Arc<Self>, terminal: TransactionState) -> TransactionResult<()> {
        if let Err(e) = self.dispatch(HookEvent::BeforeRollback).await {
            self.unclaim();
            return Err(e);
        }

        let rolled_back = {
            let mut connection = self.connection.lock().await;
            match connection.as_mut() {
                Some(conn) => conn.rollback().await,
                None => Err(DriverError::ConnectionClosed),
            }
        };

        if let Err(e) = rolled_back {
            warn!(tx_id = %self.metadata.tx_id, error = %e, "rollback failed");
            self.unclaim();
            return Err(TransactionError::Driver(e));
        }

        self.finish(terminal, HookEvent::AfterRollback).await
    }

    /// Enter a terminal state: disarm the watchdog, run the `after` hooks,
    /// give the connection back and wake anyone waiting on resolution.
    ///
    /// The connection is released even when an `after` hook fails; the
    /// hook error is still returned.
    async fn finish(&self, terminal: TransactionState, after: HookEvent) -> TransactionResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = terminal;
            lifecycle.claimed = false;
            lifecycle.timeout_pending = false;
            if let Some(monitor) = self.monitor.lock().take() {
                monitor.disarm();
            }
        }
        self.active.write().remove(&self.metadata.tx_id);
        debug!(tx_id = %self.metadata.tx_id, state = %terminal, "transaction resolved");

        let hooks = self.dispatch(after).await;

        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            self.pool.release(connection).await;
        }

        self.resolved.send_replace(terminal);
        hooks
    }

    /// Watchdog expiry. Does nothing once the transaction is resolved.
    async fn expire(self: Arc<Self>) {
        if !self.claim_for_timeout() {
            return;
        }
        self.monitor.lock().take();
        info!(
            tx_id = %self.metadata.tx_id,
            timeout = ?self.metadata.timeout,
            "transaction timed out, rolling back"
        );

        if let Err(e) = self.dispatch(HookEvent::Timeout).await {
            warn!(tx_id = %self.metadata.tx_id, error = %e, "timeout hook failed");
        }

        if let Err(e) = self.rollback_claimed(TransactionState::TimedOut).await {
            warn!(
                tx_id = %self.metadata.tx_id,
                error = %e,
                "forced rollback failed, transaction stays active"
            );
        }
    }
}

impl<P: ConnectionPool> Drop for TransactionInner<P> {
    fn drop(&mut self) {
        let state = self.lifecycle.get_mut().state;
        let Some(connection) = self.connection.get_mut().take() else {
            return;
        };
        self.active.write().remove(&self.metadata.tx_id);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    tx_id = %self.metadata.tx_id,
                    %state,
                    "transaction dropped without commit or rollback; releasing connection"
                );
                let pool = self.pool.clone();
                runtime.spawn(async move { pool.release(connection).await });
            }
            Err(_) => warn!(
                tx_id = %self.metadata.tx_id,
                %state,
                "transaction dropped outside a runtime; connection not returned to pool"
            ),
        }
    }
}

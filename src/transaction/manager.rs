//! Transaction coordinator - the entry point for transactions.
//!
//! The TransactionCoordinator handles:
//! - Acquiring a connection and running the setup sequence
//! - Tracking active transactions
//! - Scoped transactions that commit or roll back automatically

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::db::{ConnectionHandle, ConnectionPool, DriverError};
use crate::transaction::context::{ActiveSet, Transaction, TransactionMetadata};
use crate::transaction::error::{CommitOutcome, SetupStep, TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::options::{CoordinatorConfig, TransactionOptions};

/// Statement that turns autocommit off for the transaction's lifetime.
/// Turning it back on is the pool's job when the connection is released.
const DISABLE_AUTOCOMMIT: &str = "SET autocommit=0";

/// Transaction coordinator.
///
/// Cheap to clone; clones share the pool and the active set.
pub struct TransactionCoordinator<P: ConnectionPool> {
    inner: Arc<CoordinatorInner<P>>,
}

struct CoordinatorInner<P: ConnectionPool> {
    pool: Arc<P>,
    config: CoordinatorConfig,
    active: ActiveSet,
}

impl<P: ConnectionPool> Clone for TransactionCoordinator<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: ConnectionPool> TransactionCoordinator<P> {
    /// Create a coordinator with default configuration.
    pub fn new(pool: Arc<P>) -> Self {
        Self::with_config(pool, CoordinatorConfig::default())
    }

    pub fn with_config(pool: Arc<P>, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                pool,
                config,
                active: Arc::new(RwLock::new(HashMap::new())),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<P> {
        &self.inner.pool
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Begin a transaction using the configured defaults.
    pub async fn begin(&self) -> TransactionResult<Transaction<P>> {
        self.begin_with(TransactionOptions::default()).await
    }

    /// Begin a transaction.
    ///
    /// Acquires a connection, then runs set-isolation (only when a level is
    /// requested), native begin and disable-autocommit in that order. The
    /// first failing step ends the sequence and the connection goes back to
    /// the pool.
    pub async fn begin_with(&self, options: TransactionOptions) -> TransactionResult<Transaction<P>> {
        let options = options.with_defaults(&self.inner.config);
        let tx_id = Ulid::new().to_string().to_lowercase();
        debug!(
            tx_id = %tx_id,
            isolation = ?options.isolation_level,
            timeout = ?options.effective_timeout(),
            "begin transaction"
        );

        let mut connection = self
            .inner
            .pool
            .acquire()
            .await
            .map_err(TransactionError::ConnectionAcquisition)?;

        if let Err(e) = run_setup(&mut connection, options.isolation_level).await {
            warn!(tx_id = %tx_id, error = %e, "transaction setup failed");
            self.inner.pool.release(connection).await;
            return Err(e);
        }

        let metadata = TransactionMetadata {
            tx_id,
            isolation_level: options.isolation_level,
            connection_id: connection.id(),
            timeout: options.effective_timeout(),
            started_at: Utc::now(),
        };
        let tx = Transaction::new(
            metadata,
            self.inner.pool.clone(),
            connection,
            self.inner.active.clone(),
        );
        tx.activate(options.effective_timeout());
        Ok(tx)
    }

    /// Get the number of active transactions.
    pub fn active_count(&self) -> usize {
        self.inner.active.read().len()
    }

    /// List all active transaction IDs.
    pub fn active_transactions(&self) -> Vec<String> {
        self.inner.active.read().keys().cloned().collect()
    }

    /// Check if a transaction is active.
    pub fn is_active(&self, tx_id: &str) -> bool {
        self.inner.active.read().contains_key(tx_id)
    }

    /// Get metadata for an active transaction.
    pub fn get_transaction_info(&self, tx_id: &str) -> Option<TransactionMetadata> {
        self.inner.active.read().get(tx_id).cloned()
    }

    /// Execute a function within a transaction, committing on `Ok` and
    /// rolling back on `Err`.
    ///
    /// A commit that the driver turned into a rollback is reported as the
    /// original commit error, since the work did not persist.
    pub async fn with_transaction<F, Fut, T>(
        &self,
        options: TransactionOptions,
        f: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(Transaction<P>) -> Fut,
        Fut: Future<Output = TransactionResult<T>>,
    {
        let tx = self.begin_with(options).await?;

        match f(tx.clone()).await {
            Ok(value) => match tx.commit().await {
                Ok(CommitOutcome::Committed) => Ok(value),
                Ok(CommitOutcome::RolledBack { commit_error }) => {
                    Err(TransactionError::Driver(commit_error))
                }
                Err(e) => {
                    // A vetoed or failed commit can leave the transaction active.
                    if tx.is_active() {
                        if let Err(rollback) = tx.rollback().await {
                            warn!(tx_id = %tx.id(), error = %rollback, "rollback after failed commit failed");
                        }
                    }
                    Err(e)
                }
            },
            Err(e) => {
                if tx.is_active() {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(tx_id = %tx.id(), error = %rollback, "rollback after failed work failed");
                    }
                }
                Err(e)
            }
        }
    }
}

impl<P: ConnectionPool> std::fmt::Debug for TransactionCoordinator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("active_count", &self.active_count())
            .field("config", &self.inner.config)
            .finish()
    }
}

fn setup_error(step: SetupStep) -> impl FnOnce(DriverError) -> TransactionError {
    move |source| TransactionError::SetupSequence { step, source }
}

/// Set isolation -> begin -> disable autocommit, short-circuiting on the
/// first failure.
async fn run_setup<C: ConnectionHandle>(
    connection: &mut C,
    isolation: Option<IsolationLevel>,
) -> TransactionResult<()> {
    if let Some(level) = isolation {
        connection
            .execute(&level.set_session_statement())
            .await
            .map_err(setup_error(SetupStep::SetIsolationLevel))?;
    }
    connection
        .begin()
        .await
        .map_err(setup_error(SetupStep::Begin))?;
    connection
        .execute(DISABLE_AUTOCOMMIT)
        .await
        .map_err(setup_error(SetupStep::DisableAutocommit))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::db::{row, MemoryDatabase, MemoryPool, Operation};
    use crate::transaction::context::TransactionState;

    fn setup(max_connections: usize) -> (Arc<MemoryPool>, TransactionCoordinator<MemoryPool>) {
        let pool = Arc::new(MemoryPool::new(MemoryDatabase::new(), max_connections));
        let coordinator = TransactionCoordinator::new(pool.clone());
        (pool, coordinator)
    }

    #[tokio::test]
    async fn test_begin_and_commit() {
        let (pool, coordinator) = setup(2);

        let tx = coordinator.begin().await.unwrap();
        assert!(coordinator.is_active(tx.id()));
        assert_eq!(tx.state(), TransactionState::Active);
        assert_eq!(tx.id().len(), 26);

        tx.commit().await.unwrap();
        assert_eq!(coordinator.active_count(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_setup_order_with_isolation() {
        let (pool, coordinator) = setup(1);

        let tx = coordinator
            .begin_with(TransactionOptions::new().isolation_level(IsolationLevel::RepeatableRead))
            .await
            .unwrap();
        assert_eq!(tx.isolation_level(), Some(IsolationLevel::RepeatableRead));

        assert_eq!(
            pool.journal(),
            vec![
                "ACQUIRE #1",
                "SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ",
                "BEGIN",
                "SET autocommit=0",
            ]
        );
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_without_isolation_skips_statement() {
        let (pool, coordinator) = setup(1);

        let tx = coordinator.begin().await.unwrap();
        assert_eq!(pool.journal(), vec!["ACQUIRE #1", "BEGIN", "SET autocommit=0"]);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_failure_short_circuits_and_releases() {
        for (fault, step, expected) in [
            (
                Operation::SetIsolation,
                SetupStep::SetIsolationLevel,
                vec!["ACQUIRE #1", "RELEASE #1"],
            ),
            (
                Operation::Begin,
                SetupStep::Begin,
                vec![
                    "ACQUIRE #1",
                    "SET SESSION TRANSACTION ISOLATION LEVEL SERIALIZABLE",
                    "RELEASE #1",
                ],
            ),
            (
                Operation::DisableAutocommit,
                SetupStep::DisableAutocommit,
                vec![
                    "ACQUIRE #1",
                    "SET SESSION TRANSACTION ISOLATION LEVEL SERIALIZABLE",
                    "BEGIN",
                    "RELEASE #1",
                ],
            ),
        ] {
            let (pool, coordinator) = setup(1);
            pool.fail_next(fault);

            let err = coordinator
                .begin_with(TransactionOptions::new().isolation_level(IsolationLevel::Serializable))
                .await
                .unwrap_err();

            match err {
                TransactionError::SetupSequence { step: failed, .. } => assert_eq!(failed, step),
                other => panic!("unexpected error: {other}"),
            }
            assert_eq!(pool.journal(), expected);
            assert_eq!(pool.in_use(), 0);
            assert_eq!(coordinator.active_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_acquisition_failure() {
        let (pool, coordinator) = setup(1);

        let held = coordinator.begin().await.unwrap();
        let err = coordinator.begin().await.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::ConnectionAcquisition(DriverError::PoolExhausted { max: 1 })
        ));

        held.rollback().await.unwrap();
        pool.fail_next(Operation::Acquire);
        assert!(matches!(
            coordinator.begin().await,
            Err(TransactionError::ConnectionAcquisition(DriverError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_config_defaults_apply() {
        let pool = Arc::new(MemoryPool::new(MemoryDatabase::new(), 1));
        let config = CoordinatorConfig::new().default_isolation_level(IsolationLevel::ReadCommitted);
        let coordinator = TransactionCoordinator::with_config(pool.clone(), config);

        let tx = coordinator.begin().await.unwrap();
        assert_eq!(tx.isolation_level(), Some(IsolationLevel::ReadCommitted));
        assert!(tx.timeout_deadline().is_none());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_active_transactions() {
        let (_pool, coordinator) = setup(3);

        assert_eq!(coordinator.active_count(), 0);

        let tx1 = coordinator.begin().await.unwrap();
        let tx2 = coordinator.begin().await.unwrap();
        assert_eq!(coordinator.active_count(), 2);
        assert!(coordinator.active_transactions().contains(&tx1.id().to_string()));

        let info = coordinator.get_transaction_info(tx2.id()).unwrap();
        assert_eq!(info.tx_id, tx2.id());

        tx1.rollback().await.unwrap();
        assert_eq!(coordinator.active_count(), 1);

        tx2.commit().await.unwrap();
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_with_transaction() {
        let (pool, coordinator) = setup(2);

        let result = coordinator
            .with_transaction(TransactionOptions::new(), |tx| async move {
                let mut conn = tx.connection().await?;
                conn.insert("users", row([("name", "Alice")]))?;
                Ok::<_, TransactionError>(42)
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(pool.database().rows("users").len(), 1);
    }

    #[tokio::test]
    async fn test_with_transaction_rollback_on_error() {
        let (pool, coordinator) = setup(2);

        let result = coordinator
            .with_transaction(TransactionOptions::new(), |tx| async move {
                let mut conn = tx.connection().await?;
                conn.insert("users", row([("name", "Bob")]))?;
                Err::<(), _>(DriverError::statement("INSERT", "constraint violated").into())
            })
            .await;

        assert!(result.is_err());
        assert!(pool.database().rows("users").is_empty());
        assert_eq!(coordinator.active_count(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_with_transaction_failed_rollback_keeps_work_error() {
        let (pool, coordinator) = setup(1);
        pool.fail_next(Operation::Rollback);

        let result = coordinator
            .with_transaction(TransactionOptions::new(), |_tx| async {
                Err::<(), _>(TransactionError::Driver(DriverError::statement(
                    "INSERT",
                    "duplicate key",
                )))
            })
            .await;
        assert!(matches!(
            result,
            Err(TransactionError::Driver(DriverError::Statement { .. }))
        ));
        assert_eq!(coordinator.active_count(), 0);

        // The unresolved transaction hands its connection back when dropped.
        tokio::task::yield_now().await;
        assert_eq!(pool.in_use(), 0);
        let tx = coordinator.begin().await.unwrap();
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_transaction_reports_failed_commit() {
        let (pool, coordinator) = setup(1);
        pool.fail_next(Operation::Commit);

        let result = coordinator
            .with_transaction(TransactionOptions::new(), |_tx| async {
                Ok::<_, TransactionError>(())
            })
            .await;
        assert!(matches!(
            result,
            Err(TransactionError::Driver(DriverError::Rejected { operation: "COMMIT", .. }))
        ));
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_arms_watchdog() {
        let pool = Arc::new(MemoryPool::new(MemoryDatabase::new(), 1));
        let config = CoordinatorConfig::new().default_timeout_ms(100);
        let coordinator = TransactionCoordinator::with_config(pool.clone(), config);

        let tx = coordinator.begin().await.unwrap();
        assert!(tx.timeout_deadline().is_some());

        assert_eq!(tx.wait_resolved().await, TransactionState::TimedOut);
        assert_eq!(coordinator.active_count(), 0);
        assert_eq!(pool.in_use(), 0);
        assert!(tx.started_at() <= Utc::now());
    }
}

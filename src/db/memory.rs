//! In-process connection pool and driver.
//!
//! Models just enough of a SQL server for the coordinator to run against:
//! session isolation and autocommit switches, native begin/commit/rollback,
//! and per-connection uncommitted writes that other connections cannot see.
//! Every successful driver call is appended to a journal, and any lifecycle
//! operation can be made to fail once with [`MemoryPool::fail_next`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use super::connection::{ConnectionHandle, ConnectionPool, DriverError, DriverResult};
use crate::transaction::IsolationLevel;

/// A stored row.
pub type Row = BTreeMap<String, Value>;

/// Build a row from `(column, value)` pairs.
pub fn row<K, V, I>(fields: I) -> Row
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Driver calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Acquire,
    SetIsolation,
    Begin,
    DisableAutocommit,
    Commit,
    Rollback,
}

/// Committed table contents shared by every connection.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<RwLock<BTreeMap<String, Vec<Row>>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    fn apply(&self, writes: impl IntoIterator<Item = (String, Row)>) {
        let mut tables = self.tables.write();
        for (table, row) in writes {
            tables.entry(table).or_default().push(row);
        }
    }
}

struct MemoryPoolInner {
    db: MemoryDatabase,
    available: Mutex<VecDeque<usize>>,
    max_connections: usize,
    created: Mutex<usize>,
    faults: Mutex<HashMap<Operation, usize>>,
    journal: Mutex<Vec<String>>,
}

impl MemoryPoolInner {
    /// Consume one pending fault for `op`, if any.
    fn take_fault(&self, op: Operation) -> bool {
        let mut faults = self.faults.lock();
        match faults.get_mut(&op) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    fn log(&self, entry: impl Into<String>) {
        self.journal.lock().push(entry.into());
    }
}

/// Connection pool over a [`MemoryDatabase`].
pub struct MemoryPool {
    inner: Arc<MemoryPoolInner>,
}

impl MemoryPool {
    /// Create a new connection pool.
    pub fn new(db: MemoryDatabase, max_connections: usize) -> Self {
        Self {
            inner: Arc::new(MemoryPoolInner {
                db,
                available: Mutex::new(VecDeque::new()),
                max_connections,
                created: Mutex::new(0),
                faults: Mutex::new(HashMap::new()),
                journal: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.inner.db
    }

    /// Make the next `op` fail. Calls stack.
    pub fn fail_next(&self, op: Operation) {
        *self.inner.faults.lock().entry(op).or_insert(0) += 1;
    }

    /// Successful driver calls so far, oldest first.
    pub fn journal(&self) -> Vec<String> {
        self.inner.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.inner.journal.lock().clear();
    }

    /// Get the number of available connections.
    pub fn available(&self) -> usize {
        self.inner.available.lock().len()
    }

    /// Get the total number of connections created.
    pub fn created(&self) -> usize {
        *self.inner.created.lock()
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.created() - self.available()
    }

    fn connect(&self, id: usize) -> MemoryConnection {
        self.inner.log(format!("ACQUIRE #{id}"));
        MemoryConnection {
            id,
            pool: self.inner.clone(),
            autocommit: true,
            in_transaction: false,
            isolation_level: None,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> DriverResult<MemoryConnection> {
        if self.inner.take_fault(Operation::Acquire) {
            return Err(DriverError::Unavailable("injected failure".into()));
        }

        // Try to get an available connection.
        let reused = self.inner.available.lock().pop_front();
        if let Some(id) = reused {
            return Ok(self.connect(id));
        }

        // Create a new connection if under limit.
        let id = {
            let mut created = self.inner.created.lock();
            if *created >= self.inner.max_connections {
                return Err(DriverError::PoolExhausted {
                    max: self.inner.max_connections,
                });
            }
            *created += 1;
            *created
        };
        Ok(self.connect(id))
    }

    /// Session state does not survive release: the next checkout of the same
    /// id starts with autocommit on, no isolation override and no writes.
    async fn release(&self, connection: MemoryConnection) {
        if !connection.pending.is_empty() {
            debug!(
                connection = connection.id,
                discarded = connection.pending.len(),
                "discarding uncommitted writes on release"
            );
        }
        self.inner.log(format!("RELEASE #{}", connection.id));
        self.inner.available.lock().push_back(connection.id);
    }
}

/// A connection from a [`MemoryPool`].
pub struct MemoryConnection {
    id: usize,
    pool: Arc<MemoryPoolInner>,
    autocommit: bool,
    in_transaction: bool,
    isolation_level: Option<IsolationLevel>,
    /// Writes not yet visible to other connections.
    pending: Vec<(String, Row)>,
}

impl MemoryConnection {
    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation_level
    }

    /// Insert a row. Outside a transaction with autocommit on, the row is
    /// committed immediately.
    pub fn insert(&mut self, table: &str, row: Row) -> DriverResult<()> {
        if self.in_transaction || !self.autocommit {
            self.pending.push((table.to_string(), row));
        } else {
            self.pool.db.apply([(table.to_string(), row)]);
        }
        Ok(())
    }

    /// Rows of `table` as this connection sees them: committed data plus
    /// its own uncommitted writes.
    pub fn select(&self, table: &str) -> Vec<Row> {
        let mut rows = self.pool.db.rows(table);
        rows.extend(
            self.pending
                .iter()
                .filter(|(t, _)| t == table)
                .map(|(_, row)| row.clone()),
        );
        rows
    }

    fn fail(&self, op: Operation) -> bool {
        self.pool.take_fault(op)
    }

    fn flush(&mut self) {
        let writes = std::mem::take(&mut self.pending);
        self.pool.db.apply(writes);
    }

    fn set_autocommit(&mut self, statement: &str, enabled: bool) -> DriverResult<()> {
        if !enabled && self.fail(Operation::DisableAutocommit) {
            return Err(DriverError::statement(statement, "injected failure"));
        }
        // Switching autocommit back on commits the open transaction.
        if enabled && !self.autocommit {
            self.flush();
            self.in_transaction = false;
        }
        self.autocommit = enabled;
        Ok(())
    }
}

const SET_ISOLATION_PREFIX: &str = "SET SESSION TRANSACTION ISOLATION LEVEL ";

#[async_trait]
impl ConnectionHandle for MemoryConnection {
    fn id(&self) -> usize {
        self.id
    }

    async fn execute(&mut self, statement: &str) -> DriverResult<()> {
        let normalized = statement.trim().to_ascii_uppercase();

        if let Some(level) = normalized.strip_prefix(SET_ISOLATION_PREFIX) {
            if self.fail(Operation::SetIsolation) {
                return Err(DriverError::statement(statement, "injected failure"));
            }
            let level = level
                .parse::<IsolationLevel>()
                .map_err(|msg| DriverError::statement(statement, msg))?;
            self.isolation_level = Some(level);
        } else {
            let compact: String = normalized.split_whitespace().collect();
            match compact.as_str() {
                "SETAUTOCOMMIT=0" => self.set_autocommit(statement, false)?,
                "SETAUTOCOMMIT=1" => self.set_autocommit(statement, true)?,
                _ => return Err(DriverError::statement(statement, "unsupported statement")),
            }
        }

        self.pool.log(statement.trim());
        Ok(())
    }

    async fn begin(&mut self) -> DriverResult<()> {
        if self.fail(Operation::Begin) {
            return Err(DriverError::rejected("BEGIN", "injected failure"));
        }
        // A second BEGIN implicitly commits the first.
        if self.in_transaction {
            self.flush();
        }
        self.in_transaction = true;
        self.pool.log("BEGIN");
        Ok(())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        if self.fail(Operation::Commit) {
            return Err(DriverError::rejected("COMMIT", "injected failure"));
        }
        self.flush();
        self.in_transaction = false;
        self.pool.log("COMMIT");
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        if self.fail(Operation::Rollback) {
            return Err(DriverError::rejected("ROLLBACK", "injected failure"));
        }
        self.pending.clear();
        self.in_transaction = false;
        self.pool.log("ROLLBACK");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_pool() {
        let pool = MemoryPool::new(MemoryDatabase::new(), 5);

        let mut conn = pool.acquire().await.unwrap();
        conn.execute("SET autocommit=0").await.unwrap();
        assert!(!conn.autocommit());

        assert_eq!(pool.created(), 1);
        assert_eq!(pool.in_use(), 1);
        pool.release(conn).await;
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_pool_reuse() {
        let pool = MemoryPool::new(MemoryDatabase::new(), 2);

        let mut conn1 = pool.acquire().await.unwrap();
        let conn2 = pool.acquire().await.unwrap();
        assert_eq!(pool.created(), 2);
        assert!(matches!(
            pool.acquire().await,
            Err(DriverError::PoolExhausted { max: 2 })
        ));

        conn1.execute("SET autocommit=0").await.unwrap();
        pool.release(conn1).await;
        pool.release(conn2).await;
        assert_eq!(pool.available(), 2);

        // Reuse existing connection, with fresh session state.
        let conn3 = pool.acquire().await.unwrap();
        assert_eq!(conn3.id(), 1);
        assert!(conn3.autocommit());
        assert_eq!(pool.created(), 2);
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_private() {
        let db = MemoryDatabase::new();
        let pool = MemoryPool::new(db.clone(), 2);

        let mut writer = pool.acquire().await.unwrap();
        let reader = pool.acquire().await.unwrap();

        writer.begin().await.unwrap();
        writer.insert("posts", row([("title", "t1")])).unwrap();
        assert_eq!(writer.select("posts").len(), 1);
        assert!(reader.select("posts").is_empty());

        writer.commit().await.unwrap();
        assert_eq!(reader.select("posts").len(), 1);
        assert_eq!(db.rows("posts")[0]["title"], Value::from("t1"));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let pool = MemoryPool::new(MemoryDatabase::new(), 1);
        let mut conn = pool.acquire().await.unwrap();

        conn.begin().await.unwrap();
        conn.insert("posts", row([("title", "t2")])).unwrap();
        conn.rollback().await.unwrap();

        assert!(conn.select("posts").is_empty());
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn test_autocommit_insert_is_immediate() {
        let pool = MemoryPool::new(MemoryDatabase::new(), 1);
        let mut conn = pool.acquire().await.unwrap();

        conn.insert("posts", row([("title", "t3")])).unwrap();
        assert_eq!(pool.database().rows("posts").len(), 1);
    }

    #[tokio::test]
    async fn test_execute_statements() {
        let pool = MemoryPool::new(MemoryDatabase::new(), 1);
        let mut conn = pool.acquire().await.unwrap();

        conn.execute("set session transaction isolation level read committed")
            .await
            .unwrap();
        assert_eq!(conn.isolation_level(), Some(IsolationLevel::ReadCommitted));

        assert!(conn
            .execute("SET SESSION TRANSACTION ISOLATION LEVEL CHAOS")
            .await
            .is_err());
        assert!(conn.execute("DROP TABLE posts").await.is_err());

        conn.execute("SET autocommit = 0").await.unwrap();
        conn.insert("posts", row([("title", "t4")])).unwrap();
        assert!(pool.database().rows("posts").is_empty());
        conn.execute("SET autocommit=1").await.unwrap();
        assert_eq!(pool.database().rows("posts").len(), 1);
    }

    #[tokio::test]
    async fn test_fail_next() {
        let pool = MemoryPool::new(MemoryDatabase::new(), 1);
        pool.fail_next(Operation::Commit);
        pool.fail_next(Operation::Commit);

        let mut conn = pool.acquire().await.unwrap();
        conn.begin().await.unwrap();
        assert!(conn.commit().await.is_err());
        assert!(conn.commit().await.is_err());
        conn.commit().await.unwrap();

        assert_eq!(pool.journal(), vec!["ACQUIRE #1", "BEGIN", "COMMIT"]);
        pool.clear_journal();
        assert!(pool.journal().is_empty());
    }
}

//! Connection collaborator interfaces.
//!
//! The coordinator never talks to a wire protocol directly. It consumes a
//! pool that hands out exclusively owned connections, and each connection
//! exposes the handful of driver operations a transaction lifecycle needs.

use async_trait::async_trait;
use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors reported by a connection or its pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Every connection is checked out.
    #[error("connection pool exhausted (max {max} connections)")]
    PoolExhausted { max: usize },

    /// The database could not be reached.
    #[error("database unavailable: {0}")]
    Unavailable(String),

    /// A statement failed to execute.
    #[error("statement `{statement}` failed: {message}")]
    Statement { statement: String, message: String },

    /// A native begin/commit/rollback was refused by the server.
    #[error("{operation} rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },

    /// The connection is no longer usable.
    #[error("connection closed")]
    ConnectionClosed,
}

impl DriverError {
    /// Shorthand for a failed statement.
    pub fn statement(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Statement {
            statement: statement.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a refused native operation.
    pub fn rejected(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation,
            message: message.into(),
        }
    }
}

/// A single acquired SQL connection.
///
/// Implementations must be usable from one task at a time; the coordinator
/// guarantees exclusive access for the whole time a transaction holds it.
#[async_trait]
pub trait ConnectionHandle: Send + 'static {
    /// Stable identifier, used in logs.
    fn id(&self) -> usize;

    /// Execute a statement whose result set (if any) is discarded.
    async fn execute(&mut self, statement: &str) -> DriverResult<()>;

    /// Driver-native BEGIN.
    async fn begin(&mut self) -> DriverResult<()>;

    /// Driver-native COMMIT.
    async fn commit(&mut self) -> DriverResult<()>;

    /// Driver-native ROLLBACK.
    async fn rollback(&mut self) -> DriverResult<()>;
}

/// Source of connections.
///
/// The pool owns acquisition and release policy, including resetting
/// session state (autocommit, isolation level) when a connection comes back.
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    type Connection: ConnectionHandle;

    /// Check out a connection.
    async fn acquire(&self) -> DriverResult<Self::Connection>;

    /// Return a connection to the pool.
    async fn release(&self, connection: Self::Connection);
}

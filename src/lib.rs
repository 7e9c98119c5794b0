//! txcoord - transaction lifecycle coordination for pooled SQL connections.
//!
//! This crate sits between a data-access layer and a connection pool. It
//! takes a logical transaction from begin (isolation level, native begin,
//! autocommit off) through commit or rollback exactly once, notifies
//! registered observers along the way, and can force a rollback when a
//! transaction outlives its timeout.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use txcoord::db::{row, MemoryDatabase, MemoryPool};
//! use txcoord::transaction::{IsolationLevel, TransactionCoordinator, TransactionOptions};
//!
//! # async fn example() -> Result<(), txcoord::transaction::TransactionError> {
//! let pool = Arc::new(MemoryPool::new(MemoryDatabase::new(), 4));
//! let coordinator = TransactionCoordinator::new(pool);
//!
//! let tx = coordinator
//!     .begin_with(TransactionOptions::new().isolation_level(IsolationLevel::RepeatableRead))
//!     .await?;
//! tx.connection().await?.insert("posts", row([("title", "t1")]))?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod transaction;

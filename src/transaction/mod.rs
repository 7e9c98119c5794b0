//! Transaction lifecycle coordination.
//!
//! A transaction owns one pooled connection from a successful begin until it
//! is committed, rolled back or timed out, and tells its observers about each
//! step on the way.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TransactionCoordinator                     │
//! │   (acquires connections, runs setup, tracks active tx)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │    Hook     │       │   Timeout   │
//!  │  (Context)  │       │  Registry   │       │   Monitor   │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # State machine
//!
//! ```text
//! INIT ──setup ok──▶ ACTIVE ──commit ok────────▶ COMMITTED
//!                      │  ╰──commit fails──▶ rollback path
//!                      ├──rollback ok──────────▶ ROLLEDBACK
//!                      ╰──deadline elapses────▶ TIMED_OUT
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txcoord::transaction::{HookEvent, IsolationLevel, TransactionCoordinator, TransactionOptions};
//!
//! let coordinator = TransactionCoordinator::new(pool);
//!
//! let tx = coordinator
//!     .begin_with(TransactionOptions::new().isolation_level(IsolationLevel::RepeatableRead))
//!     .await?;
//! tx.observe(HookEvent::AfterCommit, |ctx| async move {
//!     println!("{} committed", ctx.tx_id);
//!     Ok(())
//! });
//!
//! tx.execute("INSERT INTO posts (title) VALUES ('t1')").await?;
//! tx.commit().await?;  // or tx.rollback().await?;
//! ```

mod context;
mod error;
mod hooks;
mod isolation;
mod manager;
mod options;
mod timeout;

pub use context::{Transaction, TransactionMetadata, TransactionState};
pub use error::{CommitOutcome, SetupStep, TransactionError, TransactionResult};
pub use hooks::{HookContext, HookError, HookEvent, HookRegistry, HookResult};
pub use isolation::IsolationLevel;
pub use manager::TransactionCoordinator;
pub use options::{CoordinatorConfig, TransactionOptions};

//! Connection layer.
//!
//! The coordinator consumes connections through the `ConnectionHandle` and
//! `ConnectionPool` traits; the memory driver is an in-process implementation.

mod connection;
mod memory;

pub use connection::{ConnectionHandle, ConnectionPool, DriverError, DriverResult};
pub use memory::{row, MemoryConnection, MemoryDatabase, MemoryPool, Operation, Row};

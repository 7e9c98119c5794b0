//! Transaction isolation levels.
//!
//! The coordinator does not enforce isolation itself; it only asks the
//! connection to switch its session level before the native begin.
//! Leaving the level unset keeps whatever the connection defaults to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Reads may observe uncommitted writes of other transactions.
    ReadUncommitted,

    /// Each read sees the most recently committed data at the time of the read.
    ReadCommitted,

    /// All reads see a consistent snapshot taken at the first read.
    RepeatableRead,

    /// Transactions behave as if executed one after another.
    Serializable,
}

impl IsolationLevel {
    /// All levels, weakest first.
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// SQL keyword form, e.g. `REPEATABLE READ`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Session-scoped statement that switches a connection to this level.
    pub fn set_session_statement(&self) -> String {
        format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", self.as_sql())
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Parse isolation level from string (SQL syntax).
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "READ UNCOMMITTED" | "READ_UNCOMMITTED" | "READUNCOMMITTED" => {
                Ok(IsolationLevel::ReadUncommitted)
            }
            "READ COMMITTED" | "READ_COMMITTED" | "READCOMMITTED" => {
                Ok(IsolationLevel::ReadCommitted)
            }
            "REPEATABLE READ" | "REPEATABLE_READ" | "REPEATABLEREAD" | "READ_REPEATABLE" => {
                Ok(IsolationLevel::RepeatableRead)
            }
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}

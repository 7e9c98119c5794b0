//! Per-transaction options and coordinator-wide defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transaction::isolation::IsolationLevel;

/// Options for a single `begin` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// `None` keeps the connection's default level.
    pub isolation_level: Option<IsolationLevel>,
    /// `None` (or zero) disables the watchdog.
    pub timeout: Option<Duration>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_ms(self, millis: u64) -> Self {
        self.timeout(Duration::from_millis(millis))
    }

    /// The timeout to arm, if any. Zero means disabled.
    pub(crate) fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }

    /// Fill unset fields from the coordinator defaults.
    pub(crate) fn with_defaults(self, config: &CoordinatorConfig) -> Self {
        Self {
            isolation_level: self.isolation_level.or(config.default_isolation_level),
            timeout: self.timeout.or_else(|| config.default_timeout()),
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Isolation level for transactions that do not ask for one.
    pub default_isolation_level: Option<IsolationLevel>,
    /// Watchdog for transactions that do not set their own timeout.
    pub default_timeout_ms: Option<u64>,
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn default_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.default_isolation_level = Some(level);
        self
    }

    pub fn default_timeout_ms(mut self, millis: u64) -> Self {
        self.default_timeout_ms = Some(millis);
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

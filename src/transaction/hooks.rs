//! Lifecycle observers.
//!
//! Hooks are stored in a fixed table with one slot per [`HookEvent`]. Each
//! slot keeps its handlers in registration order, and dispatch walks them
//! one at a time so a later handler can rely on an earlier one's side
//! effects. The first handler that returns an error stops the chain.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::transaction::isolation::IsolationLevel;

/// Named lifecycle points a transaction reports to its observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
    Timeout,
}

impl HookEvent {
    pub const ALL: [HookEvent; 5] = [
        HookEvent::BeforeCommit,
        HookEvent::AfterCommit,
        HookEvent::BeforeRollback,
        HookEvent::AfterRollback,
        HookEvent::Timeout,
    ];

    /// Event name as observers know it.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeCommit => "before commit",
            HookEvent::AfterCommit => "after commit",
            HookEvent::BeforeRollback => "before rollback",
            HookEvent::AfterRollback => "after rollback",
            HookEvent::Timeout => "timeout",
        }
    }

    fn slot(&self) -> usize {
        match self {
            HookEvent::BeforeCommit => 0,
            HookEvent::AfterCommit => 1,
            HookEvent::BeforeRollback => 2,
            HookEvent::AfterRollback => 3,
            HookEvent::Timeout => 4,
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| format!("unknown hook event: {}", s))
    }
}

/// What a handler is told about the transaction it observes.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub tx_id: String,
    pub event: HookEvent,
    pub isolation_level: Option<IsolationLevel>,
}

/// Returned by a handler to veto the lifecycle step it observes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct HookError {
    pub reason: String,
}

impl HookError {
    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub type HookResult = Result<(), HookError>;

type HookFuture = Pin<Box<dyn Future<Output = HookResult> + Send>>;
type Handler = Arc<dyn Fn(HookContext) -> HookFuture + Send + Sync>;

/// Ordered handler lists, one per event.
#[derive(Default, Clone)]
pub struct HookRegistry {
    slots: [Vec<Handler>; 5],
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `event`.
    pub fn observe<F, Fut>(&mut self, event: HookEvent, handler: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx| Box::pin(handler(ctx)) as HookFuture);
        self.slots[event.slot()].push(handler);
    }

    /// Number of handlers registered for `event`.
    pub fn len(&self, event: HookEvent) -> usize {
        self.slots[event.slot()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }

    /// Handlers for `event` as of now. Dispatch works on this snapshot so
    /// a registration racing with a running chain never alters it.
    pub(crate) fn snapshot(&self, event: HookEvent) -> HookChain {
        HookChain {
            event,
            handlers: self.slots[event.slot()].clone(),
        }
    }

    /// Run every handler for `ctx.event` in order.
    pub async fn notify(&self, ctx: HookContext) -> HookResult {
        self.snapshot(ctx.event).run(ctx).await
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for event in HookEvent::ALL {
            map.entry(&event.as_str(), &self.len(event));
        }
        map.finish()
    }
}

/// A frozen handler list for one dispatch.
pub(crate) struct HookChain {
    event: HookEvent,
    handlers: Vec<Handler>,
}

impl HookChain {
    pub(crate) async fn run(self, ctx: HookContext) -> HookResult {
        debug_assert_eq!(ctx.event, self.event);
        for handler in self.handlers {
            handler(ctx.clone()).await?;
        }
        Ok(())
    }
}

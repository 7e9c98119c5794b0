//! Per-transaction watchdog.
//!
//! Arming spawns one task that sleeps until the deadline and then runs the
//! expiry action. Disarming sends on a oneshot the task is selecting on, so
//! a disarmed monitor never runs its action. Dropping the monitor disarms it.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) struct TimeoutMonitor {
    deadline: Instant,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl TimeoutMonitor {
    /// Spawn the watchdog. Must be called from within a tokio runtime.
    pub(crate) fn arm<F, Fut>(timeout: Duration, on_expiry: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let (cancel, cancelled) = oneshot::channel::<()>();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => on_expiry().await,
                _ = cancelled => {}
            }
        });

        Self {
            deadline,
            cancel: Mutex::new(Some(cancel)),
        }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Stop the watchdog. Returns false if it already fired or was disarmed.
    pub(crate) fn disarm(&self) -> bool {
        match self.cancel.lock().take() {
            Some(cancel) => cancel.send(()).is_ok(),
            None => false,
        }
    }
}

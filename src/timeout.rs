//! Clock & Timeout Scheduler.
//!
//! Built directly on `tokio::time`, which already is the single monotonic
//! time source for the process, so wall-clock adjustments never perturb
//! timeouts. A timeout is a spawned task sleeping for `delay`; cancelling
//! it aborts that task. `JoinHandle::abort` is idempotent and a no-op once
//! the task has finished: cancellation is safe after fire, but a
//! cancellation that loses the race against firing is observable (abort
//! cannot un-run a callback already past its last await point).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;

/// Handle to an armed, cancellable timeout.
pub struct TimeoutHandle {
    task: tokio::task::JoinHandle<()>,
}

impl TimeoutHandle {
    /// Cancel the timeout. Idempotent; safe to call after it has already
    /// fired.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        // A dropped handle with no explicit cancel still must not leak a
        // dangling timer that outlives the state that armed it.
        self.task.abort();
    }
}

/// The process-wide timeout scheduler.
#[derive(Clone)]
pub struct TimeoutScheduler {
    shutdown: Arc<AtomicBool>,
}

impl TimeoutScheduler {
    /// A scheduler accepting new timeouts.
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Monotonic "now".
    pub fn now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    /// Schedule `callback` to run no earlier than `delay` from now.
    /// `delay` cannot be negative (`Duration` is unsigned), which already
    /// means a negative delay is already impossible to express.
    pub fn schedule_timeout<F>(&self, delay: Duration, callback: F) -> Result<TimeoutHandle, EngineError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::TimeoutSchedulerShutdown);
        }
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback.await;
        });
        Ok(TimeoutHandle { task })
    }

    /// Stop accepting new timeouts. In-flight timers are left to run; the
    /// registry is responsible for cancelling them during its own shutdown
    /// walk during its own shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether [`TimeoutScheduler::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::new()
    }
}

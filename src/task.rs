//! Host task context: the carrier for cooperative cancellation, completion
//! hooks, and the metrics sink shared by everything running under one task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ExchangeError, Result};
use crate::metrics::{MetricsSink, NoopMetrics};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    finished: AtomicBool,
    hooks: Mutex<Vec<Hook>>,
    metrics: Arc<dyn MetricsSink>,
}

impl TaskContext {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
                metrics,
            }),
        }
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.inner.metrics
    }

    /// Registers a hook to run when the task completes or is cancelled. A hook
    /// registered after completion runs immediately on the caller's thread.
    pub fn on_completion(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.inner.hooks.lock();
            if !self.inner.finished.load(Ordering::SeqCst) {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Marks the task finished and runs all registered hooks exactly once.
    pub fn complete(&self) {
        let hooks = {
            let mut hooks = self.inner.hooks.lock();
            if self.inner.finished.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        // Run outside the lock; hooks may block (e.g. joining a thread).
        for hook in hooks {
            hook();
        }
    }

    /// Requests cancellation, then completes the task so the hooks tear down
    /// whatever is still running.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.complete();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn err_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ExchangeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }
}

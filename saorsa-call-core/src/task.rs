//! Owned background tasks
//!
//! Session timers and samplers must never outlive the state they belong to.
//! A [`TaskGuard`] owns the `JoinHandle`, aborts the task on [`TaskGuard::cancel`]
//! or drop, and exposes a cancelled flag that outlives the guard itself.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Shared view of a task's cancelled flag
#[derive(Debug, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Whether the owning guard cancelled the task
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Abort-on-drop handle to a spawned task
#[derive(Debug)]
pub struct TaskGuard {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    cancelled: Arc<AtomicBool>,
}

impl TaskGuard {
    /// Spawn `future` on the current runtime
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::trace!(task = name, "Spawning task");
        Self {
            name,
            handle: Some(tokio::spawn(future)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancelled flag that stays readable after the guard is gone
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        CancelFlag(Arc::clone(&self.cancelled))
    }

    /// Whether the task is still running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Whether [`cancel`](Self::cancel) has run
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Abort the task; idempotent
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            self.cancelled.store(true, Ordering::Release);
            tracing::trace!(task = self.name, "Task cancelled");
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_sets_flag() {
        let mut guard = TaskGuard::spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let flag = guard.cancel_flag();
        assert!(guard.is_active());
        assert!(!flag.is_cancelled());

        guard.cancel();
        guard.cancel();
        assert!(flag.is_cancelled());
        assert!(!guard.is_active());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let guard = TaskGuard::spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let flag = guard.cancel_flag();
        drop(guard);
        assert!(flag.is_cancelled());
    }
}

//! Cancellable delayed tasks on the tokio timer
//!
//! All delays go through `tokio::time`, so tests can run them on a paused
//! clock with `tokio::time::advance`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// A closure scheduled to run once after a delay. Dropping the task cancels it.
pub struct DelayedTask {
    handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
    /// Schedule `f` to run after `delay`. Must be called inside a tokio runtime.
    pub fn spawn<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Self { handle: Some(handle) }
    }

    /// Cancel the task if it has not fired yet
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// True once the task has fired or been cancelled
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Let the task run to completion even after this value is dropped
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Coalesces bursts of schedule requests into a single pending task.
///
/// While a task is pending, further `schedule` calls are ignored. The pending
/// slot is cleared just before the task runs, so a schedule arriving while the
/// task body executes starts a fresh one.
pub struct Debouncer {
    delay: Duration,
    pending: Arc<Mutex<Option<DelayedTask>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedule `f` unless a task is already pending. Returns true if scheduled.
    pub fn schedule<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }
        let slot = self.pending.clone();
        *pending = Some(DelayedTask::spawn(self.delay, move || {
            let current = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(task) = current {
                task.detach();
            }
            f();
        }));
        true
    }

    /// Whether a scheduled task has not fired yet
    pub fn is_pending(&self) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the pending task, if any
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut task) = pending.take() {
            task.cancel();
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_delayed_task_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let task = DelayedTask::spawn(Duration::from_millis(200), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(199)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_task_cancel() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let mut task = DelayedTask::spawn(Duration::from_millis(100), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_task_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        drop(DelayedTask::spawn(Duration::from_millis(100), move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_task_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        DelayedTask::spawn(Duration::from_millis(100), move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .detach();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_coalesces_burst() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let f = fired.clone();
            debouncer.schedule(move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_millis(301)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());

        // A new burst schedules again
        let f = fired.clone();
        assert!(debouncer.schedule(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(301)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_cancel() {
        let debouncer = Debouncer::new(Duration::from_millis(300));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        debouncer.schedule(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.cancel();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

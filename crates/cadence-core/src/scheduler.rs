//! Managed task scheduler: blocking-pool execution and cancellable timers.
//!
//! Components never spawn raw threads or sleep. Anything that must happen
//! "later" or "off the caller's thread" goes through a [`TaskScheduler`],
//! which is a thin, cloneable wrapper around a tokio runtime handle.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;

/// Cloneable handle used by every component to run deferred work.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    handle: Handle,
}

impl TaskScheduler {
    /// Wrap an explicit runtime handle.
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is currently running on.
    pub fn current() -> Result<Self, SchedulerError> {
        Ok(Self::new(Handle::try_current()?))
    }

    /// The underlying runtime handle.
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `task` on the blocking pool.
    ///
    /// Callbacks into capability agents may block (I/O, locks of their own),
    /// so they are never run on the async worker threads.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.handle.spawn_blocking(task));
    }

    /// Run `task` on the blocking pool after `delay`, unless the returned
    /// handle is cancelled or dropped first.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let fired = token.clone();

        self.handle.spawn(async move {
            tokio::select! {
                () = fired.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if fired.is_cancelled() {
                        return;
                    }
                    if let Err(e) = tokio::task::spawn_blocking(task).await {
                        tracing::error!(error = %e, "Scheduled task failed");
                    }
                }
            }
        });

        TimerHandle { token }
    }
}

/// Handle to a pending timer. Cancelling or dropping it voids the timer.
///
/// Cancellation is best effort: a task whose delay has already elapsed may
/// still run, so timer callbacks re-validate the state they act on.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Cancel the timer.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the timer was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread")]
    async fn timer_fires_after_delay() {
        let scheduler = TaskScheduler::current().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let _timer = scheduler.schedule(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timer should fire")
            .expect("sender alive");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_timer_never_fires() {
        let scheduler = TaskScheduler::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let timer = scheduler.schedule(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(timer);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_timer_reports_cancelled() {
        let scheduler = TaskScheduler::current().unwrap();
        let timer = scheduler.schedule(Duration::from_secs(60), || {});
        assert!(!timer.is_cancelled());
        timer.cancel();
        assert!(timer.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn execute_runs_off_the_caller() {
        let scheduler = TaskScheduler::current().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        scheduler.execute(move || {
            let _ = tx.send(std::thread::current().id());
        });
        let id = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(id, std::thread::current().id());
    }

    #[test]
    fn current_fails_outside_runtime() {
        assert!(matches!(
            TaskScheduler::current(),
            Err(SchedulerError::NoRuntime(_))
        ));
    }
}

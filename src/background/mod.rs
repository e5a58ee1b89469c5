//! Background tasks: cancellable periodic jobs on the Tokio runtime.
//!
//! [`Periodic`] runs a synchronous tick function on a fixed period. The tick
//! runs inline in the task loop, so a new tick cannot start before the
//! previous one returned; ticks missed while a slow tick ran are skipped
//! rather than replayed in a burst.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// A named repeating job that can be started and stopped idempotently.
pub struct Periodic {
    name: &'static str,
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Periodic {
    /// A zero `period` is raised to one millisecond.
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period: period.max(Duration::from_millis(1)),
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Spawns the job. The first tick fires immediately.
    ///
    /// Returns `false` without spawning when the job is already running or
    /// when called outside a Tokio runtime.
    pub fn start<F>(&self, mut tick: F) -> bool
    where
        F: FnMut() + Send + 'static,
    {
        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!(job = self.name, "periodic job already running");
            return false;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(job = self.name, "no Tokio runtime; periodic job not started");
            return false;
        };

        let (name, period) = (self.name, self.period);
        *task = Some(runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tick();
            }
        }));
        info!(job = name, ?period, "periodic job started");
        true
    }

    /// Cancels the job. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        match self.task().take() {
            Some(task) => {
                task.abort();
                info!(job = self.name, "periodic job stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        if let Some(task) = self.task().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_until_stopped() {
        let job = Periodic::new("test", Duration::from_millis(100));
        let (count, tick) = counter();

        assert!(job.start(tick));
        assert!(job.is_running());
        tokio::time::sleep(Duration::from_millis(250)).await;
        let seen = count.load(Ordering::SeqCst);
        assert!((2..=3).contains(&seen), "saw {seen} ticks");

        assert!(job.stop());
        assert!(!job.stop());
        assert!(!job.is_running());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_a_no_op() {
        let job = Periodic::new("test", Duration::from_millis(100));
        let (count, first) = counter();
        let (other, second) = counter();

        assert!(job.start(first));
        assert!(!job.start(second));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(count.load(Ordering::SeqCst) >= 2);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop() {
        let job = Periodic::new("test", Duration::from_millis(100));
        let (_, first) = counter();
        assert!(job.start(first));
        job.stop();

        let (count, second) = counter();
        assert!(job.start(second));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_outside_runtime_is_refused() {
        let job = Periodic::new("test", Duration::from_millis(100));
        let (_, tick) = counter();
        assert!(!job.start(tick));
        assert!(!job.is_running());
    }
}

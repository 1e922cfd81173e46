//! Tracked background work.
//!
//! Delayed invalidations, edge purges, the event consumer, scheduled warming
//! and the stats collector all run as tasks registered here. Shutdown signals
//! every task, waits a bounded grace period, then aborts what is left.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::tasks";

/// Cooperative cancellation handed to every tracked task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&mut self) {
        // A dropped sender means the owner is gone; treat it as shutdown.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.shutdown.subscribe(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Spawn a tracked task. Returns `false` when shutdown already began.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F) -> bool
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.is_shutting_down() {
            debug!(task = %name, "Shutdown in progress; task not spawned");
            return false;
        }
        let handle = tokio::spawn(task(self.signal()));
        let mut handles = mutex_lock(&self.handles, SOURCE, "spawn");
        handles.retain(|(_, handle)| !handle.is_finished());
        handles.push((name, handle));
        true
    }

    /// Tasks still running.
    pub fn active(&self) -> usize {
        let mut handles = mutex_lock(&self.handles, SOURCE, "active");
        handles.retain(|(_, handle)| !handle.is_finished());
        handles.len()
    }

    /// Signal, wait up to `grace`, then abort stragglers. Returns how many
    /// tasks had to be aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.shutdown.send_replace(true);
        let pending: Vec<(String, JoinHandle<()>)> =
            std::mem::take(&mut *mutex_lock(&self.handles, SOURCE, "shutdown"));
        let total = pending.len();

        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for (name, mut handle) in pending {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_panic() => {
                    warn!(task = %name, "Background task panicked before shutdown");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                    warn!(task = %name, "Background task exceeded grace period; aborted");
                }
            }
        }

        info!(
            tasks = total,
            aborted,
            grace_ms = grace.as_millis() as u64,
            "Background tasks stopped"
        );
        aborted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cooperative_tasks_stop_on_signal() {
        let tasks = BackgroundTasks::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        tasks.spawn("loop", move |mut signal| async move {
            loop {
                tokio::select! {
                    _ = signal.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            flag.store(true, Ordering::SeqCst);
        });

        let aborted = tasks.shutdown(Duration::from_secs(5)).await;
        assert_eq!(aborted, 0);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stragglers_are_aborted_after_grace() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("stubborn", |_signal| async move {
            std::future::pending::<()>().await;
        });

        let aborted = tasks.shutdown(Duration::from_millis(100)).await;
        assert_eq!(aborted, 1);
        assert_eq!(tasks.active(), 0);
    }

    #[tokio::test]
    async fn spawning_after_shutdown_is_refused() {
        let tasks = BackgroundTasks::new();
        tasks.shutdown(Duration::from_millis(10)).await;
        assert!(!tasks.spawn("late", |_signal| async {}));
    }
}

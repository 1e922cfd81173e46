//! Priority-ordered cache warming.
//!
//! Tasks are registered with a [`Warmer`] that does the actual loading.
//! A warming pass runs the selected tasks in ascending priority order (1 is
//! the most critical); only one pass runs at a time. Failed tasks are retried
//! per their [`RetryPolicy`] and the last result of every task is kept for
//! inspection.

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use futures::future::join_all;
use metrics::histogram;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::lock::{rw_read, rw_write};
use super::tasks::BackgroundTasks;

const SOURCE: &str = "cache::warming";

pub(crate) const METRIC_WARM_TASK_MS: &str = "cachekeeper_warm_task_ms";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WarmError {
    #[error("warmer failed: {0}")]
    Failed(String),
    #[error("warming task `{task}` timed out after {after:?}")]
    Timeout { task: String, after: Duration },
    #[error("warming task `{0}` is already registered")]
    DuplicateTask(String),
    #[error("warming task `{task}` is invalid: {reason}")]
    InvalidTask { task: String, reason: String },
}

impl WarmError {
    pub fn failed(detail: impl std::fmt::Display) -> Self {
        Self::Failed(detail.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmStrategy {
    /// One call that loads everything.
    Eager,
    /// Fixed-size batches in waves of `concurrency`.
    Progressive,
    /// Progressive, with usage hints passed to every batch.
    Predictive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on_failure: true,
            max_retries: 2,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retry_on_failure: false,
            max_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    fn attempts(&self) -> u32 {
        if self.retry_on_failure {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }
}

#[derive(Debug, Clone)]
pub struct WarmingTask {
    pub name: String,
    /// 1 is the most critical; lower values run first.
    pub priority: u8,
    pub strategy: WarmStrategy,
    pub schedule: Option<Schedule>,
    pub warm_on_startup: bool,
    pub enabled: bool,
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_batches: usize,
    /// Bound on one attempt.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl WarmingTask {
    pub fn new(name: impl Into<String>, priority: u8, strategy: WarmStrategy) -> Self {
        Self {
            name: name.into(),
            priority,
            strategy,
            schedule: None,
            warm_on_startup: true,
            enabled: true,
            batch_size: 100,
            concurrency: 1,
            max_batches: 10,
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }

    /// Attach a cron schedule (seconds-first, e.g. `0 */15 * * * *`).
    pub fn schedule(mut self, expression: &str) -> Result<Self, WarmError> {
        let schedule = Schedule::from_str(expression).map_err(|err| WarmError::InvalidTask {
            task: self.name.clone(),
            reason: format!("invalid schedule `{expression}`: {err}"),
        })?;
        self.schedule = Some(schedule);
        Ok(self)
    }

    pub fn batches(mut self, batch_size: usize, concurrency: usize, max_batches: usize) -> Self {
        self.batch_size = batch_size;
        self.concurrency = concurrency;
        self.max_batches = max_batches;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn on_startup(mut self, warm_on_startup: bool) -> Self {
        self.warm_on_startup = warm_on_startup;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn check(&self) -> Result<(), WarmError> {
        let invalid = |reason: &str| WarmError::InvalidTask {
            task: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.batch_size == 0 || self.concurrency == 0 || self.max_batches == 0 {
            return Err(invalid("batch size, concurrency and max batches must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be positive"));
        }
        Ok(())
    }
}

/// Usage hint for predictive warming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageHint {
    /// Keys or identifiers expected to be requested soon, hottest first.
    pub hot_keys: Vec<String>,
}

/// One unit of warming work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmBatch {
    pub index: usize,
    pub offset: usize,
    pub size: usize,
    pub hint: Option<UsageHint>,
}

/// Loads one batch into the cache and reports how many items it warmed.
///
/// A batch that returns fewer than `size` items ends a progressive run.
#[async_trait]
pub trait Warmer: Send + Sync {
    async fn warm(&self, batch: WarmBatch) -> Result<usize, WarmError>;
}

struct FnWarmer<F>(F);

#[async_trait]
impl<F, Fut> Warmer for FnWarmer<F>
where
    F: Fn(WarmBatch) -> Fut + Send + Sync,
    Fut: Future<Output = Result<usize, WarmError>> + Send,
{
    async fn warm(&self, batch: WarmBatch) -> Result<usize, WarmError> {
        (self.0)(batch).await
    }
}

/// Wrap a closure as a [`Warmer`].
pub fn warm_fn<F, Fut>(f: F) -> Arc<dyn Warmer>
where
    F: Fn(WarmBatch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<usize, WarmError>> + Send + 'static,
{
    Arc::new(FnWarmer(f))
}

/// Source of predictive hints.
#[async_trait]
pub trait UsagePatterns: Send + Sync {
    async fn hint(&self, task: &str) -> Option<UsageHint>;
}

#[derive(Debug, Default)]
pub struct NoUsagePatterns;

#[async_trait]
impl UsagePatterns for NoUsagePatterns {
    async fn hint(&self, _task: &str) -> Option<UsageHint> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmResult {
    pub task: String,
    pub items_warmed: usize,
    /// One entry per failed attempt.
    pub errors: Vec<String>,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub success: bool,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmPass {
    /// Results in execution order.
    Completed(Vec<WarmResult>),
    /// Another pass held the guard; nothing ran.
    AlreadyRunning,
}

impl WarmPass {
    pub fn results(&self) -> &[WarmResult] {
        match self {
            Self::Completed(results) => results,
            Self::AlreadyRunning => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmingStats {
    pub passes: u64,
    pub skipped_passes: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub items_warmed: u64,
}

#[derive(Debug, Default)]
struct WarmingCounters {
    passes: AtomicU64,
    skipped_passes: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    items_warmed: AtomicU64,
}

#[derive(Clone)]
struct Registered {
    task: WarmingTask,
    warmer: Arc<dyn Warmer>,
}

/// Clears the in-progress flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct WarmingScheduler {
    enabled: bool,
    inter_batch_delay: Duration,
    tasks: RwLock<Vec<Registered>>,
    results: DashMap<String, WarmResult>,
    run_counts: DashMap<String, u64>,
    warming: AtomicBool,
    usage: Arc<dyn UsagePatterns>,
    counters: WarmingCounters,
}

impl WarmingScheduler {
    pub fn new(enabled: bool, inter_batch_delay: Duration, usage: Arc<dyn UsagePatterns>) -> Self {
        Self {
            enabled,
            inter_batch_delay,
            tasks: RwLock::new(Vec::new()),
            results: DashMap::new(),
            run_counts: DashMap::new(),
            warming: AtomicBool::new(false),
            usage,
            counters: WarmingCounters::default(),
        }
    }

    pub fn register_task(&self, task: WarmingTask, warmer: Arc<dyn Warmer>) -> Result<(), WarmError> {
        task.check()?;
        let mut tasks = rw_write(&self.tasks, SOURCE, "register_task");
        if tasks.iter().any(|registered| registered.task.name == task.name) {
            return Err(WarmError::DuplicateTask(task.name));
        }
        info!(
            task = %task.name,
            priority = task.priority,
            strategy = ?task.strategy,
            scheduled = task.schedule.is_some(),
            "Warming task registered"
        );
        tasks.push(Registered { task, warmer });
        Ok(())
    }

    pub fn task_names(&self) -> Vec<String> {
        rw_read(&self.tasks, SOURCE, "task_names")
            .iter()
            .map(|registered| registered.task.name.clone())
            .collect()
    }

    pub fn is_warming(&self) -> bool {
        self.warming.load(Ordering::Acquire)
    }

    /// Run a warming pass.
    ///
    /// With `names`, runs exactly those enabled tasks; without, every enabled
    /// task flagged for startup. Returns [`WarmPass::AlreadyRunning`] when a
    /// pass is in progress.
    pub async fn warm(&self, names: Option<&[String]>) -> WarmPass {
        if !self.enabled {
            debug!("Warming disabled; pass skipped");
            return WarmPass::Completed(Vec::new());
        }
        if self
            .warming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.counters.skipped_passes.fetch_add(1, Ordering::Relaxed);
            warn!("Warming pass already in progress; request skipped");
            return WarmPass::AlreadyRunning;
        }
        let _guard = PassGuard(&self.warming);
        self.counters.passes.fetch_add(1, Ordering::Relaxed);

        let selected = self.select(names);
        let started = Instant::now();
        info!(tasks = selected.len(), "Warming pass started");

        let mut results = Vec::with_capacity(selected.len());
        for registered in selected {
            let result = self.run_task(&registered).await;
            self.results.insert(result.task.clone(), result.clone());
            results.push(result);
        }

        info!(
            tasks = results.len(),
            failed = results.iter().filter(|result| !result.success).count(),
            items = results.iter().map(|result| result.items_warmed).sum::<usize>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Warming pass finished"
        );
        WarmPass::Completed(results)
    }

    fn select(&self, names: Option<&[String]>) -> Vec<Registered> {
        let tasks = rw_read(&self.tasks, SOURCE, "select");
        let mut selected: Vec<Registered> = match names {
            Some(names) => {
                for name in names {
                    if !tasks.iter().any(|registered| &registered.task.name == name) {
                        warn!(task = %name, "Unknown warming task requested");
                    }
                }
                tasks
                    .iter()
                    .filter(|registered| registered.task.enabled && names.contains(&registered.task.name))
                    .cloned()
                    .collect()
            }
            None => tasks
                .iter()
                .filter(|registered| registered.task.enabled && registered.task.warm_on_startup)
                .cloned()
                .collect(),
        };
        selected.sort_by_key(|registered| registered.task.priority);
        selected
    }

    async fn run_task(&self, registered: &Registered) -> WarmResult {
        let task = &registered.task;
        let started = Instant::now();
        let attempts_allowed = task.retry.attempts();
        let mut errors = Vec::new();
        let mut items_warmed = 0;
        let mut success = false;
        let mut attempts = 0;

        for attempt in 1..=attempts_allowed {
            attempts = attempt;
            let outcome = match tokio::time::timeout(task.timeout, self.execute(registered)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(WarmError::Timeout {
                    task: task.name.clone(),
                    after: task.timeout,
                }),
            };
            match outcome {
                Ok(items) => {
                    items_warmed = items;
                    success = true;
                    break;
                }
                Err(err) => {
                    warn!(task = %task.name, attempt, error = %err, "Warming attempt failed");
                    errors.push(err.to_string());
                }
            }
            if attempt < attempts_allowed && !task.retry.retry_delay.is_zero() {
                tokio::time::sleep(task.retry.retry_delay).await;
            }
        }

        let duration = started.elapsed();
        *self.run_counts.entry(task.name.clone()).or_insert(0) += 1;
        let outcome = if success { "ok" } else { "error" };
        histogram!(METRIC_WARM_TASK_MS, "task" => task.name.clone(), "result" => outcome)
            .record(duration.as_secs_f64() * 1000.0);

        if success {
            self.counters.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
            self.counters
                .items_warmed
                .fetch_add(items_warmed as u64, Ordering::Relaxed);
            info!(
                task = %task.name,
                items = items_warmed,
                attempts,
                elapsed_ms = duration.as_millis() as u64,
                "Warming task completed"
            );
        } else {
            self.counters.tasks_failed.fetch_add(1, Ordering::Relaxed);
            error!(task = %task.name, attempts, errors = ?errors, "Warming task failed");
        }

        WarmResult {
            task: task.name.clone(),
            items_warmed,
            errors,
            duration,
            success,
            attempts,
            finished_at: OffsetDateTime::now_utc(),
        }
    }

    async fn execute(&self, registered: &Registered) -> Result<usize, WarmError> {
        let task = &registered.task;
        let warmer = &registered.warmer;
        let hint = match task.strategy {
            WarmStrategy::Eager => {
                return warmer
                    .warm(WarmBatch {
                        index: 0,
                        offset: 0,
                        size: task.batch_size,
                        hint: None,
                    })
                    .await;
            }
            WarmStrategy::Progressive => None,
            WarmStrategy::Predictive => self.usage.hint(&task.name).await,
        };

        let mut total = 0;
        let mut index = 0;
        while index < task.max_batches {
            let wave_end = (index + task.concurrency).min(task.max_batches);
            let wave = (index..wave_end).map(|i| {
                warmer.warm(WarmBatch {
                    index: i,
                    offset: i * task.batch_size,
                    size: task.batch_size,
                    hint: hint.clone(),
                })
            });
            let mut exhausted = false;
            for outcome in join_all(wave).await {
                let items = outcome?;
                total += items;
                exhausted |= items < task.batch_size;
            }
            index = wave_end;
            if exhausted || index >= task.max_batches {
                break;
            }
            if !self.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
        }
        Ok(total)
    }

    /// Spawn one loop per scheduled task. Returns how many were started.
    pub fn spawn_schedules(self: &Arc<Self>, tasks: &BackgroundTasks) -> usize {
        let scheduled: Vec<(String, Schedule)> = rw_read(&self.tasks, SOURCE, "spawn_schedules")
            .iter()
            .filter(|registered| registered.task.enabled)
            .filter_map(|registered| {
                registered
                    .task
                    .schedule
                    .clone()
                    .map(|schedule| (registered.task.name.clone(), schedule))
            })
            .collect();

        let count = scheduled.len();
        for (name, schedule) in scheduled {
            let scheduler = Arc::clone(self);
            tasks.spawn(format!("warm_schedule:{name}"), move |mut signal| async move {
                loop {
                    let Some(next) = schedule.upcoming(Utc).next() else {
                        debug!(task = %name, "Schedule has no upcoming runs");
                        break;
                    };
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = signal.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {
                            let names = [name.clone()];
                            if scheduler.warm(Some(names.as_slice())).await == WarmPass::AlreadyRunning {
                                debug!(task = %name, "Scheduled warm skipped; pass in progress");
                            }
                        }
                    }
                }
            });
        }
        count
    }

    pub fn last_result(&self, task: &str) -> Option<WarmResult> {
        self.results.get(task).map(|entry| entry.value().clone())
    }

    /// Latest result per task, by task name.
    pub fn results(&self) -> Vec<WarmResult> {
        let mut results: Vec<WarmResult> = self
            .results
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        results.sort_by(|a, b| a.task.cmp(&b.task));
        results
    }

    pub fn run_count(&self, task: &str) -> u64 {
        self.run_counts.get(task).map(|entry| *entry.value()).unwrap_or(0)
    }

    pub fn stats(&self) -> WarmingStats {
        WarmingStats {
            passes: self.counters.passes.load(Ordering::Relaxed),
            skipped_passes: self.counters.skipped_passes.load(Ordering::Relaxed),
            tasks_succeeded: self.counters.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.counters.tasks_failed.load(Ordering::Relaxed),
            items_warmed: self.counters.items_warmed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::Notify;

    use super::*;

    fn scheduler() -> WarmingScheduler {
        WarmingScheduler::new(true, Duration::ZERO, Arc::new(NoUsagePatterns))
    }

    fn counting_warmer(items: usize) -> Arc<dyn Warmer> {
        warm_fn(move |_batch| async move { Ok(items) })
    }

    #[tokio::test]
    async fn tasks_run_in_priority_order() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, priority) in [("search", 3_u8), ("translations", 1), ("profiles", 2)] {
            let order = order.clone();
            let warmer = warm_fn(move |_batch| {
                let order = order.clone();
                async move {
                    order.lock().expect("lock").push(name);
                    Ok(1)
                }
            });
            scheduler
                .register_task(WarmingTask::new(name, priority, WarmStrategy::Eager), warmer)
                .expect("register");
        }

        let pass = scheduler.warm(None).await;
        assert_eq!(pass.results().len(), 3);
        assert_eq!(*order.lock().expect("lock"), vec!["translations", "profiles", "search"]);
    }

    #[tokio::test]
    async fn startup_pass_skips_tasks_not_flagged() {
        let scheduler = scheduler();
        scheduler
            .register_task(
                WarmingTask::new("nightly", 1, WarmStrategy::Eager).on_startup(false),
                counting_warmer(1),
            )
            .expect("register");
        scheduler
            .register_task(
                WarmingTask::new("off", 1, WarmStrategy::Eager).enabled(false),
                counting_warmer(1),
            )
            .expect("register");

        assert!(scheduler.warm(None).await.results().is_empty());

        let named = scheduler
            .warm(Some(["nightly".to_string(), "off".to_string()].as_slice()))
            .await;
        assert_eq!(named.results().len(), 1);
        assert_eq!(named.results()[0].task, "nightly");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_is_retried_then_reported() {
        let scheduler = scheduler();
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let warmer = warm_fn(move |_batch| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err::<usize, _>(WarmError::failed("db down"))
            }
        });
        scheduler
            .register_task(
                WarmingTask::new("records", 1, WarmStrategy::Eager).retry(RetryPolicy {
                    retry_on_failure: true,
                    max_retries: 2,
                    retry_delay: Duration::from_secs(1),
                }),
                warmer,
            )
            .expect("register");

        let pass = scheduler.warm(None).await;
        let result = &pass.results()[0];
        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.errors.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.stats().tasks_failed, 1);
    }

    #[tokio::test]
    async fn retry_recovers_transient_failure() {
        let scheduler = scheduler();
        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        let warmer = warm_fn(move |_batch| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(WarmError::failed("blip"))
                } else {
                    Ok(7)
                }
            }
        });
        scheduler
            .register_task(
                WarmingTask::new("flaky", 1, WarmStrategy::Eager).retry(RetryPolicy {
                    retry_on_failure: true,
                    max_retries: 1,
                    retry_delay: Duration::ZERO,
                }),
                warmer,
            )
            .expect("register");

        let pass = scheduler.warm(None).await;
        let result = &pass.results()[0];
        assert!(result.success);
        assert_eq!(result.items_warmed, 7);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn progressive_stops_on_short_batch() {
        let scheduler = scheduler();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let seen = batches.clone();
        let warmer = warm_fn(move |batch: WarmBatch| {
            let seen = seen.clone();
            async move {
                seen.lock().expect("lock").push(batch.offset);
                Ok(if batch.index < 2 { batch.size } else { 3 })
            }
        });
        scheduler
            .register_task(
                WarmingTask::new("records", 1, WarmStrategy::Progressive).batches(10, 1, 50),
                warmer,
            )
            .expect("register");

        let pass = scheduler.warm(None).await;
        assert_eq!(pass.results()[0].items_warmed, 23);
        assert_eq!(*batches.lock().expect("lock"), vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn progressive_respects_max_batches_and_waves() {
        let scheduler = scheduler();
        let warmer = warm_fn(|batch: WarmBatch| async move { Ok(batch.size) });
        scheduler
            .register_task(
                WarmingTask::new("all", 1, WarmStrategy::Progressive).batches(5, 2, 3),
                warmer,
            )
            .expect("register");

        let pass = scheduler.warm(None).await;
        assert_eq!(pass.results()[0].items_warmed, 15);
    }

    struct HotKeys;

    #[async_trait]
    impl UsagePatterns for HotKeys {
        async fn hint(&self, _task: &str) -> Option<UsageHint> {
            Some(UsageHint {
                hot_keys: vec!["patient:1".to_string()],
            })
        }
    }

    #[tokio::test]
    async fn predictive_batches_carry_hints() {
        let scheduler = WarmingScheduler::new(true, Duration::ZERO, Arc::new(HotKeys));
        let hinted = Arc::new(AtomicBool::new(false));
        let flag = hinted.clone();
        let warmer = warm_fn(move |batch: WarmBatch| {
            let flag = flag.clone();
            async move {
                if batch.hint.is_some_and(|hint| hint.hot_keys == ["patient:1"]) {
                    flag.store(true, Ordering::SeqCst);
                }
                Ok(0)
            }
        });
        scheduler
            .register_task(WarmingTask::new("hot", 1, WarmStrategy::Predictive), warmer)
            .expect("register");

        scheduler.warm(None).await;
        assert!(hinted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrent_passes_are_mutually_exclusive() {
        let scheduler = Arc::new(scheduler());
        let release = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let (gate, signal) = (release.clone(), entered.clone());
        let warmer = warm_fn(move |_batch| {
            let gate = gate.clone();
            let signal = signal.clone();
            async move {
                signal.notify_one();
                gate.notified().await;
                Ok(1)
            }
        });
        scheduler
            .register_task(WarmingTask::new("slow", 1, WarmStrategy::Eager), warmer)
            .expect("register");

        let first = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.warm(None).await }
        });
        entered.notified().await;
        assert!(scheduler.is_warming());

        assert_eq!(scheduler.warm(None).await, WarmPass::AlreadyRunning);

        release.notify_one();
        let pass = first.await.expect("join");
        assert_eq!(pass.results().len(), 1);
        assert_eq!(scheduler.run_count("slow"), 1);
        assert!(!scheduler.is_warming());
        assert_eq!(scheduler.stats().skipped_passes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_failures() {
        let scheduler = scheduler();
        let warmer = warm_fn(|_batch| async {
            std::future::pending::<()>().await;
            Ok(0)
        });
        scheduler
            .register_task(
                WarmingTask::new("hang", 1, WarmStrategy::Eager)
                    .timeout(Duration::from_secs(2))
                    .retry(RetryPolicy::none()),
                warmer,
            )
            .expect("register");

        let pass = scheduler.warm(None).await;
        let result = &pass.results()[0];
        assert!(!result.success);
        assert!(result.errors[0].contains("timed out"));
    }

    #[test]
    fn invalid_tasks_are_rejected() {
        let scheduler = scheduler();
        let err = scheduler
            .register_task(
                WarmingTask::new("zero", 1, WarmStrategy::Progressive).batches(0, 1, 1),
                counting_warmer(0),
            )
            .expect_err("zero batch size");
        assert!(matches!(err, WarmError::InvalidTask { .. }));
        assert!(WarmingTask::new("bad", 1, WarmStrategy::Eager).schedule("not cron").is_err());
    }

    #[test]
    fn duplicate_tasks_are_rejected() {
        let scheduler = scheduler();
        scheduler
            .register_task(WarmingTask::new("a", 1, WarmStrategy::Eager), counting_warmer(1))
            .expect("first");
        let err = scheduler
            .register_task(WarmingTask::new("a", 2, WarmStrategy::Eager), counting_warmer(1))
            .expect_err("duplicate");
        assert_eq!(err, WarmError::DuplicateTask("a".to_string()));
    }

    #[tokio::test]
    async fn disabled_scheduler_runs_nothing() {
        let scheduler = WarmingScheduler::new(false, Duration::ZERO, Arc::new(NoUsagePatterns));
        scheduler
            .register_task(WarmingTask::new("a", 1, WarmStrategy::Eager), counting_warmer(1))
            .expect("register");
        assert!(scheduler.warm(None).await.results().is_empty());
        assert_eq!(scheduler.run_count("a"), 0);
    }

    #[test]
    fn cron_schedules_parse_seconds_first() {
        let task = WarmingTask::new("hourly", 1, WarmStrategy::Eager)
            .schedule("0 0 * * * *")
            .expect("valid cron");
        let schedule = task.schedule.expect("schedule set");
        assert_eq!(schedule.upcoming(Utc).take(3).count(), 3);
    }
}

//! Event-driven invalidation.
//!
//! An event resolves to its enabled rules; each rule's patterns are rendered
//! against the event context and applied with the rule's strategy. Cascades
//! are walked depth-first with an explicit worklist, and a rule reached twice
//! within one trigger is applied once, even across several root rules.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::adapter::StoreAdapter;
use super::edge::EdgeCachePolicy;
use super::lock::{rw_read, rw_write};
use super::pattern::{has_wildcard, render_template};
use super::rules::{InvalidationRule, InvalidationStrategy, RuleError, RuleRegistry};
use super::stale::StaleMarkers;
use super::tasks::BackgroundTasks;

const SOURCE: &str = "cache::invalidation";

pub(crate) const METRIC_INVALIDATION_KEYS: &str = "cachekeeper_invalidation_keys_total";
pub(crate) const METRIC_INVALIDATION_DISPATCH_MS: &str = "cachekeeper_invalidation_dispatch_ms";

/// Event context: placeholder name to value.
pub type EventContext = HashMap<String, String>;

/// What one dispatch did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub event: String,
    /// Rules applied, in dispatch order.
    pub rules_applied: Vec<String>,
    pub keys_deleted: u64,
    pub keys_marked_stale: u64,
    /// Patterns handed to delayed tasks.
    pub delayed_scheduled: u64,
    pub store_errors: u64,
    pub edge_purges_queued: u64,
}

impl InvalidationReport {
    fn new(event: &str) -> Self {
        Self {
            event: event.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct InvalidationCounters {
    dispatches: AtomicU64,
    keys_deleted: AtomicU64,
    keys_marked_stale: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationStats {
    pub dispatches: u64,
    pub keys_deleted: u64,
    pub keys_marked_stale: u64,
    pub store_errors: u64,
}

/// Deletion half of the engine, cloneable into delayed tasks.
#[derive(Clone)]
struct Deleter {
    adapter: Arc<StoreAdapter>,
    counters: Arc<InvalidationCounters>,
}

impl Deleter {
    /// Delete literal keys directly and wildcard patterns by scan.
    /// Returns `(deleted, errors)`.
    async fn delete_patterns(&self, patterns: &[String], strategy: &'static str) -> (u64, u64) {
        let mut deleted = 0;
        let mut errors = 0;
        for pattern in patterns {
            let outcome = if has_wildcard(pattern) {
                self.adapter.try_scan_delete(pattern).await
            } else {
                self.adapter.try_delete(pattern).await.map(u64::from)
            };
            match outcome {
                Ok(count) => deleted += count,
                Err(_) => errors += 1,
            }
        }
        self.record(deleted, errors, strategy);
        (deleted, errors)
    }

    /// Scan-and-delete every pattern, literal or not.
    async fn scan_patterns(&self, patterns: &[String]) -> (u64, u64) {
        let mut deleted = 0;
        let mut errors = 0;
        for pattern in patterns {
            match self.adapter.try_scan_delete(pattern).await {
                Ok(count) => deleted += count,
                Err(_) => errors += 1,
            }
        }
        self.record(deleted, errors, "pattern");
        (deleted, errors)
    }

    fn record(&self, deleted: u64, errors: u64, strategy: &'static str) {
        self.counters.keys_deleted.fetch_add(deleted, Ordering::Relaxed);
        self.counters.store_errors.fetch_add(errors, Ordering::Relaxed);
        counter!(METRIC_INVALIDATION_KEYS, "strategy" => strategy).increment(deleted);
    }
}

pub struct InvalidationEngine {
    registry: RwLock<RuleRegistry>,
    deleter: Deleter,
    stale: StaleMarkers,
    edge: Arc<EdgeCachePolicy>,
    tasks: Arc<BackgroundTasks>,
}

impl InvalidationEngine {
    pub fn new(
        registry: RuleRegistry,
        adapter: Arc<StoreAdapter>,
        stale: StaleMarkers,
        edge: Arc<EdgeCachePolicy>,
        tasks: Arc<BackgroundTasks>,
    ) -> Self {
        Self {
            registry: RwLock::new(registry),
            deleter: Deleter {
                adapter,
                counters: Arc::new(InvalidationCounters::default()),
            },
            stale,
            edge,
            tasks,
        }
    }

    pub fn register_rule(&self, rule: InvalidationRule) -> Result<(), RuleError> {
        rw_write(&self.registry, SOURCE, "register_rule").register(rule)
    }

    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        rw_write(&self.registry, SOURCE, "set_rule_enabled").set_enabled(name, enabled)
    }

    pub fn rules(&self) -> Vec<InvalidationRule> {
        rw_read(&self.registry, SOURCE, "rules").rules().to_vec()
    }

    pub fn stats(&self) -> InvalidationStats {
        let counters = &self.deleter.counters;
        InvalidationStats {
            dispatches: counters.dispatches.load(Ordering::Relaxed),
            keys_deleted: counters.keys_deleted.load(Ordering::Relaxed),
            keys_marked_stale: counters.keys_marked_stale.load(Ordering::Relaxed),
            store_errors: counters.store_errors.load(Ordering::Relaxed),
        }
    }

    /// Dispatch every enabled rule bound to `event`.
    ///
    /// Store failures are counted in the report; dispatch continues past them.
    #[instrument(skip(self, context))]
    pub async fn trigger_invalidation(&self, event: &str, context: &EventContext) -> InvalidationReport {
        let started = Instant::now();
        let mut report = InvalidationReport::new(event);
        let roots: Vec<InvalidationRule> = rw_read(&self.registry, SOURCE, "rules_for_event")
            .rules_for_event(event)
            .into_iter()
            .cloned()
            .collect();

        if roots.is_empty() {
            debug!("No invalidation rules bound to event");
            return report;
        }

        let mut applied = HashSet::new();
        for root in roots {
            self.dispatch(root, context, &mut applied, &mut report).await;
        }
        self.finish(&report, started);
        report
    }

    /// Dispatch one rule by name regardless of its trigger event.
    pub async fn invalidate_rule(&self, name: &str, context: &EventContext) -> Option<InvalidationReport> {
        let rule = rw_read(&self.registry, SOURCE, "invalidate_rule").get(name).cloned()?;
        let started = Instant::now();
        let mut report = InvalidationReport::new(&rule.trigger_event);
        self.dispatch(rule, context, &mut HashSet::new(), &mut report).await;
        self.finish(&report, started);
        Some(report)
    }

    /// Scan-and-delete one pattern outside any rule.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let (deleted, _) = self.deleter.scan_patterns(&[pattern.to_string()]).await;
        info!(pattern, deleted, "Ad-hoc pattern invalidation");
        deleted
    }

    fn finish(&self, report: &InvalidationReport, started: Instant) {
        self.deleter
            .counters
            .dispatches
            .fetch_add(1, Ordering::Relaxed);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_INVALIDATION_DISPATCH_MS, "event" => report.event.clone()).record(elapsed_ms);
        info!(
            event = %report.event,
            rules = ?report.rules_applied,
            keys_deleted = report.keys_deleted,
            keys_marked_stale = report.keys_marked_stale,
            delayed = report.delayed_scheduled,
            store_errors = report.store_errors,
            elapsed_ms,
            "Invalidation dispatched"
        );
    }

    async fn dispatch(
        &self,
        root: InvalidationRule,
        context: &EventContext,
        applied: &mut HashSet<String>,
        report: &mut InvalidationReport,
    ) {
        let mut worklist = vec![root];

        while let Some(rule) = worklist.pop() {
            if !applied.insert(rule.name.clone()) {
                debug!(rule = %rule.name, "Rule already applied for this trigger; skipped");
                continue;
            }

            let patterns = render_all(&rule.name, &rule.key_patterns, context);
            match rule.strategy {
                InvalidationStrategy::Immediate => {
                    let (deleted, errors) = self.deleter.delete_patterns(&patterns, "immediate").await;
                    report.keys_deleted += deleted;
                    report.store_errors += errors;
                }
                InvalidationStrategy::Delayed => {
                    self.schedule_delayed(&rule, patterns, report);
                }
                InvalidationStrategy::Lazy => {
                    let marked = self.stale.mark(&patterns).await;
                    self.deleter
                        .counters
                        .keys_marked_stale
                        .fetch_add(marked, Ordering::Relaxed);
                    report.keys_marked_stale += marked;
                }
                InvalidationStrategy::Cascade => {
                    let (deleted, errors) = self.deleter.delete_patterns(&patterns, "cascade").await;
                    report.keys_deleted += deleted;
                    report.store_errors += errors;

                    let registry = rw_read(&self.registry, SOURCE, "cascade");
                    // Reverse so the first-named child is dispatched first.
                    for child in rule.cascade_to.iter().rev() {
                        match registry.get(child) {
                            Some(child) if child.enabled => worklist.push(child.clone()),
                            Some(child) => debug!(rule = %child.name, "Cascade target disabled"),
                            None => warn!(rule = %rule.name, cascade_target = %child, "Cascade target vanished"),
                        }
                    }
                }
                InvalidationStrategy::Pattern => {
                    let (deleted, errors) = self.deleter.scan_patterns(&patterns).await;
                    report.keys_deleted += deleted;
                    report.store_errors += errors;
                }
            }

            if matches!(
                rule.strategy,
                InvalidationStrategy::Cascade | InvalidationStrategy::Pattern
            ) && !rule.edge_purge_paths.is_empty()
            {
                let paths = render_all(&rule.name, &rule.edge_purge_paths, context);
                self.edge.purge_in_background(paths);
                report.edge_purges_queued += 1;
            }

            report.rules_applied.push(rule.name);
        }
    }

    fn schedule_delayed(&self, rule: &InvalidationRule, patterns: Vec<String>, report: &mut InvalidationReport) {
        let delay = rule.delay.unwrap_or(Duration::ZERO);
        let deleter = self.deleter.clone();
        let name = rule.name.clone();
        let scheduled = patterns.len() as u64;
        let spawned = self.tasks.spawn(format!("delayed:{name}"), move |mut signal| async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let (deleted, _) = deleter.delete_patterns(&patterns, "delayed").await;
                    info!(rule = %name, deleted, "Delayed invalidation applied");
                }
                _ = signal.cancelled() => {
                    debug!(rule = %name, "Delayed invalidation cancelled by shutdown");
                }
            }
        });
        if spawned {
            report.delayed_scheduled += scheduled;
        }
    }
}

/// Render templates, warning about placeholders the context did not bind.
fn render_all(rule: &str, templates: &[String], context: &EventContext) -> Vec<String> {
    templates
        .iter()
        .map(|template| {
            let rendered = render_template(template, context);
            if !rendered.unresolved.is_empty() {
                warn!(
                    rule,
                    template = %template,
                    missing = ?rendered.unresolved,
                    "Unbound placeholder left literal"
                );
            }
            rendered.value
        })
        .collect()
}

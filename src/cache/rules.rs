//! Invalidation rules and their registry.
//!
//! A rule binds a domain event to key patterns and a strategy. Cascade rules
//! name other rules to dispatch after their own deletions. The registry
//! refuses cascade targets that do not exist and cascade graphs with cycles.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::pattern::has_wildcard;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule name must not be empty")]
    EmptyName,
    #[error("rule `{0}` has no trigger event")]
    EmptyEvent(String),
    #[error("rule `{0}` is already registered")]
    Duplicate(String),
    #[error("rule `{rule}` cascades to unknown rule `{target}`")]
    UnknownCascadeTarget { rule: String, target: String },
    #[error("cascade cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("delayed rule `{0}` needs a non-zero delay")]
    MissingDelay(String),
    #[error("lazy rule `{rule}` can only mark literal keys, got `{pattern}`")]
    WildcardInLazy { rule: String, pattern: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationStrategy {
    /// Delete matching keys now.
    Immediate,
    /// Delete matching keys after the rule's delay.
    Delayed,
    /// Mark keys stale; the next read misses.
    Lazy,
    /// Delete now, then dispatch the named rules.
    Cascade,
    /// Scan-and-delete every pattern.
    Pattern,
}

impl InvalidationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Delayed => "delayed",
            Self::Lazy => "lazy",
            Self::Cascade => "cascade",
            Self::Pattern => "pattern",
        }
    }
}

impl fmt::Display for InvalidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationRule {
    pub name: String,
    pub trigger_event: String,
    pub key_patterns: Vec<String>,
    pub strategy: InvalidationStrategy,
    #[serde(with = "duration_secs")]
    pub delay: Option<Duration>,
    pub cascade_to: Vec<String>,
    /// Edge paths purged after cascade or pattern dispatch.
    pub edge_purge_paths: Vec<String>,
    pub enabled: bool,
}

impl InvalidationRule {
    pub fn new(
        name: impl Into<String>,
        trigger_event: impl Into<String>,
        strategy: InvalidationStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            trigger_event: trigger_event.into(),
            key_patterns: Vec::new(),
            strategy,
            delay: None,
            cascade_to: Vec::new(),
            edge_purge_paths: Vec::new(),
            enabled: true,
        }
    }

    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn cascade<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cascade_to.extend(targets.into_iter().map(Into::into));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn purge_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edge_purge_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn check(&self) -> Result<(), RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::EmptyName);
        }
        if self.trigger_event.trim().is_empty() {
            return Err(RuleError::EmptyEvent(self.name.clone()));
        }
        if self.strategy == InvalidationStrategy::Delayed
            && self.delay.is_none_or(|delay| delay.is_zero())
        {
            return Err(RuleError::MissingDelay(self.name.clone()));
        }
        if self.strategy == InvalidationStrategy::Lazy
            && let Some(pattern) = self.key_patterns.iter().find(|p| has_wildcard(p))
        {
            return Err(RuleError::WildcardInLazy {
                rule: self.name.clone(),
                pattern: pattern.clone(),
            });
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(delay) => serializer.serialize_some(&delay.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }
}

/// Rules in registration order, indexed by name and trigger event.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<InvalidationRule>,
    by_name: HashMap<String, usize>,
    by_event: HashMap<String, Vec<usize>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the standard clinical-domain rules.
    pub fn with_builtin_rules() -> Result<Self, RuleError> {
        let mut registry = Self::new();
        registry.register_all(builtin_rules())?;
        Ok(registry)
    }

    /// Register a batch in order; cascade targets may refer forward within
    /// the batch.
    pub fn register_all(&mut self, rules: impl IntoIterator<Item = InvalidationRule>) -> Result<(), RuleError> {
        let mut staged = self.clone();
        for rule in rules {
            rule.check()?;
            staged.insert(rule)?;
        }
        staged.validate()?;
        *self = staged;
        Ok(())
    }

    /// Register one rule. Its cascade targets must already exist.
    pub fn register(&mut self, rule: InvalidationRule) -> Result<(), RuleError> {
        self.register_all([rule])
    }

    fn insert(&mut self, rule: InvalidationRule) -> Result<(), RuleError> {
        if self.by_name.contains_key(&rule.name) {
            return Err(RuleError::Duplicate(rule.name));
        }
        let index = self.rules.len();
        self.by_name.insert(rule.name.clone(), index);
        self.by_event
            .entry(rule.trigger_event.clone())
            .or_default()
            .push(index);
        self.rules.push(rule);
        Ok(())
    }

    /// Check every cascade target exists and the cascade graph is acyclic.
    pub fn validate(&self) -> Result<(), RuleError> {
        for rule in &self.rules {
            for target in &rule.cascade_to {
                if !self.by_name.contains_key(target) {
                    return Err(RuleError::UnknownCascadeTarget {
                        rule: rule.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        let mut done = HashSet::new();
        for rule in &self.rules {
            let mut path = Vec::new();
            self.visit(&rule.name, &mut path, &mut done)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), RuleError> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|seen| *seen == name) {
            let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(name.to_string());
            return Err(RuleError::Cycle(cycle));
        }
        path.push(name);
        if let Some(rule) = self.get(name) {
            for target in &rule.cascade_to {
                self.visit(target, path, done)?;
            }
        }
        path.pop();
        done.insert(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&InvalidationRule> {
        self.by_name.get(name).map(|index| &self.rules[*index])
    }

    /// Enabled rules for `event`, in registration order.
    pub fn rules_for_event(&self, event: &str) -> Vec<&InvalidationRule> {
        self.by_event
            .get(event)
            .map(|indices| {
                indices
                    .iter()
                    .map(|index| &self.rules[*index])
                    .filter(|rule| rule.enabled)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.by_name.get(name) {
            Some(index) => {
                self.rules[*index].enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> &[InvalidationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Rules every deployment starts with.
pub fn builtin_rules() -> Vec<InvalidationRule> {
    use InvalidationStrategy::*;
    vec![
        InvalidationRule::new("patient_records_update", "patient_records_update", Pattern).patterns([
            "query:*:{patient_id}:*",
            "health_record:*:{patient_id}",
            "db:*:health_records:*",
        ]),
        InvalidationRule::new("patient_update", "patient_update", Cascade)
            .patterns(["patient:{patient_id}", "patient:{patient_id}:*"])
            .cascade(["patient_records_update"]),
        InvalidationRule::new("translation_update", "translation_update", Pattern)
            .patterns(["translation:{locale}:*", "query:translation*"])
            .purge_paths(["/i18n/{locale}/*"]),
        InvalidationRule::new("document_rendered", "document_rendered", Lazy)
            .patterns(["document:{document_id}", "document:{document_id}:rendered"]),
        InvalidationRule::new("search_reindex", "search_reindex", Delayed)
            .patterns(["query:search*"])
            .delay(Duration::from_secs(30)),
        InvalidationRule::new("user_profile_update", "user_profile_update", Immediate)
            .patterns(["profile:{user_id}", "query:*:user:{user_id}:*"]),
    ]
}

//! Job classes: payload handlers plus per-class configuration.
//!
//! A job class is a name, a handler (the payload), and options that the
//! manager reads at enqueue and execute time. Options never change after
//! registration; per-call adjustments go through [`JobOverrides`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;

use crate::error::{Error, PayloadError, Result};
use crate::model::{ConflictStrategy, UniquenessStrategy};

/// Default reschedule interval after a lock miss.
pub const DEFAULT_RESCHEDULE_INTERVAL_SECONDS: i64 = 5;

/// The payload. Invoked with the record's ordered arguments.
pub trait JobHandler: Send + Sync {
    fn call(&self, arguments: &[serde_json::Value]) -> std::result::Result<(), PayloadError>;
}

impl<F> JobHandler for F
where
    F: Fn(&[serde_json::Value]) -> std::result::Result<(), PayloadError> + Send + Sync,
{
    fn call(&self, arguments: &[serde_json::Value]) -> std::result::Result<(), PayloadError> {
        self(arguments)
    }
}

/// Per-class configuration read by the manager.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub queue: String,
    pub uniqueness_strategy: UniquenessStrategy,
    pub conflict_strategy: ConflictStrategy,
    /// Whether records dropped by `DropSelf` at enqueue time are persisted
    /// for audit, or silently discarded before reaching storage.
    pub persist_self_dropped_jobs: bool,
    /// Delay before re-dispatch after a uniqueness lock miss.
    pub reschedule_interval: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            uniqueness_strategy: UniquenessStrategy::NoUniqueness,
            conflict_strategy: ConflictStrategy::DoNothing,
            persist_self_dropped_jobs: true,
            reschedule_interval: Duration::seconds(DEFAULT_RESCHEDULE_INTERVAL_SECONDS),
        }
    }
}

impl JobOptions {
    /// Apply per-call overrides, yielding the effective options. The
    /// registered options themselves are never mutated.
    pub fn merged(&self, overrides: &JobOverrides) -> JobOptions {
        JobOptions {
            queue: overrides.queue.clone().unwrap_or_else(|| self.queue.clone()),
            uniqueness_strategy: overrides
                .uniqueness_strategy
                .unwrap_or(self.uniqueness_strategy),
            conflict_strategy: overrides.conflict_strategy.unwrap_or(self.conflict_strategy),
            persist_self_dropped_jobs: overrides
                .persist_self_dropped_jobs
                .unwrap_or(self.persist_self_dropped_jobs),
            reschedule_interval: overrides
                .reschedule_interval
                .unwrap_or(self.reschedule_interval),
        }
    }
}

/// Immutable bag of per-call option overrides, built fluently and handed to
/// `JobManager::set`.
#[derive(Debug, Clone, Default)]
pub struct JobOverrides {
    pub queue: Option<String>,
    pub uniqueness_strategy: Option<UniquenessStrategy>,
    pub conflict_strategy: Option<ConflictStrategy>,
    pub persist_self_dropped_jobs: Option<bool>,
    pub reschedule_interval: Option<Duration>,
}

impl JobOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn uniqueness_strategy(mut self, strategy: UniquenessStrategy) -> Self {
        self.uniqueness_strategy = Some(strategy);
        self
    }

    pub fn conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = Some(strategy);
        self
    }

    pub fn persist_self_dropped_jobs(mut self, persist: bool) -> Self {
        self.persist_self_dropped_jobs = Some(persist);
        self
    }

    pub fn reschedule_interval(mut self, interval: Duration) -> Self {
        self.reschedule_interval = Some(interval);
        self
    }

    /// Later overrides win field-by-field.
    pub fn merge(mut self, other: JobOverrides) -> Self {
        if other.queue.is_some() {
            self.queue = other.queue;
        }
        if other.uniqueness_strategy.is_some() {
            self.uniqueness_strategy = other.uniqueness_strategy;
        }
        if other.conflict_strategy.is_some() {
            self.conflict_strategy = other.conflict_strategy;
        }
        if other.persist_self_dropped_jobs.is_some() {
            self.persist_self_dropped_jobs = other.persist_self_dropped_jobs;
        }
        if other.reschedule_interval.is_some() {
            self.reschedule_interval = other.reschedule_interval;
        }
        self
    }
}

struct RegisteredJob {
    options: JobOptions,
    handler: Arc<dyn JobHandler>,
}

/// All known job classes, keyed by class name.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        job_class: impl Into<String>,
        options: JobOptions,
        handler: impl JobHandler + 'static,
    ) {
        self.jobs.insert(
            job_class.into(),
            RegisteredJob {
                options,
                handler: Arc::new(handler),
            },
        );
    }

    pub fn options(&self, job_class: &str) -> Result<&JobOptions> {
        self.jobs
            .get(job_class)
            .map(|job| &job.options)
            .ok_or_else(|| Error::UnknownJobClass(job_class.to_string()))
    }

    pub fn handler(&self, job_class: &str) -> Result<Arc<dyn JobHandler>> {
        self.jobs
            .get(job_class)
            .map(|job| Arc::clone(&job.handler))
            .ok_or_else(|| Error::UnknownJobClass(job_class.to_string()))
    }

    /// Reschedule interval for a class; falls back to the default when the
    /// class is no longer registered, so stale records can still be swept.
    pub fn reschedule_interval(&self, job_class: &str) -> Duration {
        self.jobs
            .get(job_class)
            .map(|job| job.options.reschedule_interval)
            .unwrap_or_else(|| Duration::seconds(DEFAULT_RESCHEDULE_INTERVAL_SECONDS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_overrides_win_field_by_field() {
        let options = JobOptions::default();
        let merged = options.merged(
            &JobOverrides::new()
                .queue("critical")
                .uniqueness_strategy(UniquenessStrategy::UntilExecuted),
        );

        assert_eq!(merged.queue, "critical");
        assert_eq!(
            merged.uniqueness_strategy,
            UniquenessStrategy::UntilExecuted
        );
        // Untouched fields keep the class defaults.
        assert_eq!(merged.conflict_strategy, ConflictStrategy::DoNothing);
        assert!(merged.persist_self_dropped_jobs);
    }

    #[test]
    fn unknown_class_lookup_fails() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.options("Ghost"),
            Err(Error::UnknownJobClass(_))
        ));
        assert!(matches!(
            registry.handler("Ghost"),
            Err(Error::UnknownJobClass(_))
        ));
    }
}

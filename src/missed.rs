//! Detection and recovery of jobs that were scheduled but never executed.
//!
//! A missed job has no completed/dropped/failed timestamp and is deemed
//! overdue by the injected time-based policy. The detector re-dispatches
//! each through the transport; the scheduler registers the periodic sweep
//! with an external recurring-job facility.

use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::config::{Config, MissedJobPolicy, validate_cron};
use crate::error::Result;
use crate::model::JobRecord;
use crate::registry::JobRegistry;
use crate::repository::Repository;
use crate::transport::{ExecutionTransport, RecurringJobRegistrar, ScheduleAt};

/// Name the periodic sweep is registered under. Fixed so repeated
/// registration replaces rather than duplicates the entry.
pub const MISSED_JOBS_SCHEDULE_NAME: &str = "reliq-missed-jobs";

/// Periodic sweep that finds stuck records and re-dispatches them.
pub struct MissedJobs {
    policy: MissedJobPolicy,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn ExecutionTransport>,
}

impl MissedJobs {
    pub fn new(config: &Config, transport: Arc<dyn ExecutionTransport>) -> Self {
        Self {
            policy: Arc::clone(&config.missed_job_policy),
            clock: Arc::clone(&config.clock),
            transport,
        }
    }

    /// All records the policy deems overdue.
    pub fn all(&self, repository: &Repository) -> Result<Vec<JobRecord>> {
        let now = self.clock.now();
        repository.missed_jobs(|record| (self.policy)(record, now))
    }

    /// Re-dispatch every missed record through the transport, after each
    /// job class's reschedule interval. Returns how many were rescheduled.
    pub fn invoke(&self, repository: &Repository, registry: &JobRegistry) -> Result<usize> {
        let missed = self.all(repository)?;
        for record in &missed {
            let interval = registry.reschedule_interval(&record.job_class);
            self.transport
                .schedule(record.id, ScheduleAt::In(interval))?;
        }
        if !missed.is_empty() {
            info!(count = missed.len(), "rescheduled missed jobs");
        }
        Ok(missed.len())
    }
}

/// Registers the missed-job sweep with a recurring-job facility under a
/// fixed name and cron expression.
#[derive(Debug)]
pub struct MissedJobsScheduler {
    cron: String,
    job_class: String,
}

impl MissedJobsScheduler {
    /// Validates the cron expression up front; an invalid expression fails
    /// here, before any registration attempt.
    pub fn new(cron: &str, job_class: impl Into<String>) -> Result<Self> {
        validate_cron(cron)?;
        Ok(Self {
            cron: cron.to_string(),
            job_class: job_class.into(),
        })
    }

    pub fn schedule(&self, registrar: &mut dyn RecurringJobRegistrar) -> Result<()> {
        registrar.register(MISSED_JOBS_SCHEDULE_NAME, &self.cron, &self.job_class)
    }
}

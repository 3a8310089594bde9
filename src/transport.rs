//! Capability traits for the external collaborators.
//!
//! The execution transport is the at-least-once multi-worker queue that
//! later calls back into `JobManager::perform`. The recurring-job registrar
//! is the cron facility the missed-job sweep registers itself with. Both
//! are consumed, never implemented, by this crate; tests supply doubles.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::JobId;

/// When the transport should invoke `perform(job_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAt {
    Now,
    In(Duration),
    At(DateTime<Utc>),
}

/// Opaque identifier returned by the transport when scheduling, stored on
/// the record for traceability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle(pub String);

impl std::fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The at-least-once execution transport. Must re-invoke `perform(job_id)`
/// at or after the requested time, and must tolerate `perform` being a
/// no-op for an already-unprocessable id.
pub trait ExecutionTransport: Send + Sync {
    fn schedule(&self, job_id: JobId, when: ScheduleAt) -> Result<ExecutionHandle>;
}

/// Recurring-job facility. `register` is idempotent by `name`: registering
/// the same name again replaces rather than duplicates the entry.
pub trait RecurringJobRegistrar {
    fn register(&mut self, name: &str, cron: &str, job_class: &str) -> Result<()>;
}

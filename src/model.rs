//! Core data model.
//!
//! A job record is one row per logical enqueue attempt. Its digest groups
//! records that represent the same logical work; the uniqueness and
//! conflict strategies only ever compare records sharing a digest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, PayloadError, Result};
use crate::memory::MemoryMonitor;
use crate::transport::ExecutionHandle;

// ---------------------------------------------------------------------------
// Job Id
// ---------------------------------------------------------------------------

/// Newtype for job record IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Strategy tags
// ---------------------------------------------------------------------------

/// Execution-time mutual exclusion policy for same-digest records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniquenessStrategy {
    /// Execute unconditionally, no locking.
    NoUniqueness,
    /// Lock, drop duplicates before running the payload.
    UntilExecuting,
    /// Lock, run the payload, then drop duplicates queued meanwhile.
    UntilExecuted,
    /// Lock only for the execution window; never drops duplicates.
    WhileExecuting,
}

impl UniquenessStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            UniquenessStrategy::NoUniqueness => "no_uniqueness",
            UniquenessStrategy::UntilExecuting => "until_executing",
            UniquenessStrategy::UntilExecuted => "until_executed",
            UniquenessStrategy::WhileExecuting => "while_executing",
        }
    }
}

impl std::str::FromStr for UniquenessStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no_uniqueness" => Ok(UniquenessStrategy::NoUniqueness),
            "until_executing" => Ok(UniquenessStrategy::UntilExecuting),
            "until_executed" => Ok(UniquenessStrategy::UntilExecuted),
            "while_executing" => Ok(UniquenessStrategy::WhileExecuting),
            other => Err(Error::UnknownUniquenessStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Display for UniquenessStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Enqueue-time policy governing which of a new record and its same-digest
/// predecessors survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    DoNothing,
    /// Existing in-flight duplicates win; the new record drops itself.
    DropSelf,
    /// The new record supersedes all unprocessed predecessors.
    Replace,
}

impl ConflictStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::DoNothing => "do_nothing",
            ConflictStrategy::DropSelf => "drop_self",
            ConflictStrategy::Replace => "replace",
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "do_nothing" => Ok(ConflictStrategy::DoNothing),
            "drop_self" => Ok(ConflictStrategy::DropSelf),
            "replace" => Ok(ConflictStrategy::Replace),
            other => Err(Error::UnknownConflictStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job Record
// ---------------------------------------------------------------------------

/// Attributes for building a new, unpersisted record.
#[derive(Debug, Clone)]
pub struct JobAttributes {
    pub job_class: String,
    pub arguments: Vec<serde_json::Value>,
    pub digest: String,
    pub queue: String,
    pub uniqueness_strategy: UniquenessStrategy,
    pub conflict_strategy: ConflictStrategy,
    pub enqueued_at: DateTime<Utc>,
}

/// One persisted job record. Never hard-deleted; terminal records stay
/// around for audit and digest-scoped duplicate queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_class: String,
    pub arguments: Vec<serde_json::Value>,
    pub digest: String,
    pub queue: String,
    pub uniqueness_strategy: UniquenessStrategy,
    pub conflict_strategy: ConflictStrategy,

    pub enqueued_at: DateTime<Utc>,
    pub execute_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub dropped_at: Option<DateTime<Utc>>,
    pub dropped_by_job_id: Option<JobId>,

    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub attempts: u32,

    pub memory_usage_before_processing_in_megabytes: Option<f64>,
    pub memory_usage_after_processing_in_megabytes: Option<f64>,
    pub memory_usage_change_in_megabytes: Option<f64>,

    /// Opaque handle returned by the execution transport.
    pub external_execution_id: Option<ExecutionHandle>,

    /// True while the record carries unsaved changes.
    #[serde(skip)]
    pub(crate) dirty: bool,
}

impl JobRecord {
    /// Build an unpersisted record. Rejects structurally invalid attributes.
    pub fn new(attrs: JobAttributes) -> Result<Self> {
        if attrs.job_class.is_empty() {
            return Err(Error::Validation("job_class must not be empty".into()));
        }
        if attrs.digest.is_empty() {
            return Err(Error::Validation("digest must not be empty".into()));
        }
        if attrs.queue.is_empty() {
            return Err(Error::Validation("queue must not be empty".into()));
        }

        Ok(Self {
            id: JobId::new(),
            job_class: attrs.job_class,
            arguments: attrs.arguments,
            digest: attrs.digest,
            queue: attrs.queue,
            uniqueness_strategy: attrs.uniqueness_strategy,
            conflict_strategy: attrs.conflict_strategy,
            enqueued_at: attrs.enqueued_at,
            execute_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            dropped_at: None,
            dropped_by_job_id: None,
            error_type: None,
            error_message: None,
            attempts: 0,
            memory_usage_before_processing_in_megabytes: None,
            memory_usage_after_processing_in_megabytes: None,
            memory_usage_change_in_megabytes: None,
            external_execution_id: None,
            dirty: true,
        })
    }

    pub fn completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn dropped(&self) -> bool {
        self.dropped_at.is_some()
    }

    /// A record that has reached a terminal outcome must never be
    /// dispatched to a payload again.
    pub fn unprocessable(&self) -> bool {
        self.completed() || self.dropped()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Mark dispatch: record pre-execution memory, bump attempts.
    pub fn start(&mut self, memory_monitor: &dyn MemoryMonitor, clock: &dyn Clock) -> Result<()> {
        if self.unprocessable() {
            return Err(Error::Unprocessable(self.id));
        }
        self.memory_usage_before_processing_in_megabytes = Some(memory_monitor.mb());
        self.attempts += 1;
        self.started_at = Some(clock.now());
        self.dirty = true;
        Ok(())
    }

    /// Terminal success. Clears stale drop/failure markers so a record that
    /// eventually succeeds reports a clean completed state.
    pub fn complete(&mut self, memory_monitor: &dyn MemoryMonitor, clock: &dyn Clock) {
        let after = memory_monitor.mb();
        self.memory_usage_after_processing_in_megabytes = Some(after);
        self.memory_usage_change_in_megabytes = self
            .memory_usage_before_processing_in_megabytes
            .map(|before| after - before);
        self.completed_at = Some(clock.now());
        self.dropped_at = None;
        self.dropped_by_job_id = None;
        self.error_type = None;
        self.error_message = None;
        self.failed_at = None;
        self.dirty = true;
    }

    /// Record a payload failure. Not terminal; the record can be retried by
    /// the transport or by missed-job rescheduling.
    pub fn fail(&mut self, error: &PayloadError, clock: &dyn Clock) {
        self.error_type = Some(error.error_type.clone());
        self.error_message = Some(error.message.clone());
        self.failed_at = Some(clock.now());
        self.dirty = true;
    }

    /// Terminal drop, attributed to the record that caused it.
    pub fn mark_dropped(&mut self, dropped_by_job_id: JobId, clock: &dyn Clock) {
        self.dropped_at = Some(clock.now());
        self.dropped_by_job_id = Some(dropped_by_job_id);
        self.dirty = true;
    }

    /// Store the transport handle and resolved execution time.
    pub fn assign_execution(&mut self, execute_at: DateTime<Utc>, handle: ExecutionHandle) {
        self.execute_at = Some(execute_at);
        self.external_execution_id = Some(handle);
        self.dirty = true;
    }
}

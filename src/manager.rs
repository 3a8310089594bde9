//! Enqueue and execute orchestration. The public API of the overlay.
//!
//! The manager owns the repository and job registry, and wires the digest
//! generator, conflict resolution, the execution transport, and the
//! uniqueness strategies together. All state transitions go through here.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;

use crate::clock::Clock;
use crate::config::{Config, LockTtlPolicy};
use crate::conflict;
use crate::digest::DigestGenerator;
use crate::error::Result;
use crate::lock::Locker;
use crate::memory::MemoryMonitor;
use crate::model::{JobAttributes, JobId, JobRecord};
use crate::registry::{JobOptions, JobOverrides, JobRegistry};
use crate::repository::Repository;
use crate::transport::{ExecutionTransport, ScheduleAt};
use crate::uniqueness::UniquenessExecutor;

/// Orchestrates the enqueue and execute paths.
pub struct JobManager {
    repository: Repository,
    registry: JobRegistry,
    transport: Arc<dyn ExecutionTransport>,
    locker: Arc<dyn Locker>,
    clock: Arc<dyn Clock>,
    memory_monitor: Arc<dyn MemoryMonitor>,
    digest_generator: DigestGenerator,
    lock_ttl: LockTtlPolicy,
}

impl JobManager {
    pub fn new(
        config: &Config,
        repository: Repository,
        registry: JobRegistry,
        transport: Arc<dyn ExecutionTransport>,
        locker: Arc<dyn Locker>,
    ) -> Self {
        Self {
            repository,
            registry,
            transport,
            locker,
            clock: Arc::clone(&config.clock),
            memory_monitor: Arc::clone(&config.memory_monitor),
            digest_generator: DigestGenerator::new(Arc::clone(&config.digest_backend)),
            lock_ttl: Arc::clone(&config.lock_ttl),
        }
    }

    /// Read access to the underlying records, for inspection and sweeps.
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Enqueue for immediate execution. Returns the persisted record id, or
    /// None when conflict resolution dropped the job before dispatch.
    pub fn perform_async(&mut self, job_class: &str, arguments: Vec<Value>) -> Result<Option<JobId>> {
        self.enqueue(job_class, arguments, ScheduleAt::Now, None)
    }

    /// Enqueue for execution after an interval.
    pub fn perform_in(
        &mut self,
        job_class: &str,
        interval: Duration,
        arguments: Vec<Value>,
    ) -> Result<Option<JobId>> {
        self.enqueue(job_class, arguments, ScheduleAt::In(interval), None)
    }

    /// Enqueue for execution at an explicit time.
    pub fn perform_at(
        &mut self,
        job_class: &str,
        time: DateTime<Utc>,
        arguments: Vec<Value>,
    ) -> Result<Option<JobId>> {
        self.enqueue(job_class, arguments, ScheduleAt::At(time), None)
    }

    /// Returns a scheduling adapter that applies the given overrides to
    /// subsequent enqueues without mutating the job class registration.
    pub fn set(&mut self, job_class: impl Into<String>, overrides: JobOverrides) -> BoundJob<'_> {
        BoundJob {
            manager: self,
            job_class: job_class.into(),
            overrides,
        }
    }

    fn enqueue(
        &mut self,
        job_class: &str,
        arguments: Vec<Value>,
        when: ScheduleAt,
        overrides: Option<&JobOverrides>,
    ) -> Result<Option<JobId>> {
        let options = match overrides {
            Some(overrides) => self.registry.options(job_class)?.merged(overrides),
            None => self.registry.options(job_class)?.clone(),
        };
        let mut record = self.create_job(job_class, arguments, &options)?;

        if record.unprocessable() {
            debug!(job_id = %record.id, digest = %record.digest, "dropped at enqueue, not scheduling");
            return Ok(None);
        }

        let handle = self.transport.schedule(record.id, when)?;
        let execute_at = match when {
            ScheduleAt::Now => self.clock.now(),
            ScheduleAt::In(interval) => self.clock.now() + interval,
            ScheduleAt::At(time) => time,
        };
        record.assign_execution(execute_at, handle);
        self.repository.save(&mut record)?;

        debug!(job_id = %record.id, job_class, queue = %record.queue, "job scheduled");
        Ok(Some(record.id))
    }

    /// Build the record and run conflict resolution inside one transaction.
    ///
    /// Persistence policy: classes that persist self-dropped jobs save the
    /// record up front (so DropSelf leaves an audit row); otherwise the
    /// record is only saved when resolution did not drop it.
    fn create_job(
        &mut self,
        job_class: &str,
        arguments: Vec<Value>,
        options: &JobOptions,
    ) -> Result<JobRecord> {
        let digest = self.digest_generator.generate(job_class, &arguments);
        let mut record = self.repository.build(JobAttributes {
            job_class: job_class.to_string(),
            arguments,
            digest,
            queue: options.queue.clone(),
            uniqueness_strategy: options.uniqueness_strategy,
            conflict_strategy: options.conflict_strategy,
            enqueued_at: self.clock.now(),
        })?;

        if options.persist_self_dropped_jobs {
            self.repository.save(&mut record)?;
        }

        let clock = Arc::clone(&self.clock);
        let persist_self_dropped = options.persist_self_dropped_jobs;
        self.repository.with_transaction(|tx| {
            conflict::resolve(tx, &mut record, clock.as_ref())?;
            if persist_self_dropped || !record.dropped() {
                tx.save(&mut record)?;
            }
            Ok(())
        })?;

        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Execute
    // -----------------------------------------------------------------------

    /// Transport callback: execute the record with the given id.
    ///
    /// Idempotent for unprocessable records, guarding against at-least-once
    /// redelivery of an already-finished or dropped record.
    pub fn perform(&mut self, job_id: JobId) -> Result<()> {
        let mut record = self.repository.find(job_id)?;
        if record.unprocessable() {
            debug!(job_id = %record.id, "record already completed or dropped, skipping");
            return Ok(());
        }

        record.start(self.memory_monitor.as_ref(), self.clock.as_ref())?;
        self.repository.save(&mut record)?;

        let mut executor = UniquenessExecutor {
            repository: &mut self.repository,
            registry: &self.registry,
            locker: self.locker.as_ref(),
            lock_ttl: &self.lock_ttl,
            transport: self.transport.as_ref(),
            memory_monitor: self.memory_monitor.as_ref(),
            clock: self.clock.as_ref(),
        };
        executor.execute(&mut record)
    }
}

/// A job class bound to scheduling overrides. Produced by
/// [`JobManager::set`]; immutable — chaining `set` merges into a new value.
pub struct BoundJob<'a> {
    manager: &'a mut JobManager,
    job_class: String,
    overrides: JobOverrides,
}

impl BoundJob<'_> {
    pub fn perform_async(&mut self, arguments: Vec<Value>) -> Result<Option<JobId>> {
        self.manager.enqueue(
            &self.job_class,
            arguments,
            ScheduleAt::Now,
            Some(&self.overrides),
        )
    }

    pub fn perform_in(&mut self, interval: Duration, arguments: Vec<Value>) -> Result<Option<JobId>> {
        self.manager.enqueue(
            &self.job_class,
            arguments,
            ScheduleAt::In(interval),
            Some(&self.overrides),
        )
    }

    pub fn perform_at(
        &mut self,
        time: DateTime<Utc>,
        arguments: Vec<Value>,
    ) -> Result<Option<JobId>> {
        self.manager.enqueue(
            &self.job_class,
            arguments,
            ScheduleAt::At(time),
            Some(&self.overrides),
        )
    }

    /// Layer further overrides on top; later values win field-by-field.
    pub fn set(self, overrides: JobOverrides) -> Self {
        Self {
            manager: self.manager,
            job_class: self.job_class,
            overrides: self.overrides.merge(overrides),
        }
    }
}

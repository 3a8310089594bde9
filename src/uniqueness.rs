//! Execution-time mutual exclusion among same-digest records.
//!
//! Each job record carries a [`UniquenessStrategy`] tag; the executor maps
//! the closed enum to one of four control flows sharing the same lock
//! primitive. Within a digest, exactly one worker holds the lock at a
//! time; every other worker observes a miss and reschedules.

use tracing::debug;

use crate::clock::Clock;
use crate::config::LockTtlPolicy;
use crate::error::{Error, Result};
use crate::lock::Locker;
use crate::memory::MemoryMonitor;
use crate::model::{JobRecord, UniquenessStrategy};
use crate::registry::JobRegistry;
use crate::repository::Repository;
use crate::transport::{ExecutionTransport, ScheduleAt};

/// Dispatches a started record to its resolved strategy. Holds borrows of
/// the manager's collaborators for the duration of one execution.
pub struct UniquenessExecutor<'a> {
    pub repository: &'a mut Repository,
    pub registry: &'a JobRegistry,
    pub locker: &'a dyn Locker,
    pub lock_ttl: &'a LockTtlPolicy,
    pub transport: &'a dyn ExecutionTransport,
    pub memory_monitor: &'a dyn MemoryMonitor,
    pub clock: &'a dyn Clock,
}

impl UniquenessExecutor<'_> {
    pub fn execute(&mut self, record: &mut JobRecord) -> Result<()> {
        match record.uniqueness_strategy {
            UniquenessStrategy::NoUniqueness => self.run_and_finalize(record),
            UniquenessStrategy::UntilExecuting => self.until_executing(record),
            UniquenessStrategy::UntilExecuted => self.until_executed(record),
            UniquenessStrategy::WhileExecuting => self.while_executing(record),
        }
    }

    /// Duplicates are dropped while the lock is held; the payload itself
    /// runs after release. Uniqueness ends once execution begins.
    fn until_executing(&mut self, record: &mut JobRecord) -> Result<()> {
        let mut acquired = false;
        let locker = self.locker;
        let digest = record.digest.clone();
        let ttl = (self.lock_ttl)(record);

        locker.lock(
            &digest,
            ttl,
            Box::new(|locked| {
                if locked {
                    acquired = true;
                    self.drop_duplicates(record)?;
                }
                Ok(())
            }),
        )?;

        if !acquired {
            return self.reschedule(record);
        }
        self.run_and_finalize(record)
    }

    /// Payload runs first, then duplicates queued during execution are
    /// cleaned up — all inside the lock window.
    fn until_executed(&mut self, record: &mut JobRecord) -> Result<()> {
        let mut acquired = false;
        let locker = self.locker;
        let digest = record.digest.clone();
        let ttl = (self.lock_ttl)(record);

        locker.lock(
            &digest,
            ttl,
            Box::new(|locked| {
                if locked {
                    acquired = true;
                    self.run_and_finalize(record)?;
                    self.drop_duplicates(record)?;
                }
                Ok(())
            }),
        )?;

        if !acquired {
            return self.reschedule(record);
        }
        Ok(())
    }

    /// Mutual exclusion scoped strictly to the execution window; no
    /// duplicate is ever dropped.
    fn while_executing(&mut self, record: &mut JobRecord) -> Result<()> {
        let mut acquired = false;
        let locker = self.locker;
        let digest = record.digest.clone();
        let ttl = (self.lock_ttl)(record);

        locker.lock(
            &digest,
            ttl,
            Box::new(|locked| {
                if locked {
                    acquired = true;
                    self.run_and_finalize(record)?;
                }
                Ok(())
            }),
        )?;

        if !acquired {
            return self.reschedule(record);
        }
        Ok(())
    }

    /// Invoke the payload. Success finalizes the record as completed;
    /// failure is captured onto the record, persisted, and re-raised so the
    /// transport's own retry policy governs further attempts.
    fn run_and_finalize(&mut self, record: &mut JobRecord) -> Result<()> {
        let handler = self.registry.handler(&record.job_class)?;

        if let Err(payload_error) = handler.call(&record.arguments) {
            record.fail(&payload_error, self.clock);
            self.repository.save(record)?;
            return Err(Error::Payload(payload_error));
        }

        record.complete(self.memory_monitor, self.clock);
        self.repository.save(record)
    }

    fn drop_duplicates(&mut self, record: &JobRecord) -> Result<()> {
        let dropped = self.repository.drop_unprocessed_jobs_by_digest(
            record.id,
            &record.digest,
            record.id,
            self.clock.now(),
        )?;
        if dropped > 0 {
            debug!(job_id = %record.id, digest = %record.digest, dropped, "dropped duplicate records");
        }
        Ok(())
    }

    /// Lock miss path: ask the transport to re-dispatch this same record
    /// after the job class's reschedule interval. No terminal field moves.
    fn reschedule(&mut self, record: &JobRecord) -> Result<()> {
        let interval = self.registry.reschedule_interval(&record.job_class);
        debug!(job_id = %record.id, digest = %record.digest, interval_s = interval.num_seconds(), "lock miss, rescheduling");
        self.transport.schedule(record.id, ScheduleAt::In(interval))?;
        Ok(())
    }
}

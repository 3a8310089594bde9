//! One explicit configuration value, constructed at process start and
//! passed into the components that need it. No ambient global lookup.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::clock::{Clock, SystemClock};
use crate::digest::{DigestBackend, Sha256Backend};
use crate::error::{Error, Result};
use crate::memory::{MemoryMonitor, ResidentSetMonitor};
use crate::model::JobRecord;

/// Lock TTL per record, in milliseconds.
pub type LockTtlPolicy = Arc<dyn Fn(&JobRecord) -> u64 + Send + Sync>;

/// Decide whether a record without terminal/failure markers is overdue.
pub type MissedJobPolicy = Arc<dyn Fn(&JobRecord, DateTime<Utc>) -> bool + Send + Sync>;

pub const DEFAULT_LOCK_TTL_MILLIS: u64 = 120_000;

/// Every 3 hours (seconds-leading cron form).
pub const DEFAULT_MISSED_JOB_CRON: &str = "0 0 */3 * * *";

const DEFAULT_MISSED_JOB_HOURS: i64 = 3;

/// Operator configuration surface: pluggable clock, hash backend, memory
/// monitor, lock-TTL policy, missed-job policy and cron.
#[derive(Clone)]
pub struct Config {
    pub clock: Arc<dyn Clock>,
    pub memory_monitor: Arc<dyn MemoryMonitor>,
    pub digest_backend: Arc<dyn DigestBackend>,
    pub lock_ttl: LockTtlPolicy,
    pub missed_job_policy: MissedJobPolicy,
    missed_job_cron: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            memory_monitor: Arc::new(ResidentSetMonitor),
            digest_backend: Arc::new(Sha256Backend),
            lock_ttl: Arc::new(|_| DEFAULT_LOCK_TTL_MILLIS),
            missed_job_policy: Arc::new(|record, now| {
                now > record.enqueued_at + Duration::hours(DEFAULT_MISSED_JOB_HOURS)
            }),
            missed_job_cron: DEFAULT_MISSED_JOB_CRON.to_string(),
        }
    }
}

impl Config {
    pub fn missed_job_cron(&self) -> &str {
        &self.missed_job_cron
    }

    /// Replace the missed-job cron expression. An invalid expression fails
    /// here, at configuration time, before any registration attempt.
    pub fn set_missed_job_cron(&mut self, expr: &str) -> Result<()> {
        validate_cron(expr)?;
        self.missed_job_cron = expr.to_string();
        Ok(())
    }
}

pub(crate) fn validate_cron(expr: &str) -> Result<()> {
    Schedule::from_str(expr).map_err(|e| Error::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cron_is_valid() {
        validate_cron(DEFAULT_MISSED_JOB_CRON).unwrap();
    }

    #[test]
    fn invalid_cron_is_rejected_at_configuration_time() {
        let mut config = Config::default();
        let err = config.set_missed_job_cron("every three hours").unwrap_err();
        assert!(matches!(err, Error::InvalidCron { .. }));
        // The previous expression survives a failed set.
        assert_eq!(config.missed_job_cron(), DEFAULT_MISSED_JOB_CRON);
    }

    #[test]
    fn valid_cron_is_accepted() {
        let mut config = Config::default();
        config.set_missed_job_cron("0 */30 * * * *").unwrap();
        assert_eq!(config.missed_job_cron(), "0 */30 * * * *");
    }
}

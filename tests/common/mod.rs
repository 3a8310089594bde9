//! Shared test doubles: recording transport, scripted lockers, registrar.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use reliq::clock::ManualClock;
use reliq::config::Config;
use reliq::error::Result;
use reliq::lock::{InProcessLocker, LockCallback, Locker};
use reliq::memory::FixedMemoryMonitor;
use reliq::model::JobId;
use reliq::transport::{ExecutionHandle, ExecutionTransport, RecurringJobRegistrar, ScheduleAt};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Call at the top of a test to see its tracing output (`RUST_LOG=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config pinned to a manual clock and fixed memory readings.
pub fn test_config(clock: &Arc<ManualClock>) -> Config {
    let mut config = Config::default();
    config.clock = Arc::clone(clock) as Arc<dyn reliq::clock::Clock>;
    config.memory_monitor = Arc::new(FixedMemoryMonitor(128.0));
    config
}

// ---------------------------------------------------------------------------
// Transport double
// ---------------------------------------------------------------------------

/// Records every schedule call and hands out sequential handles.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<(JobId, ScheduleAt)>>,
    counter: AtomicU64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(JobId, ScheduleAt)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl ExecutionTransport for RecordingTransport {
    fn schedule(&self, job_id: JobId, when: ScheduleAt) -> Result<ExecutionHandle> {
        self.calls.lock().unwrap().push((job_id, when));
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionHandle(format!("handle-{n}")))
    }
}

// ---------------------------------------------------------------------------
// Locker doubles
// ---------------------------------------------------------------------------

/// Never grants the lock. Every caller observes a miss.
pub struct DeniedLocker;

impl Locker for DeniedLocker {
    fn lock(&self, _key: &str, _ttl_ms: u64, callback: LockCallback<'_>) -> Result<()> {
        callback(false)
    }
}

/// Shared ordered log of lock and payload events.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Real in-process lock that records acquisition and release ordering.
pub struct LoggingLocker {
    inner: InProcessLocker,
    log: EventLog,
}

impl LoggingLocker {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: InProcessLocker::new(),
            log,
        }
    }
}

impl Locker for LoggingLocker {
    fn lock(&self, key: &str, ttl_ms: u64, callback: LockCallback<'_>) -> Result<()> {
        let log = self.log.clone();
        let result = self.inner.lock(
            key,
            ttl_ms,
            Box::new(move |locked| {
                log.push(if locked { "lock:acquired" } else { "lock:missed" });
                callback(locked)
            }),
        );
        self.log.push("lock:released");
        result
    }
}

// ---------------------------------------------------------------------------
// Recurring-job registrar double
// ---------------------------------------------------------------------------

/// In-memory registrar, idempotent by name like the real facility.
#[derive(Default)]
pub struct FakeRegistrar {
    pub entries: Vec<(String, String, String)>,
}

impl FakeRegistrar {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecurringJobRegistrar for FakeRegistrar {
    fn register(&mut self, name: &str, cron: &str, job_class: &str) -> Result<()> {
        self.entries.retain(|(existing, _, _)| existing != name);
        self.entries
            .push((name.to_string(), cron.to_string(), job_class.to_string()));
        Ok(())
    }
}

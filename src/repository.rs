//! SQLite persistence facade over job records.
//!
//! Single source of truth for record state. WAL mode for concurrent read
//! access. Records are never hard-deleted; terminal rows stay around for
//! audit and digest-scoped duplicate queries.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::model::{JobAttributes, JobId, JobRecord};

/// Storage backend. Owns the SQLite connection.
pub struct Repository {
    conn: Connection,
}

/// Handle for performing repository operations within a transaction.
///
/// All methods delegate to the same SQL logic as `Repository`, but execute
/// against the transaction's connection, so either all operations commit
/// together or none do.
pub struct TxContext<'a> {
    tx: &'a Connection,
}

impl TxContext<'_> {
    pub fn find(&self, id: JobId) -> Result<JobRecord> {
        find_on(self.tx, id)
    }

    pub fn save(&mut self, record: &mut JobRecord) -> Result<()> {
        save_on(self.tx, record)
    }

    pub fn unprocessed_for_digest(&self, digest: &str, exclude_id: JobId) -> Result<Vec<JobRecord>> {
        unprocessed_for_digest_on(self.tx, digest, exclude_id)
    }

    pub fn drop_unprocessed_jobs_by_digest(
        &mut self,
        dropped_by_job_id: JobId,
        digest: &str,
        exclude_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        drop_unprocessed_on(self.tx, dropped_by_job_id, digest, exclude_id, now)
    }
}

impl Repository {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut repository = Self { conn };
        repository.init()?;
        Ok(repository)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut repository = Self { conn };
        repository.init()?;
        Ok(repository)
    }

    fn init(&mut self) -> Result<()> {
        // WAL mode for concurrent readers
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id                      TEXT PRIMARY KEY,
                job_class               TEXT NOT NULL,
                arguments               TEXT NOT NULL DEFAULT '[]',
                digest                  TEXT NOT NULL,
                queue                   TEXT NOT NULL DEFAULT 'default',
                uniqueness_strategy     TEXT NOT NULL DEFAULT 'no_uniqueness',
                conflict_strategy       TEXT NOT NULL DEFAULT 'do_nothing',
                enqueued_at             TEXT NOT NULL,
                execute_at              TEXT,
                started_at              TEXT,
                completed_at            TEXT,
                failed_at               TEXT,
                dropped_at              TEXT,
                dropped_by_job_id       TEXT,
                error_type              TEXT,
                error_message           TEXT,
                attempts                INTEGER NOT NULL DEFAULT 0,
                memory_before_mb        REAL,
                memory_after_mb         REAL,
                memory_change_mb        REAL,
                external_execution_id   TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_digest ON jobs(digest);
            CREATE INDEX IF NOT EXISTS idx_jobs_unprocessed ON jobs(digest)
                WHERE completed_at IS NULL AND dropped_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_jobs_missed ON jobs(enqueued_at)
                WHERE completed_at IS NULL AND dropped_at IS NULL AND failed_at IS NULL;
            ",
        )?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within a SQLite transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let tx = self.conn.transaction()?;
        let mut ctx = TxContext { tx: &tx };
        let result = f(&mut ctx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    pub fn find(&self, id: JobId) -> Result<JobRecord> {
        find_on(&self.conn, id)
    }

    /// Persist the record iff it carries unsaved changes; no-op otherwise.
    pub fn save(&mut self, record: &mut JobRecord) -> Result<()> {
        save_on(&self.conn, record)
    }

    /// Build an unpersisted record from validated attributes.
    pub fn build(&self, attributes: JobAttributes) -> Result<JobRecord> {
        JobRecord::new(attributes)
    }

    /// Build and immediately persist a record.
    pub fn create(&mut self, attributes: JobAttributes) -> Result<JobRecord> {
        let mut record = JobRecord::new(attributes)?;
        self.save(&mut record)?;
        Ok(record)
    }

    /// Records with no completed/dropped/failed timestamp that the injected
    /// policy deems overdue.
    pub fn missed_jobs(&self, policy: impl Fn(&JobRecord) -> bool) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM jobs
             WHERE completed_at IS NULL AND dropped_at IS NULL AND failed_at IS NULL
             ORDER BY enqueued_at ASC",
        )?;

        let records = stmt
            .query_map([], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records.into_iter().filter(|record| policy(record)).collect())
    }

    /// Every record sharing a digest, terminal or not. Audit query.
    pub fn for_digest(&self, digest: &str) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM jobs WHERE digest = ?1 ORDER BY enqueued_at ASC",
        )?;

        let records = stmt
            .query_map(params![digest], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Same-digest records with neither `completed_at` nor `dropped_at`
    /// set, excluding one id.
    pub fn unprocessed_for_digest(&self, digest: &str, exclude_id: JobId) -> Result<Vec<JobRecord>> {
        unprocessed_for_digest_on(&self.conn, digest, exclude_id)
    }

    /// Atomically mark every unprocessed same-digest record (minus the
    /// excluded id) as dropped by the given record. Returns the drop count.
    pub fn drop_unprocessed_jobs_by_digest(
        &mut self,
        dropped_by_job_id: JobId,
        digest: &str,
        exclude_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.with_transaction(|tx| {
            tx.drop_unprocessed_jobs_by_digest(dropped_by_job_id, digest, exclude_id, now)
        })
    }
}

// ---------------------------------------------------------------------------
// Inner functions — accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn find_on(conn: &Connection, id: JobId) -> Result<JobRecord> {
    conn.query_row(
        "SELECT * FROM jobs WHERE id = ?1",
        params![id.0.to_string()],
        row_to_record,
    )
    .optional()?
    .ok_or(Error::NotFound(id))
}

fn save_on(conn: &Connection, record: &mut JobRecord) -> Result<()> {
    if !record.is_dirty() {
        return Ok(());
    }

    conn.execute(
        "INSERT INTO jobs (
            id, job_class, arguments, digest, queue,
            uniqueness_strategy, conflict_strategy,
            enqueued_at, execute_at, started_at, completed_at, failed_at,
            dropped_at, dropped_by_job_id, error_type, error_message,
            attempts, memory_before_mb, memory_after_mb, memory_change_mb,
            external_execution_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                  ?15, ?16, ?17, ?18, ?19, ?20, ?21)
        ON CONFLICT(id) DO UPDATE SET
            job_class = excluded.job_class,
            arguments = excluded.arguments,
            digest = excluded.digest,
            queue = excluded.queue,
            uniqueness_strategy = excluded.uniqueness_strategy,
            conflict_strategy = excluded.conflict_strategy,
            enqueued_at = excluded.enqueued_at,
            execute_at = excluded.execute_at,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            failed_at = excluded.failed_at,
            dropped_at = excluded.dropped_at,
            dropped_by_job_id = excluded.dropped_by_job_id,
            error_type = excluded.error_type,
            error_message = excluded.error_message,
            attempts = excluded.attempts,
            memory_before_mb = excluded.memory_before_mb,
            memory_after_mb = excluded.memory_after_mb,
            memory_change_mb = excluded.memory_change_mb,
            external_execution_id = excluded.external_execution_id",
        params![
            record.id.0.to_string(),
            record.job_class,
            serde_json::to_string(&record.arguments).unwrap_or_else(|_| "[]".to_string()),
            record.digest,
            record.queue,
            record.uniqueness_strategy.as_str(),
            record.conflict_strategy.as_str(),
            record.enqueued_at.to_rfc3339(),
            record.execute_at.map(|t| t.to_rfc3339()),
            record.started_at.map(|t| t.to_rfc3339()),
            record.completed_at.map(|t| t.to_rfc3339()),
            record.failed_at.map(|t| t.to_rfc3339()),
            record.dropped_at.map(|t| t.to_rfc3339()),
            record.dropped_by_job_id.map(|id| id.0.to_string()),
            record.error_type,
            record.error_message,
            record.attempts,
            record.memory_usage_before_processing_in_megabytes,
            record.memory_usage_after_processing_in_megabytes,
            record.memory_usage_change_in_megabytes,
            record.external_execution_id.as_ref().map(|h| h.0.clone()),
        ],
    )?;

    record.mark_clean();
    Ok(())
}

fn unprocessed_for_digest_on(
    conn: &Connection,
    digest: &str,
    exclude_id: JobId,
) -> Result<Vec<JobRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs
         WHERE digest = ?1 AND id != ?2
         AND completed_at IS NULL AND dropped_at IS NULL
         ORDER BY enqueued_at ASC",
    )?;

    let records = stmt
        .query_map(params![digest, exclude_id.0.to_string()], row_to_record)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(records)
}

/// One UPDATE statement: with SQLite's single-writer transaction this is
/// the row-locked bulk drop the duplicate cleanup requires.
fn drop_unprocessed_on(
    conn: &Connection,
    dropped_by_job_id: JobId,
    digest: &str,
    exclude_id: JobId,
    now: DateTime<Utc>,
) -> Result<usize> {
    let dropped = conn.execute(
        "UPDATE jobs SET dropped_at = ?1, dropped_by_job_id = ?2
         WHERE digest = ?3 AND id != ?4
         AND completed_at IS NULL AND dropped_at IS NULL",
        params![
            now.to_rfc3339(),
            dropped_by_job_id.0.to_string(),
            digest,
            exclude_id.0.to_string(),
        ],
    )?;
    Ok(dropped)
}

// ---------------------------------------------------------------------------
// Row parsing
// ---------------------------------------------------------------------------

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: JobId(parse_col(row, 0)?),
        job_class: row.get(1)?,
        arguments: serde_json::from_str(&row.get::<_, String>(2)?)
            .unwrap_or_else(|_| Vec::new()),
        digest: row.get(3)?,
        queue: row.get(4)?,
        uniqueness_strategy: parse_col(row, 5)?,
        conflict_strategy: parse_col(row, 6)?,
        enqueued_at: parse_col(row, 7)?,
        execute_at: parse_opt_col(row, 8)?,
        started_at: parse_opt_col(row, 9)?,
        completed_at: parse_opt_col(row, 10)?,
        failed_at: parse_opt_col(row, 11)?,
        dropped_at: parse_opt_col(row, 12)?,
        dropped_by_job_id: parse_opt_col::<uuid::Uuid>(row, 13)?.map(JobId),
        error_type: row.get(14)?,
        error_message: row.get(15)?,
        attempts: row.get(16)?,
        memory_usage_before_processing_in_megabytes: row.get(17)?,
        memory_usage_after_processing_in_megabytes: row.get(18)?,
        memory_usage_change_in_megabytes: row.get(19)?,
        external_execution_id: row
            .get::<_, Option<String>>(20)?
            .map(crate::transport::ExecutionHandle),
        dirty: false,
    })
}

fn parse_col<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    row.get::<_, String>(idx)?.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_col<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    row.get::<_, Option<String>>(idx)?
        .map(|s| {
            s.parse().map_err(|e: T::Err| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        })
        .transpose()
}

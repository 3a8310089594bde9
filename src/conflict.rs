//! Enqueue-time conflict resolution among same-digest records.
//!
//! Evaluated once per enqueue, inside the enqueue transaction, against the
//! records sharing the new record's digest. Note the documented gap: this
//! check is not guarded by the execution-time lock, so two records with an
//! identical digest can both be persisted if enqueued within a narrow race
//! window.

use tracing::debug;

use crate::clock::Clock;
use crate::error::Result;
use crate::model::{ConflictStrategy, JobRecord};
use crate::repository::TxContext;

/// Apply the new record's conflict strategy. May mutate the record itself
/// (DropSelf) or its persisted same-digest predecessors (Replace).
pub fn resolve(tx: &mut TxContext, record: &mut JobRecord, clock: &dyn Clock) -> Result<()> {
    match record.conflict_strategy {
        ConflictStrategy::DoNothing => Ok(()),
        ConflictStrategy::DropSelf => {
            if !tx.unprocessed_for_digest(&record.digest, record.id)?.is_empty() {
                debug!(job_id = %record.id, digest = %record.digest, "duplicate in flight, dropping self");
                record.mark_dropped(record.id, clock);
            }
            Ok(())
        }
        ConflictStrategy::Replace => {
            let dropped = tx.drop_unprocessed_jobs_by_digest(
                record.id,
                &record.digest,
                record.id,
                clock.now(),
            )?;
            if dropped > 0 {
                debug!(job_id = %record.id, digest = %record.digest, dropped, "replaced unprocessed predecessors");
            }
            Ok(())
        }
    }
}

//! Backfill of records persisted without linkage.
//!
//! Shared by the reconciler's batch phase and the writer's catch-up. The
//! fill is conditional on the record still lacking a hash, and the value
//! written depends only on the record and its predecessor, so concurrent or
//! repeated fills of the same record agree and the losers are no-ops.

use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::audit::hash::compute_hash;
use crate::audit::record::{AuditRecord, GENESIS_PREVIOUS_HASH};
use crate::database::Queries;
use crate::error::LedgerResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillStep {
    /// This call linked the record; carries the new hash
    Filled(String),
    /// Someone else linked it first, or it was never unhashed
    AlreadyHashed,
    /// Predecessor exists but is not linked yet
    PredecessorPending,
    /// No record at `sequence_number - 1`; linking would forge a second genesis
    PredecessorMissing,
}

pub async fn backfill_record(pool: &SqlitePool, record: &AuditRecord) -> LedgerResult<BackfillStep> {
    if record.is_hashed() {
        return Ok(BackfillStep::AlreadyHashed);
    }

    let previous_hash = if record.is_genesis() {
        GENESIS_PREVIOUS_HASH.to_string()
    } else {
        match Queries::record_at(pool, &record.tenant_slug, record.sequence_number - 1).await? {
            Some(AuditRecord {
                record_hash: Some(hash),
                ..
            }) => hash,
            Some(_) => return Ok(BackfillStep::PredecessorPending),
            None => {
                warn!(
                    "Cannot backfill {}: no record at sequence {}",
                    record.summary(),
                    record.sequence_number - 1
                );
                return Ok(BackfillStep::PredecessorMissing);
            }
        }
    };

    let record_hash = compute_hash(record, &previous_hash);
    if Queries::fill_linkage(pool, record.id, &previous_hash, &record_hash).await? {
        debug!("Backfilled audit record: {}", record.summary());
        Ok(BackfillStep::Filled(record_hash))
    } else {
        Ok(BackfillStep::AlreadyHashed)
    }
}

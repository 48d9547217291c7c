//! Ledger Writer
//!
//! Extends a tenant's chain by exactly one record at a time. Two layers keep
//! the chain linear:
//!
//! - a keyed async mutex per tenant serialises writers in this process, and
//!   never blocks writers of other tenants;
//! - the `UNIQUE (tenant_slug, sequence_number)` constraint makes the insert
//!   conditional, so a writer outside this process that took the same slot
//!   first turns the insert into a conflict, retried against a fresh head.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::audit::backfill::{backfill_record, BackfillStep};
use crate::audit::record::{AuditEvent, AuditRecord, GENESIS_PREVIOUS_HASH};
use crate::config::WriterConfig;
use crate::database::Queries;
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Linkage {
    /// Hash now, linking to the current head
    Immediate,
    /// Leave both hashes empty for the reconciler
    Deferred,
}

#[derive(Clone)]
pub struct LedgerWriter {
    pool: SqlitePool,
    tenant_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    max_attempts: u32,
}

impl LedgerWriter {
    pub fn new(pool: SqlitePool, config: &WriterConfig) -> Self {
        Self::with_max_attempts(pool, config.max_append_attempts)
    }

    pub fn with_max_attempts(pool: SqlitePool, max_attempts: u32) -> Self {
        Self {
            pool,
            tenant_locks: Arc::new(Mutex::new(HashMap::new())),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Append an event to the tenant's chain and return the sealed record.
    ///
    /// The record is hashed and linked before it is persisted, and is
    /// visible to readers as soon as this returns.
    pub async fn append(&self, tenant_slug: &str, event: AuditEvent) -> LedgerResult<AuditRecord> {
        event.validate_external(tenant_slug)?;
        self.extend_chain(tenant_slug, event, Linkage::Immediate)
            .await
    }

    /// Append a record the ledger writes about itself, such as a security
    /// alert. Skips the reserved-shape check callers are held to.
    pub(crate) async fn append_system(
        &self,
        tenant_slug: &str,
        event: AuditEvent,
    ) -> LedgerResult<AuditRecord> {
        event.validate(tenant_slug)?;
        self.extend_chain(tenant_slug, event, Linkage::Immediate)
            .await
    }

    /// Persist an event at the next sequence number without linking it.
    ///
    /// This is the path for legacy and bulk-import writers. The record stays
    /// unhashed until the reconciler (or the next `append` on the tenant)
    /// backfills it.
    pub async fn append_deferred(
        &self,
        tenant_slug: &str,
        event: AuditEvent,
    ) -> LedgerResult<AuditRecord> {
        event.validate_external(tenant_slug)?;
        self.extend_chain(tenant_slug, event, Linkage::Deferred)
            .await
    }

    async fn tenant_lock(&self, tenant_slug: &str) -> Arc<Mutex<()>> {
        let mut locks = self.tenant_locks.lock().await;
        locks
            .entry(tenant_slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the tenant's lock entry once no other writer holds or awaits it.
    ///
    /// Clones are only taken under the map lock, so a strong count of two
    /// (the map and `lock`) means nobody else can reach this mutex.
    async fn release_tenant_lock(&self, tenant_slug: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.tenant_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(tenant_slug);
        }
    }

    async fn extend_chain(
        &self,
        tenant_slug: &str,
        event: AuditEvent,
        linkage: Linkage,
    ) -> LedgerResult<AuditRecord> {
        let lock = self.tenant_lock(tenant_slug).await;
        let result = {
            let _guard = lock.lock().await;
            self.extend_locked(tenant_slug, event, linkage).await
        };
        self.release_tenant_lock(tenant_slug, lock).await;
        result
    }

    async fn extend_locked(
        &self,
        tenant_slug: &str,
        event: AuditEvent,
        linkage: Linkage,
    ) -> LedgerResult<AuditRecord> {
        for attempt in 1..=self.max_attempts {
            let head = match linkage {
                Linkage::Immediate => self.linked_head(tenant_slug).await?,
                Linkage::Deferred => Queries::chain_head(&self.pool, tenant_slug).await?,
            };

            let sequence_number = head.as_ref().map_or(0, |head| head.sequence_number + 1);
            let timestamp = not_before(head.as_ref().map(|head| head.timestamp));
            let record =
                AuditRecord::unlinked(tenant_slug, sequence_number, event.clone(), timestamp);
            let record = match linkage {
                Linkage::Immediate => {
                    let previous_hash = head
                        .as_ref()
                        .and_then(|head| head.record_hash.as_deref())
                        .unwrap_or(GENESIS_PREVIOUS_HASH);
                    record.seal(previous_hash)
                }
                Linkage::Deferred => record,
            };

            if Queries::insert_record(&self.pool, &record).await? {
                debug!("Appended audit record: {}", record.summary());
                return Ok(record);
            }

            warn!(
                "Chain head of tenant {} moved during append (attempt {}/{}), retrying",
                tenant_slug, attempt, self.max_attempts
            );
        }

        Err(LedgerError::ConcurrencyConflict {
            tenant_slug: tenant_slug.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Current head, guaranteed hashed.
    ///
    /// A head left unhashed by the deferred path is backfilled first, so a
    /// new record never links to an unlinked predecessor.
    async fn linked_head(&self, tenant_slug: &str) -> LedgerResult<Option<AuditRecord>> {
        let head = Queries::chain_head(&self.pool, tenant_slug).await?;
        match head {
            Some(ref record) if !record.is_hashed() => {
                self.catch_up(tenant_slug).await?;
                match Queries::chain_head(&self.pool, tenant_slug).await? {
                    Some(record) if !record.is_hashed() => Err(LedgerError::CorruptRecord(format!(
                        "Chain head {} cannot be linked: an earlier record is missing",
                        record.summary()
                    ))),
                    head => Ok(head),
                }
            }
            head => Ok(head),
        }
    }

    async fn catch_up(&self, tenant_slug: &str) -> LedgerResult<()> {
        let pending = Queries::unhashed_for_tenant(&self.pool, tenant_slug).await?;
        debug!(
            "Linking {} deferred records of tenant {} before append",
            pending.len(),
            tenant_slug
        );

        for record in &pending {
            match backfill_record(&self.pool, record).await? {
                BackfillStep::Filled(_) | BackfillStep::AlreadyHashed => {}
                BackfillStep::PredecessorPending | BackfillStep::PredecessorMissing => break,
            }
        }
        Ok(())
    }
}

/// Wall-clock now, but never earlier than the head's timestamp
fn not_before(floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match floor {
        Some(floor) if floor > now => floor,
        _ => now,
    }
}

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::audit::hash::format_timestamp;
use crate::audit::query::AuditQuery;
use crate::audit::record::AuditRecord;
use crate::error::{LedgerError, LedgerResult};

const RECORD_COLUMNS: &str = "id, tenant_slug, sequence_number, entity_type, entity_id, action, \
     actor, timestamp, change_details, previous_record_hash, record_hash, correlation_id";

// Lowest unhashed sequence per tenant, and whether a record precedes it.
// Anything below the lowest unhashed record is hashed, so an existing
// predecessor is always linkable.
const FIRST_PENDING_CTE: &str = "WITH first_pending AS ( \
     SELECT f.tenant_slug, f.sequence_number, \
            (f.sequence_number = 0 OR EXISTS ( \
                SELECT 1 FROM audit_records p \
                WHERE p.tenant_slug = f.tenant_slug \
                  AND p.sequence_number = f.sequence_number - 1)) AS linkable \
     FROM ( \
         SELECT tenant_slug, MIN(sequence_number) AS sequence_number \
         FROM audit_records WHERE record_hash IS NULL GROUP BY tenant_slug \
     ) f \
 )";

pub struct Queries;

impl Queries {
    /// Highest-sequence record of a tenant, hashed or not
    pub async fn chain_head(
        pool: &SqlitePool,
        tenant_slug: &str,
    ) -> LedgerResult<Option<AuditRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM audit_records WHERE tenant_slug = ? \
             ORDER BY sequence_number DESC LIMIT 1",
            RECORD_COLUMNS
        ))
        .bind(tenant_slug)
        .fetch_optional(pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Insert a new record.
    ///
    /// Returns `false` when the tenant already has a record at this sequence
    /// number, i.e. another writer extended the chain first.
    pub async fn insert_record(pool: &SqlitePool, record: &AuditRecord) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_records
            (id, tenant_slug, sequence_number, entity_type, entity_id, action, actor,
             timestamp, change_details, previous_record_hash, record_hash, correlation_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.tenant_slug)
        .bind(record.sequence_number as i64)
        .bind(&record.entity_type)
        .bind(record.entity_id.map(|id| id.to_string()))
        .bind(&record.action)
        .bind(&record.actor)
        .bind(format_timestamp(&record.timestamp))
        .bind(&record.change_details)
        .bind(&record.previous_record_hash)
        .bind(&record.record_hash)
        .bind(&record.correlation_id)
        .execute(pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
            Err(e) => Err(LedgerError::DatabaseError(format!(
                "Failed to insert audit record: {}",
                e
            ))),
        }
    }

    /// Record at an exact position of a tenant's chain
    pub async fn record_at(
        pool: &SqlitePool,
        tenant_slug: &str,
        sequence_number: u64,
    ) -> LedgerResult<Option<AuditRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM audit_records WHERE tenant_slug = ? AND sequence_number = ?",
            RECORD_COLUMNS
        ))
        .bind(tenant_slug)
        .bind(sequence_number as i64)
        .fetch_optional(pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Oldest linkable unhashed records across all tenants, in chain order.
    ///
    /// A tenant whose lowest unhashed record has no predecessor can never be
    /// backfilled; its rows are left out so they cannot fill every batch and
    /// hold back the other tenants. See [`stalled_tenants`](Self::stalled_tenants).
    pub async fn unhashed_records(pool: &SqlitePool, limit: u32) -> LedgerResult<Vec<AuditRecord>> {
        let rows = sqlx::query(&format!(
            "{} SELECT {} FROM audit_records \
             WHERE record_hash IS NULL \
               AND tenant_slug IN (SELECT tenant_slug FROM first_pending WHERE linkable) \
             ORDER BY tenant_slug ASC, sequence_number ASC LIMIT ?",
            FIRST_PENDING_CTE, RECORD_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Tenants whose lowest unhashed record is missing its predecessor
    pub async fn stalled_tenants(pool: &SqlitePool) -> LedgerResult<Vec<String>> {
        let rows = sqlx::query(&format!(
            "{} SELECT tenant_slug FROM first_pending WHERE NOT linkable ORDER BY tenant_slug ASC",
            FIRST_PENDING_CTE
        ))
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("tenant_slug").map_err(LedgerError::from))
            .collect()
    }

    /// Every unhashed record of one tenant, in chain order
    pub async fn unhashed_for_tenant(
        pool: &SqlitePool,
        tenant_slug: &str,
    ) -> LedgerResult<Vec<AuditRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_records WHERE tenant_slug = ? AND record_hash IS NULL \
             ORDER BY sequence_number ASC",
            RECORD_COLUMNS
        ))
        .bind(tenant_slug)
        .fetch_all(pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Fill the linkage of a record that has none.
    ///
    /// Conditional on `record_hash IS NULL`, so it can never overwrite a
    /// hashed record. Returns whether this call did the fill.
    pub async fn fill_linkage(
        pool: &SqlitePool,
        id: Uuid,
        previous_record_hash: &str,
        record_hash: &str,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE audit_records
            SET previous_record_hash = ?, record_hash = ?
            WHERE id = ? AND record_hash IS NULL
            "#,
        )
        .bind(previous_record_hash)
        .bind(record_hash)
        .bind(id.to_string())
        .execute(pool)
        .await
        .map_err(|e| LedgerError::DatabaseError(format!("Failed to backfill record {}: {}", id, e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Full chain of a tenant, ascending by sequence
    pub async fn tenant_chain(
        pool: &SqlitePool,
        tenant_slug: &str,
    ) -> LedgerResult<Vec<AuditRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_records WHERE tenant_slug = ? ORDER BY sequence_number ASC",
            RECORD_COLUMNS
        ))
        .bind(tenant_slug)
        .fetch_all(pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Last `window` records of a tenant, ascending by sequence
    pub async fn trailing_window(
        pool: &SqlitePool,
        tenant_slug: &str,
        window: u32,
    ) -> LedgerResult<Vec<AuditRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_records WHERE tenant_slug = ? \
             ORDER BY sequence_number DESC LIMIT ?",
            RECORD_COLUMNS
        ))
        .bind(tenant_slug)
        .bind(window as i64)
        .fetch_all(pool)
        .await?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<LedgerResult<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    pub async fn tenants(pool: &SqlitePool) -> LedgerResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT tenant_slug FROM audit_records ORDER BY tenant_slug ASC",
        )
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("tenant_slug").map_err(LedgerError::from))
            .collect()
    }

    /// Whether `actor` already raised an alert with `action` naming `record_id`
    pub async fn alert_exists(
        pool: &SqlitePool,
        tenant_slug: &str,
        entity_type: &str,
        actor: &str,
        record_id: Uuid,
        action: &str,
    ) -> LedgerResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS alerts
            FROM audit_records
            WHERE tenant_slug = ? AND entity_type = ? AND actor = ? AND entity_id = ? AND action = ?
            "#,
        )
        .bind(tenant_slug)
        .bind(entity_type)
        .bind(actor)
        .bind(record_id.to_string())
        .bind(action)
        .fetch_one(pool)
        .await?;

        Ok(row.try_get::<i64, _>("alerts")? > 0)
    }

    /// Filtered retrieval, newest first
    pub async fn query_records(
        pool: &SqlitePool,
        tenant_slug: &str,
        filter: &AuditQuery,
    ) -> LedgerResult<Vec<AuditRecord>> {
        // A negative LIMIT is unbounded in SQLite
        let limit = filter.limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_records \
             WHERE tenant_slug = ?1 \
               AND (?2 IS NULL OR entity_type = ?2) \
               AND (?3 IS NULL OR entity_id = ?3) \
               AND (?4 IS NULL OR actor = ?4) \
               AND (?5 IS NULL OR timestamp >= ?5) \
               AND (?6 IS NULL OR timestamp <= ?6) \
             ORDER BY timestamp DESC, sequence_number DESC \
             LIMIT ?7",
            RECORD_COLUMNS
        ))
        .bind(tenant_slug)
        .bind(&filter.entity_type)
        .bind(filter.entity_id.map(|id| id.to_string()))
        .bind(&filter.actor)
        .bind(filter.from.as_ref().map(format_timestamp))
        .bind(filter.to.as_ref().map(format_timestamp))
        .bind(limit)
        .fetch_all(pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &SqliteRow) -> LedgerResult<AuditRecord> {
    let id: String = row.try_get("id")?;
    let sequence_number: i64 = row.try_get("sequence_number")?;
    let entity_id: Option<String> = row.try_get("entity_id")?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(AuditRecord {
        id: parse_uuid(&id)?,
        tenant_slug: row.try_get("tenant_slug")?,
        sequence_number: u64::try_from(sequence_number).map_err(|_| {
            LedgerError::CorruptRecord(format!(
                "Record {} has negative sequence number {}",
                id, sequence_number
            ))
        })?,
        entity_type: row.try_get("entity_type")?,
        entity_id: entity_id.as_deref().map(parse_uuid).transpose()?,
        action: row.try_get("action")?,
        actor: row.try_get("actor")?,
        timestamp: parse_timestamp(&timestamp)?,
        change_details: row.try_get("change_details")?,
        previous_record_hash: row.try_get("previous_record_hash")?,
        record_hash: row.try_get("record_hash")?,
        correlation_id: row.try_get("correlation_id")?,
    })
}

fn parse_uuid(value: &str) -> LedgerResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| LedgerError::CorruptRecord(format!("Invalid UUID {:?}: {}", value, e)))
}

fn parse_timestamp(value: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::CorruptRecord(format!("Invalid timestamp {:?}: {}", value, e)))
}

#![allow(dead_code)]

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use tenant_ledger::audit::{AuditEvent, AuditRecord, ChainReconciler, LedgerWriter};
use tenant_ledger::config::ReconcilerConfig;
use tenant_ledger::database::{Database, Queries};

pub const OAKLAND: &str = "oakland-unified";
pub const BERKELEY: &str = "berkeley-unified";

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory()
        .await
        .expect("Failed to create test database")
}

pub fn test_writer(db: &Database) -> LedgerWriter {
    LedgerWriter::with_max_attempts(db.pool().clone(), 5)
}

/// Reconciler that sweeps on every cycle
pub fn test_reconciler(db: &Database, writer: &LedgerWriter) -> ChainReconciler {
    let config = ReconcilerConfig {
        interval_secs: 1,
        validation_every_cycles: 1,
        failure_cooldown_secs: 1,
        ..ReconcilerConfig::default()
    };
    ChainReconciler::new(db.pool().clone(), writer.clone(), config)
}

/// A student update event with a JSON snapshot
pub fn student_event(actor: &str, name: &str) -> AuditEvent {
    AuditEvent::new("Student", "UPDATE", actor)
        .with_entity_id(Uuid::new_v4())
        .with_snapshot(format!(r#"{{"name":"{}"}}"#, name))
}

/// Append `count` student events and return the sealed records
pub async fn append_students(
    writer: &LedgerWriter,
    tenant_slug: &str,
    count: usize,
) -> Vec<AuditRecord> {
    let mut records = Vec::with_capacity(count);
    for i in 0..count {
        let record = writer
            .append(tenant_slug, student_event("admin1", &format!("Student {}", i)))
            .await
            .expect("Failed to append audit record");
        records.push(record);
    }
    records
}

pub async fn chain(db: &Database, tenant_slug: &str) -> Vec<AuditRecord> {
    Queries::tenant_chain(db.pool(), tenant_slug)
        .await
        .expect("Failed to load chain")
}

/// Unhashed record at `sequence_number` with nothing before it
pub async fn insert_orphan(pool: &SqlitePool, tenant_slug: &str, sequence_number: u64) -> AuditRecord {
    let orphan = AuditRecord::unlinked(
        tenant_slug,
        sequence_number,
        student_event("legacy-import", "Orphan"),
        Utc::now(),
    );
    let inserted = Queries::insert_record(pool, &orphan)
        .await
        .expect("Failed to insert orphan");
    assert!(inserted);
    orphan
}

/// Lift the append-only guard so a test can play the attacker
pub async fn allow_tampering(pool: &SqlitePool) {
    sqlx::query("DROP TRIGGER IF EXISTS audit_records_hashed_immutable")
        .execute(pool)
        .await
        .expect("Failed to drop immutability trigger");
}

/// Overwrite a record's change details behind the ledger's back
pub async fn tamper_change_details(
    pool: &SqlitePool,
    tenant_slug: &str,
    sequence_number: u64,
    change_details: &str,
) {
    allow_tampering(pool).await;
    let result = sqlx::query(
        "UPDATE audit_records SET change_details = ? WHERE tenant_slug = ? AND sequence_number = ?",
    )
    .bind(change_details)
    .bind(tenant_slug)
    .bind(sequence_number as i64)
    .execute(pool)
    .await
    .expect("Failed to tamper with record");
    assert_eq!(result.rows_affected(), 1);
}

/// Clear the linkage of every record of a tenant, as if never backfilled
pub async fn reset_linkage(pool: &SqlitePool, tenant_slug: &str) {
    allow_tampering(pool).await;
    sqlx::query(
        "UPDATE audit_records SET previous_record_hash = NULL, record_hash = NULL WHERE tenant_slug = ?",
    )
    .bind(tenant_slug)
    .execute(pool)
    .await
    .expect("Failed to reset linkage");
}

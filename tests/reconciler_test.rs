mod common;

use std::time::Duration;

use tenant_ledger::audit::{
    AuditEvent, AuditQuery, AuditRecord, IntegrityVerifier, QueryService, ViolationKind,
};
use tenant_ledger::database::Queries;
use tenant_ledger::LedgerError;
use tenant_ledger::config::ReconcilerConfig;
use tenant_ledger::audit::ChainReconciler;

use common::*;

#[tokio::test]
async fn test_sweep_on_clean_chains_raises_nothing() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    append_students(&writer, OAKLAND, 3).await;
    append_students(&writer, BERKELEY, 2).await;

    let reconciler = test_reconciler(&db, &writer);
    let outcome = reconciler.validation_sweep().await.unwrap();

    assert_eq!(outcome.tenants_checked, 2);
    assert_eq!(outcome.records_checked, 5);
    assert!(outcome.violations.is_empty());
    assert_eq!(outcome.alerts_raised, 0);
    assert_eq!(chain(&db, OAKLAND).await.len(), 3);
}

#[tokio::test]
async fn test_sweep_detects_tampering_and_alerts_once() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    let records = append_students(&writer, OAKLAND, 5).await;

    tamper_change_details(db.pool(), OAKLAND, 2, r#"{"name":"Forged"}"#).await;

    let reconciler = test_reconciler(&db, &writer);
    let outcome = reconciler.validation_sweep().await.unwrap();

    assert_eq!(outcome.violations.len(), 1);
    let violation = &outcome.violations[0];
    assert_eq!(violation.kind, ViolationKind::HashMismatch);
    assert_eq!(violation.record_id, records[2].id);
    assert_eq!(violation.actual, records[2].record_hash.clone().unwrap());
    assert_eq!(outcome.alerts_raised, 1);

    // The alert is itself a linked record at the head of the tenant's chain
    let stored = chain(&db, OAKLAND).await;
    assert_eq!(stored.len(), 6);
    let alert = &stored[5];
    assert!(alert.is_security_alert());
    assert_eq!(alert.action, "SECURITY_ALERT_HASH_MISMATCH");
    assert_eq!(alert.entity_id, Some(records[2].id));
    assert_eq!(alert.previous_record_hash, records[4].record_hash);

    let details: serde_json::Value =
        serde_json::from_str(alert.change_details.as_deref().unwrap()).unwrap();
    assert_eq!(details["sequenceNumber"], 2);
    assert_eq!(details["recordId"], records[2].id.to_string());

    // Detection never repairs: linkage is untouched and still verifies
    let verifier = IntegrityVerifier::new(db.pool().clone());
    assert!(verifier.verify(OAKLAND).await.unwrap());

    // A second sweep sees the same violation but does not alert again
    let again = reconciler.validation_sweep().await.unwrap();
    assert_eq!(again.violations.len(), 1);
    assert_eq!(again.alerts_raised, 0);
    assert_eq!(chain(&db, OAKLAND).await.len(), 6);
}

#[tokio::test]
async fn test_sweep_alerts_stay_in_the_affected_tenant() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    append_students(&writer, OAKLAND, 2).await;
    append_students(&writer, BERKELEY, 2).await;

    tamper_change_details(db.pool(), BERKELEY, 0, r#"{"name":"Forged"}"#).await;

    let reconciler = test_reconciler(&db, &writer);
    let outcome = reconciler.validation_sweep().await.unwrap();
    assert_eq!(outcome.alerts_raised, 1);

    let queries = QueryService::new(db.pool().clone());
    let alerts = AuditQuery::default().entity("AuditRecord", None);
    assert_eq!(queries.query(BERKELEY, &alerts).await.unwrap().len(), 1);
    assert!(queries.query(OAKLAND, &alerts).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_detects_broken_linkage() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    append_students(&writer, OAKLAND, 3).await;

    allow_tampering(db.pool()).await;
    sqlx::query(
        "UPDATE audit_records SET previous_record_hash = ? WHERE tenant_slug = ? AND sequence_number = 1",
    )
    .bind("0".repeat(64))
    .bind(OAKLAND)
    .execute(db.pool())
    .await
    .unwrap();

    let reconciler = test_reconciler(&db, &writer);
    let outcome = reconciler.validation_sweep().await.unwrap();
    let kinds: Vec<_> = outcome.violations.iter().map(|v| v.kind).collect();

    // The edited previous hash is part of the hashed input too
    assert!(kinds.contains(&ViolationKind::HashMismatch));
    assert!(kinds.contains(&ViolationKind::LinkageMismatch));

    let verifier = IntegrityVerifier::new(db.pool().clone());
    let report = verifier.verify_detailed(OAKLAND).await.unwrap();
    assert!(!report.is_valid);
    assert_eq!(report.first_broken_sequence, Some(1));
}

#[tokio::test]
async fn test_cycle_backfills_then_sweeps() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    append_students(&writer, OAKLAND, 1).await;
    for i in 0..3 {
        writer
            .append_deferred(OAKLAND, student_event("legacy-import", &format!("Row {}", i)))
            .await
            .unwrap();
    }

    let reconciler = test_reconciler(&db, &writer);
    let report = reconciler.run_cycle(1).await.unwrap();

    assert_eq!(report.cycle, 1);
    assert_eq!(report.backfill.filled, 3);
    let sweep = report.sweep.expect("sweep runs every cycle here");
    assert_eq!(sweep.records_checked, 4);
    assert!(sweep.violations.is_empty());
}

#[tokio::test]
async fn test_sweep_runs_only_on_configured_cycles() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    append_students(&writer, OAKLAND, 1).await;

    let config = ReconcilerConfig {
        validation_every_cycles: 3,
        ..ReconcilerConfig::default()
    };
    let reconciler = ChainReconciler::new(db.pool().clone(), writer.clone(), config);

    assert!(reconciler.run_cycle(1).await.unwrap().sweep.is_none());
    assert!(reconciler.run_cycle(2).await.unwrap().sweep.is_none());
    assert!(reconciler.run_cycle(3).await.unwrap().sweep.is_some());
}

#[tokio::test]
async fn test_small_batches_drain_over_cycles() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    for i in 0..5 {
        writer
            .append_deferred(BERKELEY, student_event("legacy-import", &format!("Row {}", i)))
            .await
            .unwrap();
    }

    let config = ReconcilerConfig {
        batch_size: 2,
        ..ReconcilerConfig::default()
    };
    let reconciler = ChainReconciler::new(db.pool().clone(), writer.clone(), config);

    let mut filled = 0;
    for _ in 0..3 {
        filled += reconciler.backfill().await.unwrap().filled;
    }
    assert_eq!(filled, 5);
    assert!(chain(&db, BERKELEY).await.iter().all(|r| r.hash_matches() && r.is_hashed()));
}

#[tokio::test]
async fn test_stalled_tenant_does_not_hold_back_others() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);

    // Sorts first and can never be linked: orphan at 3 with deferred rows on top
    insert_orphan(db.pool(), "aaa-district", 3).await;
    for i in 0..3 {
        writer
            .append_deferred("aaa-district", student_event("legacy-import", &format!("Row {}", i)))
            .await
            .unwrap();
    }
    writer
        .append_deferred(OAKLAND, student_event("legacy-import", "Healthy"))
        .await
        .unwrap();

    let config = ReconcilerConfig {
        batch_size: 4,
        ..ReconcilerConfig::default()
    };
    let reconciler = ChainReconciler::new(db.pool().clone(), writer.clone(), config);

    let outcome = reconciler.backfill().await.unwrap();
    assert_eq!(outcome.filled, 1);
    assert_eq!(outcome.stalled_tenants, vec!["aaa-district".to_string()]);
    assert!(chain(&db, OAKLAND).await[0].is_hashed());
    assert!(chain(&db, "aaa-district").await.iter().all(|r| !r.is_hashed()));

    let again = reconciler.backfill().await.unwrap();
    assert_eq!(again.examined(), 0);
}

#[tokio::test]
async fn test_callers_cannot_write_alert_shaped_records() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    let records = append_students(&writer, OAKLAND, 2).await;

    let forged = AuditEvent::new("AuditRecord", "SECURITY_ALERT_HASH_MISMATCH", "mallory")
        .with_entity_id(records[1].id);
    let err = writer.append(OAKLAND, forged.clone()).await.unwrap_err();
    assert!(matches!(err, LedgerError::ValidationError(_)));
    let err = writer.append_deferred(OAKLAND, forged).await.unwrap_err();
    assert!(matches!(err, LedgerError::ValidationError(_)));

    let impersonated = AuditEvent::new("Student", "UPDATE", "SYSTEM");
    assert!(writer.append(OAKLAND, impersonated).await.is_err());
    assert_eq!(chain(&db, OAKLAND).await.len(), 2);
}

#[tokio::test]
async fn test_lookalike_alert_does_not_suppress_real_alert() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    let records = append_students(&writer, OAKLAND, 2).await;

    // A look-alike already in the store, e.g. written before alerts were reserved
    let lookalike = AuditRecord::unlinked(
        OAKLAND,
        2,
        AuditEvent::new("AuditRecord", "SECURITY_ALERT_HASH_MISMATCH", "mallory")
            .with_entity_id(records[1].id),
        chrono::Utc::now(),
    )
    .seal(records[1].record_hash.as_deref().unwrap());
    assert!(Queries::insert_record(db.pool(), &lookalike).await.unwrap());

    tamper_change_details(db.pool(), OAKLAND, 1, r#"{"name":"Forged"}"#).await;

    let reconciler = test_reconciler(&db, &writer);
    let outcome = reconciler.validation_sweep().await.unwrap();
    assert_eq!(outcome.violations.len(), 1);
    assert_eq!(outcome.alerts_raised, 1);

    let stored = chain(&db, OAKLAND).await;
    let alert = stored.last().unwrap();
    assert!(alert.is_security_alert());
    assert_eq!(alert.actor, "SYSTEM");
    assert_eq!(alert.entity_id, Some(records[1].id));
}

#[tokio::test]
async fn test_spawned_reconciler_links_and_stops() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    for i in 0..3 {
        writer
            .append_deferred(OAKLAND, student_event("legacy-import", &format!("Row {}", i)))
            .await
            .unwrap();
    }

    let handle = test_reconciler(&db, &writer).spawn();

    let mut linked = false;
    for _ in 0..50 {
        if chain(&db, OAKLAND).await.iter().all(|r| r.is_hashed()) {
            linked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(linked, "reconciler never backfilled the deferred records");

    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("reconciler did not stop");

    let verifier = IntegrityVerifier::new(db.pool().clone());
    assert!(verifier.verify(OAKLAND).await.unwrap());
}

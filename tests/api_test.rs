mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use tenant_ledger::api::{router, AppState};
use tenant_ledger::database::Database;

use common::*;

fn test_app(db: &Database) -> Router {
    router(AppState::new(db.pool().clone(), test_writer(db)))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let db = setup_test_db().await;
    let (status, body) = send(&test_app(&db), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_append_then_query_and_verify() {
    let db = setup_test_db().await;
    let app = test_app(&db);

    let (status, first) = send(
        &app,
        post_json(
            "/tenants/oakland-unified/audit-records",
            json!({
                "entityType": "Student",
                "action": "CREATE",
                "actor": "admin1",
                "snapshot": "{\"name\":\"Ada\"}",
                "correlationId": "req-1"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["sequenceNumber"], 0);
    assert_eq!(first["previousRecordHash"], "");
    assert_eq!(first["correlationId"], "req-1");

    let (status, second) = send(
        &app,
        post_json(
            "/tenants/oakland-unified/audit-records",
            json!({ "entityType": "Student", "action": "UPDATE", "actor": "admin2" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(second["previousRecordHash"], first["recordHash"]);

    let (status, records) = send(
        &app,
        get("/tenants/oakland-unified/audit-records?actor=admin2"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["action"], "UPDATE");

    let (status, report) = send(&app, get("/tenants/oakland-unified/integrity")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["isValid"], true);
    assert_eq!(report["entryCount"], 2);
}

#[tokio::test]
async fn test_append_without_actor_is_bad_request() {
    let db = setup_test_db().await;
    let app = test_app(&db);

    let (status, body) = send(
        &app,
        post_json(
            "/tenants/oakland-unified/audit-records",
            json!({ "entityType": "Student", "action": "CREATE" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["transient"], false);
    assert!(body["error"].as_str().unwrap().contains("actor"));
    assert!(chain(&db, OAKLAND).await.is_empty());
}

#[tokio::test]
async fn test_integrity_reports_broken_chain() {
    let db = setup_test_db().await;
    let writer = test_writer(&db);
    append_students(&writer, BERKELEY, 3).await;

    allow_tampering(db.pool()).await;
    sqlx::query("UPDATE audit_records SET previous_record_hash = 'forged' WHERE tenant_slug = ? AND sequence_number = 2")
        .bind(BERKELEY)
        .execute(db.pool())
        .await
        .unwrap();

    let (status, report) = send(&test_app(&db), get("/tenants/berkeley-unified/integrity")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["isValid"], false);
    assert_eq!(report["firstBrokenSequence"], 2);
}

//! Admin HTTP API
//!
//! Thin axum surface over the ledger for compliance tooling and for
//! collaborators that record audit events over the network.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use sqlx::SqlitePool;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::audit::{
    AuditEvent, AuditQuery, AuditRecord, IntegrityVerifier, LedgerWriter, QueryService,
    VerificationReport,
};
use crate::error::LedgerError;

#[derive(Clone)]
pub struct AppState {
    pub writer: LedgerWriter,
    pub verifier: IntegrityVerifier,
    pub queries: QueryService,
}

impl AppState {
    pub fn new(pool: SqlitePool, writer: LedgerWriter) -> Self {
        Self {
            writer,
            verifier: IntegrityVerifier::new(pool.clone()),
            queries: QueryService::new(pool),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/tenants/:tenant/audit-records",
            get(query_records).post(append_record),
        )
        .route("/tenants/:tenant/integrity", get(verify_integrity))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Ledger error rendered as an HTTP response
pub struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::ValidationError(_) => StatusCode::BAD_REQUEST,
            LedgerError::ConcurrencyConflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        let body = Json(json!({
            "error": self.0.to_string(),
            "transient": self.0.is_transient(),
        }));
        (status, body).into_response()
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "tenant-ledger",
        "timestamp": chrono::Utc::now()
    }))
}

async fn append_record(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(event): Json<AuditEvent>,
) -> Result<(StatusCode, Json<AuditRecord>), ApiError> {
    let record = state.writer.append(&tenant, event).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn query_records(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(filter): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    let records = state.queries.query(&tenant, &filter).await?;
    Ok(Json(records))
}

async fn verify_integrity(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<VerificationReport>, ApiError> {
    let report = state.verifier.verify_detailed(&tenant).await?;
    Ok(Json(report))
}

//! Query Service
//!
//! Read-only filtered retrieval of a tenant's audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::audit::record::AuditRecord;
use crate::database::Queries;
use crate::error::{LedgerError, LedgerResult};

/// Optional filters; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    pub actor: Option<String>,
    /// Inclusive lower bound on the record timestamp
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the record timestamp
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl AuditQuery {
    pub fn entity(mut self, entity_type: impl Into<String>, entity_id: Option<Uuid>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = entity_id;
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone)]
pub struct QueryService {
    pool: SqlitePool,
}

impl QueryService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records of `tenant_slug` matching `filter`, newest first
    pub async fn query(
        &self,
        tenant_slug: &str,
        filter: &AuditQuery,
    ) -> LedgerResult<Vec<AuditRecord>> {
        if tenant_slug.trim().is_empty() {
            return Err(LedgerError::missing_field("tenant_slug"));
        }

        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(LedgerError::ValidationError(format!(
                    "Query range is inverted: from {} is after to {}",
                    from, to
                )));
            }
        }

        Queries::query_records(&self.pool, tenant_slug, filter).await
    }
}

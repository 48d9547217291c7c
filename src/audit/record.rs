//! Audit Record
//!
//! The immutable, hash-linked unit of the per-tenant ledger and the
//! logical event callers submit to have one written.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::hash::compute_hash;
use crate::error::{LedgerError, LedgerResult};

/// Actor recorded on entries the ledger writes about itself
pub const SYSTEM_ACTOR: &str = "SYSTEM";

/// Entity type of security alerts, which describe other audit records
pub const ALERT_ENTITY_TYPE: &str = "AuditRecord";

/// Action prefix of security alerts
pub const ALERT_ACTION_PREFIX: &str = "SECURITY_ALERT_";

/// Previous-hash value of a tenant's genesis record
pub const GENESIS_PREVIOUS_HASH: &str = "";

/// A logical audit event, before the ledger assigns it a place in a chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditEvent {
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub action: String,
    pub actor: String,
    /// Entity snapshot or change description; opaque to the ledger
    pub snapshot: Option<String>,
    pub correlation_id: Option<String>,
}

impl AuditEvent {
    pub fn new(
        entity_type: impl Into<String>,
        action: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            action: action.into(),
            actor: actor.into(),
            ..Default::default()
        }
    }

    pub fn with_entity_id(mut self, entity_id: Uuid) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Reject the event before anything is persisted
    pub fn validate(&self, tenant_slug: &str) -> LedgerResult<()> {
        if tenant_slug.trim().is_empty() {
            return Err(LedgerError::missing_field("tenant_slug"));
        }
        if self.actor.trim().is_empty() {
            return Err(LedgerError::missing_field("actor"));
        }
        if self.entity_type.trim().is_empty() {
            return Err(LedgerError::missing_field("entity_type"));
        }
        if self.action.trim().is_empty() {
            return Err(LedgerError::missing_field("action"));
        }
        Ok(())
    }

    /// [`validate`](Self::validate) for events from outside the ledger.
    ///
    /// The system actor and the alert entity type and actions belong to the
    /// reconciler; a caller-written look-alike could otherwise stand in for
    /// a real alert.
    pub fn validate_external(&self, tenant_slug: &str) -> LedgerResult<()> {
        self.validate(tenant_slug)?;

        if self.actor.trim().eq_ignore_ascii_case(SYSTEM_ACTOR) {
            return Err(LedgerError::ValidationError(format!(
                "actor {:?} is reserved for the ledger",
                SYSTEM_ACTOR
            )));
        }
        if self.entity_type.trim() == ALERT_ENTITY_TYPE {
            return Err(LedgerError::ValidationError(format!(
                "entity_type {:?} is reserved for security alerts",
                ALERT_ENTITY_TYPE
            )));
        }
        if self.action.trim().starts_with(ALERT_ACTION_PREFIX) {
            return Err(LedgerError::ValidationError(format!(
                "action {:?} is reserved for security alerts",
                self.action
            )));
        }
        Ok(())
    }
}

/// One entry of a tenant's audit chain.
///
/// `previous_record_hash` and `record_hash` are both `None` only for records
/// written through the deferred path that have not been backfilled yet.
/// Once `record_hash` is set the record never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub tenant_slug: String,
    pub sequence_number: u64,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub action: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub change_details: Option<String>,
    pub previous_record_hash: Option<String>,
    pub record_hash: Option<String>,
    pub correlation_id: Option<String>,
}

impl AuditRecord {
    /// Place an event at `sequence_number` without linking it yet.
    ///
    /// The timestamp is truncated to microseconds so the stored text form
    /// reproduces it exactly when the hash is re-derived.
    pub fn unlinked(
        tenant_slug: &str,
        sequence_number: u64,
        event: AuditEvent,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_slug: tenant_slug.to_string(),
            sequence_number,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            action: event.action,
            actor: event.actor,
            timestamp: timestamp.trunc_subsecs(6),
            change_details: event.snapshot,
            previous_record_hash: None,
            record_hash: None,
            correlation_id: event.correlation_id,
        }
    }

    /// Link the record to its predecessor's hash and compute its own
    pub fn seal(mut self, previous_hash: &str) -> Self {
        self.record_hash = Some(compute_hash(&self, previous_hash));
        self.previous_record_hash = Some(previous_hash.to_string());
        self
    }

    pub fn is_hashed(&self) -> bool {
        self.record_hash.is_some()
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence_number == 0
    }

    pub fn is_security_alert(&self) -> bool {
        self.entity_type == ALERT_ENTITY_TYPE && self.actor == SYSTEM_ACTOR
    }

    /// Recompute the hash from the stored fields and stored previous hash
    pub fn rederive_hash(&self) -> Option<String> {
        self.previous_record_hash
            .as_deref()
            .map(|previous| compute_hash(self, previous))
    }

    /// Whether the stored hash still matches the stored fields.
    ///
    /// Unhashed records have nothing to contradict and count as matching.
    pub fn hash_matches(&self) -> bool {
        match (&self.record_hash, self.rederive_hash()) {
            (Some(stored), Some(derived)) => *stored == derived,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{}#{} {} {} by {}",
            self.tenant_slug, self.sequence_number, self.action, self.entity_type, self.actor
        )
    }
}

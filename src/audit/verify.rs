//! Audit Chain Verification
//!
//! Two checks of different cost:
//!
//! - linkage ([`verify_linkage`]): genesis has an empty previous hash and
//!   every record names its predecessor's hash. Cheap, used on demand.
//! - re-derivation ([`inspect_window`], [`find_tampered_records`]): every
//!   stored hash is recomputed from the stored fields. Catches a record
//!   whose contents were edited while its hash fields were left alone,
//!   which linkage alone cannot see.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::record::{AuditEvent, AuditRecord, ALERT_ENTITY_TYPE, SYSTEM_ACTOR};
use crate::database::Queries;
use crate::error::{LedgerError, LedgerResult};

/// Kind of integrity violation found in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Stored hash differs from the hash of the stored fields
    HashMismatch,
    /// Previous hash differs from the predecessor's hash
    LinkageMismatch,
    /// Sequence 0 with a non-empty previous hash
    GenesisMismatch,
    /// A sequence number is missing between two records
    SequenceGap,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::HashMismatch => "hash_mismatch",
            ViolationKind::LinkageMismatch => "linkage_mismatch",
            ViolationKind::GenesisMismatch => "genesis_mismatch",
            ViolationKind::SequenceGap => "sequence_gap",
        }
    }

    /// `action` of the security alert raised for this kind
    pub fn alert_action(&self) -> &'static str {
        match self {
            ViolationKind::HashMismatch => "SECURITY_ALERT_HASH_MISMATCH",
            ViolationKind::LinkageMismatch => "SECURITY_ALERT_LINKAGE_MISMATCH",
            ViolationKind::GenesisMismatch => "SECURITY_ALERT_GENESIS_MISMATCH",
            ViolationKind::SequenceGap => "SECURITY_ALERT_SEQUENCE_GAP",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainViolation {
    pub tenant_slug: String,
    pub record_id: Uuid,
    pub sequence_number: u64,
    pub kind: ViolationKind,
    pub expected: String,
    pub actual: String,
}

impl ChainViolation {
    fn new(record: &AuditRecord, kind: ViolationKind, expected: String, actual: String) -> Self {
        Self {
            tenant_slug: record.tenant_slug.clone(),
            record_id: record.id,
            sequence_number: record.sequence_number,
            kind,
            expected,
            actual,
        }
    }

    /// The security alert event describing this violation
    pub fn alert_event(&self) -> AuditEvent {
        let details = json!({
            "violation": self.kind.as_str(),
            "recordId": self.record_id,
            "sequenceNumber": self.sequence_number,
            "expected": self.expected,
            "actual": self.actual,
        });

        AuditEvent::new(ALERT_ENTITY_TYPE, self.kind.alert_action(), SYSTEM_ACTOR)
            .with_entity_id(self.record_id)
            .with_snapshot(details.to_string())
    }
}

/// Outcome of a linkage walk over one tenant's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub tenant_slug: String,
    pub is_valid: bool,
    pub entry_count: usize,
    /// Records still waiting for backfill; they neither pass nor fail
    pub pending_count: usize,
    pub first_broken_sequence: Option<u64>,
    pub error_message: Option<String>,
}

impl VerificationReport {
    fn broken(mut self, sequence_number: u64, message: String) -> Self {
        self.is_valid = false;
        self.first_broken_sequence = Some(sequence_number);
        self.error_message = Some(message);
        self
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        if self.is_valid {
            format!(
                "Audit chain of {} is valid ({} entries, {} pending)",
                self.tenant_slug, self.entry_count, self.pending_count
            )
        } else {
            format!(
                "Audit chain of {} is invalid ({} entries): {}",
                self.tenant_slug,
                self.entry_count,
                self.error_message.as_deref().unwrap_or("Unknown error")
            )
        }
    }
}

/// Check genesis and predecessor linkage of a tenant's full chain.
///
/// `records` must be the whole chain in ascending sequence order. Hashes
/// are compared as stored, never recomputed. An unhashed tail is reported
/// as pending; a hashed record after an unhashed one is a failure.
pub fn verify_linkage(tenant_slug: &str, records: &[AuditRecord]) -> VerificationReport {
    let report = VerificationReport {
        tenant_slug: tenant_slug.to_string(),
        is_valid: true,
        entry_count: records.len(),
        pending_count: records.iter().filter(|r| !r.is_hashed()).count(),
        first_broken_sequence: None,
        error_message: None,
    };

    let mut previous: Option<&AuditRecord> = None;
    let mut pending_seen = false;

    for record in records {
        if !record.is_hashed() {
            pending_seen = true;
            continue;
        }

        if pending_seen {
            return report.broken(
                record.sequence_number,
                format!(
                    "Record {} is linked after an unlinked record",
                    record.sequence_number
                ),
            );
        }

        match previous {
            None => {
                if record.previous_record_hash.as_deref() != Some("") {
                    return report.broken(
                        record.sequence_number,
                        format!(
                            "First record {} does not start the chain: previous hash {:?}",
                            record.sequence_number,
                            record.previous_record_hash.as_deref().unwrap_or_default()
                        ),
                    );
                }
            }
            Some(prev) => {
                if record.previous_record_hash != prev.record_hash {
                    return report.broken(
                        record.sequence_number,
                        format!(
                            "Hash chain broken at record {}: expected {}, got {}",
                            record.sequence_number,
                            prev.record_hash.as_deref().unwrap_or_default(),
                            record.previous_record_hash.as_deref().unwrap_or_default()
                        ),
                    );
                }
            }
        }

        previous = Some(record);
    }

    report
}

/// Re-derive hashes and linkage over a contiguous window of one tenant.
///
/// The first record of the window is not checked against a predecessor
/// (it may not be genesis). Unhashed records are skipped, but a hashed record
/// directly after one is a linkage mismatch, as in [`verify_linkage`].
pub fn inspect_window(records: &[AuditRecord]) -> Vec<ChainViolation> {
    let mut violations = Vec::new();

    for (i, record) in records.iter().enumerate() {
        if !record.is_hashed() {
            continue;
        }

        if !record.hash_matches() {
            violations.push(ChainViolation::new(
                record,
                ViolationKind::HashMismatch,
                record.rederive_hash().unwrap_or_default(),
                record.record_hash.clone().unwrap_or_default(),
            ));
        }

        if record.is_genesis() && record.previous_record_hash.as_deref() != Some("") {
            violations.push(ChainViolation::new(
                record,
                ViolationKind::GenesisMismatch,
                String::new(),
                record.previous_record_hash.clone().unwrap_or_default(),
            ));
        }

        if i == 0 {
            continue;
        }

        let prev = &records[i - 1];
        if record.sequence_number != prev.sequence_number + 1 {
            violations.push(ChainViolation::new(
                record,
                ViolationKind::SequenceGap,
                (prev.sequence_number + 1).to_string(),
                record.sequence_number.to_string(),
            ));
        } else if record.previous_record_hash != prev.record_hash {
            // Also catches a hashed record after an unhashed predecessor
            violations.push(ChainViolation::new(
                record,
                ViolationKind::LinkageMismatch,
                prev.record_hash.clone().unwrap_or_default(),
                record.previous_record_hash.clone().unwrap_or_default(),
            ));
        }
    }

    violations
}

/// Records whose stored hash no longer matches their stored fields
pub fn find_tampered_records(records: &[AuditRecord]) -> Vec<ChainViolation> {
    inspect_window(records)
        .into_iter()
        .filter(|violation| violation.kind == ViolationKind::HashMismatch)
        .collect()
}

/// Integrity Verifier over the chain store
#[derive(Clone)]
pub struct IntegrityVerifier {
    pool: SqlitePool,
}

impl IntegrityVerifier {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Whether the tenant's chain is intact by linkage
    pub async fn verify(&self, tenant_slug: &str) -> LedgerResult<bool> {
        Ok(self.verify_detailed(tenant_slug).await?.is_valid)
    }

    pub async fn verify_detailed(&self, tenant_slug: &str) -> LedgerResult<VerificationReport> {
        if tenant_slug.trim().is_empty() {
            return Err(LedgerError::missing_field("tenant_slug"));
        }

        let records = Queries::tenant_chain(&self.pool, tenant_slug).await?;
        let report = verify_linkage(tenant_slug, &records);

        if report.is_valid {
            info!("{}", report.summary());
        } else {
            warn!("{}", report.summary());
        }
        Ok(report)
    }

    /// Full re-derivation over the tenant's chain
    pub async fn find_tampered_records(&self, tenant_slug: &str) -> LedgerResult<Vec<ChainViolation>> {
        if tenant_slug.trim().is_empty() {
            return Err(LedgerError::missing_field("tenant_slug"));
        }

        let records = Queries::tenant_chain(&self.pool, tenant_slug).await?;
        Ok(find_tampered_records(&records))
    }
}

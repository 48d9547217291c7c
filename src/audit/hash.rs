//! Hash Engine
//!
//! Deterministic SHA-256 digest over the canonical encoding of an audit
//! record. The encoding is specified byte-for-byte so an independent
//! verifier in any language can reproduce it:
//!
//! ```text
//! id:<len>:<uuid>\n
//! entity_type:<len>:<value>\n
//! entity_id:<len>:<uuid>\n        (or "entity_id:~\n" when null)
//! action:<len>:<value>\n
//! actor:<len>:<value>\n
//! timestamp:<len>:<rfc3339 UTC, microseconds, Z>\n
//! change_details:<len>:<value>\n  (or "change_details:~\n" when null)
//! previous_hash:<len>:<hex or empty>\n
//! sequence_number:<len>:<decimal>\n
//! ```
//!
//! `<len>` is the UTF-8 byte length of the value, so no value can smuggle a
//! field boundary. The tenant slug, correlation id and the record's own hash
//! are not part of the input.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::audit::record::AuditRecord;

/// Canonical text form of a record timestamp, also used for storage
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Build the canonical encoding hashed for `record` linked to `previous_hash`
pub fn canonical_encoding(record: &AuditRecord, previous_hash: &str) -> String {
    let mut out = String::with_capacity(256);
    push_field(&mut out, "id", Some(&record.id.to_string()));
    push_field(&mut out, "entity_type", Some(&record.entity_type));
    push_field(
        &mut out,
        "entity_id",
        record.entity_id.map(|id| id.to_string()).as_deref(),
    );
    push_field(&mut out, "action", Some(&record.action));
    push_field(&mut out, "actor", Some(&record.actor));
    push_field(&mut out, "timestamp", Some(&format_timestamp(&record.timestamp)));
    push_field(&mut out, "change_details", record.change_details.as_deref());
    push_field(&mut out, "previous_hash", Some(previous_hash));
    push_field(
        &mut out,
        "sequence_number",
        Some(&record.sequence_number.to_string()),
    );
    out
}

fn push_field(out: &mut String, name: &str, value: Option<&str>) {
    out.push_str(name);
    match value {
        Some(value) => {
            out.push(':');
            out.push_str(&value.len().to_string());
            out.push(':');
            out.push_str(value);
        }
        None => out.push_str(":~"),
    }
    out.push('\n');
}

/// Compute the lowercase hex SHA-256 of the record's canonical encoding
pub fn compute_hash(record: &AuditRecord, previous_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_encoding(record, previous_hash).as_bytes());
    hex::encode(hasher.finalize())
}

// Database schema definitions
// Audit records plus the triggers that keep hashed records append-only

pub const AUDIT_RECORDS_SCHEMA: &str = include_str!("../../migrations/001_audit_records.sql");

//! Audit Ledger
//!
//! Tamper-evident, per-tenant audit chains: every record carries the hash
//! of its predecessor in the same tenant, so retroactive edits show up as
//! hash or linkage mismatches.

pub mod backfill;
pub mod hash;
pub mod query;
pub mod reconciler;
pub mod record;
pub mod verify;
pub mod writer;

pub use hash::compute_hash;
pub use query::{AuditQuery, QueryService};
pub use reconciler::{ChainReconciler, CycleReport, ReconcilerHandle};
pub use record::{AuditEvent, AuditRecord};
pub use verify::{ChainViolation, IntegrityVerifier, VerificationReport, ViolationKind};
pub use writer::LedgerWriter;

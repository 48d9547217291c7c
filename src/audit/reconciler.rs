//! Chain Reconciler
//!
//! Background task that links records persisted without a hash (backfill)
//! and periodically re-derives the trailing window of every tenant's chain
//! (validation sweep). Violations are never repaired: each one is recorded
//! as a security alert appended through the ledger writer, so the detection
//! itself is chain-protected.

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::backfill::{backfill_record, BackfillStep};
use crate::audit::record::{ALERT_ENTITY_TYPE, SYSTEM_ACTOR};
use crate::audit::verify::{inspect_window, ChainViolation};
use crate::audit::writer::LedgerWriter;
use crate::config::ReconcilerConfig;
use crate::database::Queries;
use crate::error::LedgerResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillOutcome {
    pub filled: usize,
    pub already_hashed: usize,
    /// Waiting on an unlinked predecessor outside this batch
    pub deferred: usize,
    /// Predecessor missing altogether
    pub skipped: usize,
    /// Tenants left out of the batch because their chain cannot be linked
    pub stalled_tenants: Vec<String>,
}

impl BackfillOutcome {
    pub fn examined(&self) -> usize {
        self.filled + self.already_hashed + self.deferred + self.skipped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepOutcome {
    pub tenants_checked: usize,
    pub records_checked: usize,
    pub violations: Vec<ChainViolation>,
    /// Alerts appended by this sweep; already-alerted violations are not repeated
    pub alerts_raised: usize,
    /// Tenants whose window could not be loaded
    pub tenants_failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub backfill: BackfillOutcome,
    pub sweep: Option<SweepOutcome>,
}

#[derive(Clone)]
pub struct ChainReconciler {
    pool: SqlitePool,
    writer: LedgerWriter,
    config: ReconcilerConfig,
}

impl ChainReconciler {
    pub fn new(pool: SqlitePool, writer: LedgerWriter, config: ReconcilerConfig) -> Self {
        Self {
            pool,
            writer,
            config,
        }
    }

    /// Phase A: link up to `batch_size` unhashed records
    pub async fn backfill(&self) -> LedgerResult<BackfillOutcome> {
        let batch = Queries::unhashed_records(&self.pool, self.config.batch_size).await?;
        let mut outcome = BackfillOutcome {
            stalled_tenants: Queries::stalled_tenants(&self.pool).await?,
            ..BackfillOutcome::default()
        };
        for tenant_slug in &outcome.stalled_tenants {
            warn!(
                "Backfill of tenant {} is stalled: its oldest unhashed record has no predecessor",
                tenant_slug
            );
        }

        for record in &batch {
            match backfill_record(&self.pool, record).await? {
                BackfillStep::Filled(_) => outcome.filled += 1,
                BackfillStep::AlreadyHashed => outcome.already_hashed += 1,
                BackfillStep::PredecessorPending => outcome.deferred += 1,
                BackfillStep::PredecessorMissing => outcome.skipped += 1,
            }
        }

        if outcome.examined() > 0 {
            info!(
                "Backfill linked {} of {} unhashed records ({} deferred, {} skipped)",
                outcome.filled,
                outcome.examined(),
                outcome.deferred,
                outcome.skipped
            );
        }
        Ok(outcome)
    }

    /// Phase B: re-derive the trailing window of every tenant and alert on violations
    pub async fn validation_sweep(&self) -> LedgerResult<SweepOutcome> {
        let tenants = Queries::tenants(&self.pool).await?;
        let mut outcome = SweepOutcome::default();

        for tenant_slug in &tenants {
            let window = match Queries::trailing_window(
                &self.pool,
                tenant_slug,
                self.config.validation_window,
            )
            .await
            {
                Ok(window) => window,
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    // An undecodable row is itself evidence of tampering
                    error!("Validation sweep could not load tenant {}: {}", tenant_slug, e);
                    outcome.tenants_failed += 1;
                    continue;
                }
            };

            outcome.tenants_checked += 1;
            outcome.records_checked += window.len();

            for violation in inspect_window(&window) {
                if self.raise_alert(&violation).await? {
                    outcome.alerts_raised += 1;
                }
                outcome.violations.push(violation);
            }
        }

        if outcome.violations.is_empty() {
            debug!(
                "Validation sweep clean: {} records across {} tenants",
                outcome.records_checked, outcome.tenants_checked
            );
        } else {
            warn!(
                "Validation sweep found {} violations ({} new alerts)",
                outcome.violations.len(),
                outcome.alerts_raised
            );
        }
        Ok(outcome)
    }

    /// Append a security alert unless this violation was already alerted
    async fn raise_alert(&self, violation: &ChainViolation) -> LedgerResult<bool> {
        let action = violation.kind.alert_action();
        if Queries::alert_exists(
            &self.pool,
            &violation.tenant_slug,
            ALERT_ENTITY_TYPE,
            SYSTEM_ACTOR,
            violation.record_id,
            action,
        )
        .await?
        {
            return Ok(false);
        }

        error!(
            "Integrity violation in tenant {}: {} at record {} ({}), expected {}, found {}",
            violation.tenant_slug,
            violation.kind,
            violation.sequence_number,
            violation.record_id,
            violation.expected,
            violation.actual
        );

        let alert = self
            .writer
            .append_system(&violation.tenant_slug, violation.alert_event())
            .await?;
        info!("Recorded security alert: {}", alert.summary());
        Ok(true)
    }

    /// One reconciliation cycle; the sweep runs on every Nth cycle
    pub async fn run_cycle(&self, cycle: u64) -> LedgerResult<CycleReport> {
        let backfill = self.backfill().await?;
        let sweep = if cycle % self.config.validation_every_cycles.max(1) == 0 {
            Some(self.validation_sweep().await?)
        } else {
            None
        };

        Ok(CycleReport {
            cycle,
            backfill,
            sweep,
        })
    }

    /// Run cycles until `stop` turns true or its sender is dropped.
    ///
    /// The stop signal is only observed between cycles. Each cycle runs in
    /// its own task so a panic is contained to that cycle; failed cycles are
    /// followed by the failure cooldown instead of the regular interval.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            "Chain reconciler started (interval {}s, batch {}, sweep every {} cycles)",
            self.config.interval_secs, self.config.batch_size, self.config.validation_every_cycles
        );

        let mut cycle: u64 = 0;
        loop {
            if *stop.borrow() {
                break;
            }

            cycle += 1;
            let reconciler = self.clone();
            let delay = match tokio::spawn(async move { reconciler.run_cycle(cycle).await }).await {
                Ok(Ok(report)) => {
                    debug!("Reconciler cycle {} complete: {:?}", cycle, report);
                    self.config.interval()
                }
                Ok(Err(e)) => {
                    error!(
                        "Reconciler cycle {} failed, cooling down for {}s: {}",
                        cycle, self.config.failure_cooldown_secs, e
                    );
                    self.config.failure_cooldown()
                }
                Err(e) => {
                    error!("Reconciler cycle {} aborted: {}", cycle, e);
                    self.config.failure_cooldown()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Chain reconciler stopped after {} cycles", cycle);
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn spawn(self) -> ReconcilerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        ReconcilerHandle { stop, task }
    }
}

pub struct ReconcilerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signal stop and wait for the in-flight cycle to finish
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!("Chain reconciler task ended abnormally: {}", e);
        }
    }
}

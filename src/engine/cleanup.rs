//! Deferred cleanup: destructive actions run only once every live fleet
//! member reports at least the unit's produced version.
//!
//! A sweep is idempotent and never fatal. Anything that cannot run now stays
//! in `schema_cleanup_pending` and is retried on the next sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::TransactionBehavior;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::FleetSettings;
use crate::db::models::{HistoryOutcome, HistoryPhase, PendingCleanup};
use crate::db::repos::history::{self as history_repo, NewHistoryEntry};
use crate::db::repos::marker as marker_repo;
use crate::db::DbPool;
use crate::engine::actions;
use crate::engine::fleet::{self, FleetMembership};
use crate::engine::lock::MigrationLock;
use crate::engine::registry::{MigrationUnit, Registry};
use crate::error::AppError;

/// Why a pending cleanup did not run in this sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Deferral {
    NotConverged { unit_id: String, laggards: Vec<String> },
    Failed { unit_id: String, cause: String },
    /// Held back so cleanups keep produced-version order.
    AwaitingEarlier { unit_id: String, blocked_by: String },
    UnknownUnit { unit_id: String },
    LockHeldElsewhere { holder: String },
    Unavailable { cause: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "result", rename_all = "snake_case")]
pub enum SweepOutcome {
    Cleaned(Vec<String>),
    Deferred { cleaned: Vec<String>, reasons: Vec<Deferral> },
}

impl SweepOutcome {
    pub fn cleaned(&self) -> &[String] {
        match self {
            SweepOutcome::Cleaned(ids) => ids,
            SweepOutcome::Deferred { cleaned, .. } => cleaned,
        }
    }

    pub fn has_failures(&self) -> bool {
        match self {
            SweepOutcome::Cleaned(_) => false,
            SweepOutcome::Deferred { reasons, .. } => {
                reasons.iter().any(|r| matches!(r, Deferral::Failed { .. }))
            }
        }
    }

    /// First failure as an error, for exit-code mapping.
    pub fn first_failure(&self) -> Option<AppError> {
        let SweepOutcome::Deferred { reasons, .. } = self else {
            return None;
        };
        reasons.iter().find_map(|r| match r {
            Deferral::Failed { unit_id, cause } => Some(AppError::CleanupExecutionFailure {
                unit_id: unit_id.clone(),
                cause: cause.clone(),
            }),
            _ => None,
        })
    }

    fn from_parts(cleaned: Vec<String>, reasons: Vec<Deferral>) -> Self {
        if reasons.is_empty() {
            SweepOutcome::Cleaned(cleaned)
        } else {
            SweepOutcome::Deferred { cleaned, reasons }
        }
    }
}

/// Counters for the periodic loop.
#[derive(Default)]
pub struct CleanupStats {
    sweeps: AtomicU64,
    units_cleaned: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatsSnapshot {
    pub sweeps: u64,
    pub units_cleaned: u64,
    pub failures: u64,
}

impl CleanupStats {
    pub fn snapshot(&self) -> CleanupStatsSnapshot {
        CleanupStatsSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            units_cleaned: self.units_cleaned.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &SweepOutcome) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.units_cleaned
            .fetch_add(outcome.cleaned().len() as u64, Ordering::Relaxed);
        if outcome.has_failures() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct CleanupScheduler {
    pool: DbPool,
    registry: Arc<Registry>,
    lock: MigrationLock,
    fleet: Arc<dyn FleetMembership>,
    holder_id: String,
    convergence_timeout: Duration,
    fleet_poll: Duration,
    stats: CleanupStats,
}

impl CleanupScheduler {
    pub fn new(
        pool: DbPool,
        registry: Arc<Registry>,
        lock: MigrationLock,
        fleet: Arc<dyn FleetMembership>,
        instance_id: &str,
    ) -> Self {
        let defaults = FleetSettings::default();
        Self {
            pool,
            registry,
            lock,
            fleet,
            // Must differ from the executor's holder: leases are re-entrant per holder.
            holder_id: format!("{instance_id}:cleanup"),
            convergence_timeout: Duration::from_secs(defaults.convergence_timeout_secs),
            fleet_poll: Duration::from_millis(defaults.poll_millis),
            stats: CleanupStats::default(),
        }
    }

    pub fn with_fleet_settings(mut self, settings: &FleetSettings) -> Self {
        self.convergence_timeout = Duration::from_secs(settings.convergence_timeout_secs);
        self.fleet_poll = Duration::from_millis(settings.poll_millis);
        self
    }

    pub fn stats(&self) -> CleanupStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn sweep(&self) -> SweepOutcome {
        let outcome = self.sweep_inner();
        self.stats.record(&outcome);
        outcome
    }

    fn sweep_inner(&self) -> SweepOutcome {
        let pending = match self.pending() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Cleanup sweep could not read pending units: {}", e);
                return SweepOutcome::from_parts(Vec::new(), vec![Deferral::Unavailable { cause: e.to_string() }]);
            }
        };
        if pending.is_empty() {
            return SweepOutcome::Cleaned(Vec::new());
        }

        let _guard = match self.lock.try_acquire_guard(&self.holder_id) {
            Ok(guard) => guard,
            Err(AppError::LockHeldElsewhere { holder, .. }) => {
                tracing::debug!(holder = %holder, "Cleanup sweep deferred, migration lock busy");
                return SweepOutcome::from_parts(Vec::new(), vec![Deferral::LockHeldElsewhere { holder }]);
            }
            Err(e) => {
                tracing::warn!("Cleanup sweep could not take the migration lock: {}", e);
                return SweepOutcome::from_parts(Vec::new(), vec![Deferral::Unavailable { cause: e.to_string() }]);
            }
        };

        // Re-read under the lock; another sweep may have just finished.
        let pending = match self.pending() {
            Ok(p) => p,
            Err(e) => {
                return SweepOutcome::from_parts(Vec::new(), vec![Deferral::Unavailable { cause: e.to_string() }])
            }
        };

        let mut cleaned = Vec::new();
        let mut reasons = Vec::new();
        let mut blocked_by: Option<String> = None;

        for entry in &pending {
            if let Some(earlier) = &blocked_by {
                reasons.push(Deferral::AwaitingEarlier {
                    unit_id: entry.unit_id.clone(),
                    blocked_by: earlier.clone(),
                });
                continue;
            }

            let Some(unit) = self.registry.get(&entry.unit_id) else {
                tracing::warn!(unit_id = %entry.unit_id, "Pending cleanup refers to a unit missing from the registry");
                reasons.push(Deferral::UnknownUnit {
                    unit_id: entry.unit_id.clone(),
                });
                continue;
            };

            match self.process(unit, entry) {
                Ok(()) => cleaned.push(unit.id.clone()),
                Err(deferral) => {
                    blocked_by = Some(unit.id.clone());
                    reasons.push(deferral);
                }
            }
        }

        if !cleaned.is_empty() {
            tracing::info!(units = ?cleaned, "Deferred cleanups applied");
        }
        SweepOutcome::from_parts(cleaned, reasons)
    }

    fn pending(&self) -> Result<Vec<PendingCleanup>, AppError> {
        let conn = self.pool.get()?;
        marker_repo::pending_cleanups(&conn)
    }

    fn process(&self, unit: &MigrationUnit, entry: &PendingCleanup) -> Result<(), Deferral> {
        let laggards = fleet::wait_until_clear(
            self.fleet.as_ref(),
            self.convergence_timeout,
            self.fleet_poll,
            |members| fleet::convergence_laggards(members, &entry.produced_version),
        )
        .map_err(|e| Deferral::Unavailable { cause: e.to_string() })?;

        if !laggards.is_empty() {
            tracing::debug!(
                unit_id = %unit.id,
                version = %entry.produced_version,
                laggards = laggards.len(),
                "Fleet not converged, cleanup stays pending"
            );
            return Err(Deferral::NotConverged {
                unit_id: unit.id.clone(),
                laggards: fleet::describe(&laggards),
            });
        }

        match self.apply_cleanup(unit, entry) {
            Ok(()) => {
                tracing::info!(unit_id = %unit.id, "Cleanup applied");
                Ok(())
            }
            Err(e) => {
                let cause = e.to_string();
                tracing::error!(
                    unit_id = %unit.id,
                    attempts = entry.attempts + 1,
                    kind = e.kind(),
                    "Cleanup failed, will retry: {}", cause
                );
                self.record_failure(unit, entry, &cause);
                Err(Deferral::Failed {
                    unit_id: unit.id.clone(),
                    cause,
                })
            }
        }
    }

    fn apply_cleanup(&self, unit: &MigrationUnit, entry: &PendingCleanup) -> Result<(), AppError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        actions::apply(&tx, "cleanup", &unit.cleanup_actions)?;
        self.lock.fence(&tx, &self.holder_id)?;
        marker_repo::clear_cleanup_pending(&tx, &unit.id)?;
        history_repo::insert(
            &tx,
            NewHistoryEntry {
                unit_id: &unit.id,
                phase: HistoryPhase::Cleanup,
                outcome: HistoryOutcome::Applied,
                from_version: None,
                to_version: Some(entry.produced_version.to_string()),
                instance_id: &self.holder_id,
                detail: None,
            },
        )?;

        tx.commit()?;
        Ok(())
    }

    fn record_failure(&self, unit: &MigrationUnit, entry: &PendingCleanup, cause: &str) {
        let result = self.pool.get().map_err(AppError::from).and_then(|conn| {
            marker_repo::record_cleanup_failure(&conn, &unit.id, cause)?;
            history_repo::insert(
                &conn,
                NewHistoryEntry {
                    unit_id: &unit.id,
                    phase: HistoryPhase::Cleanup,
                    outcome: HistoryOutcome::Failed,
                    from_version: None,
                    to_version: Some(entry.produced_version.to_string()),
                    instance_id: &self.holder_id,
                    detail: Some(cause.to_string()),
                },
            )
        });
        if let Err(e) = result {
            tracing::warn!(unit_id = %unit.id, "Could not record cleanup failure: {}", e);
        }
    }
}

/// Run `sweep` every `interval` until `cancel` fires. The first sweep runs
/// immediately.
pub fn start_cleanup_loop(
    scheduler: Arc<CleanupScheduler>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "Cleanup loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sched = scheduler.clone();
                    match tokio::task::spawn_blocking(move || sched.sweep()).await {
                        Ok(SweepOutcome::Cleaned(ids)) if ids.is_empty() => {}
                        Ok(outcome) => tracing::debug!(?outcome, "Cleanup sweep finished"),
                        Err(e) => tracing::error!("Cleanup sweep task panicked: {}", e),
                    }
                }
            }
        }
        tracing::info!("Cleanup loop stopped");
    })
}

//! Upgrade executor: applies a resolved chain of units under the migration
//! lock, one transaction per unit.
//!
//! Each unit's transaction carries its prepare actions, its data migration,
//! the marker advance, the checkpoint and (when the unit has cleanup) the
//! pending-cleanup registration. A crash or failure at any point leaves the
//! marker on the last committed unit, so the next run resumes exactly there.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::TransactionBehavior;
use serde::Serialize;

use crate::config::FleetSettings;
use crate::db::models::{HistoryOutcome, HistoryPhase};
use crate::db::repos::history::{self as history_repo, NewHistoryEntry};
use crate::db::repos::marker as marker_repo;
use crate::db::DbPool;
use crate::engine::actions;
use crate::engine::fleet::{self, FleetMembership};
use crate::engine::lock::{LeaseGuard, MigrationLock};
use crate::engine::registry::{MigrationUnit, Registry};
use crate::engine::resolver;
use crate::engine::version::SchemaVersion;
use crate::error::AppError;

/// Terminal result of one executor run.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Applied {
        from: SchemaVersion,
        to: SchemaVersion,
        units_applied: Vec<String>,
    },
    NoOpAlreadyCurrent {
        version: SchemaVersion,
    },
    Failed {
        at_unit: Option<String>,
        cause: AppError,
    },
}

impl RunOutcome {
    fn failed(at_unit: Option<&str>, cause: AppError) -> Self {
        RunOutcome::Failed {
            at_unit: at_unit.map(str::to_string),
            cause,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, RunOutcome::Failed { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Failed { cause, .. } => cause.exit_code(),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// How long a non-rolling unit waits for old members to drain before
    /// giving up with `RollingUpgradeUnsafe`. Zero checks once.
    pub rolling_check_timeout: Duration,
    pub fleet_poll: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        (&FleetSettings::default()).into()
    }
}

impl From<&FleetSettings> for ExecutorOptions {
    fn from(s: &FleetSettings) -> Self {
        Self {
            rolling_check_timeout: Duration::from_secs(s.rolling_check_timeout_secs),
            fleet_poll: Duration::from_millis(s.poll_millis),
        }
    }
}

pub struct UpgradeExecutor {
    pool: DbPool,
    registry: Arc<Registry>,
    lock: MigrationLock,
    fleet: Arc<dyn FleetMembership>,
    instance_id: String,
    options: ExecutorOptions,
}

impl UpgradeExecutor {
    pub fn new(
        pool: DbPool,
        registry: Arc<Registry>,
        lock: MigrationLock,
        fleet: Arc<dyn FleetMembership>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            registry,
            lock,
            fleet,
            instance_id: instance_id.into(),
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn lock(&self) -> &MigrationLock {
        &self.lock
    }

    pub fn current_version(&self) -> Result<SchemaVersion, AppError> {
        let conn = self.pool.get()?;
        marker_repo::current_version(&conn)
    }

    /// Bring the schema to `target`. Never panics and never leaves the lock
    /// held; every failure comes back as `RunOutcome::Failed`.
    pub fn run(&self, target: &SchemaVersion) -> RunOutcome {
        // Resolve before locking: an instance that is already current does
        // no writes at all.
        let current = match self.current_version() {
            Ok(v) => v,
            Err(e) => return RunOutcome::failed(None, e),
        };
        match resolver::resolve(&self.registry, &current, target) {
            Ok(chain) if chain.is_empty() => {
                tracing::info!(version = %current, "Schema already current");
                return RunOutcome::NoOpAlreadyCurrent { version: current };
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(from = %current, to = %target, "Upgrade path resolution failed: {}", e);
                return RunOutcome::failed(None, e);
            }
        }

        let guard = match self.lock.acquire_guard(&self.instance_id) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::info!(instance_id = %self.instance_id, "Another instance is migrating: {}", e);
                return RunOutcome::failed(None, e);
            }
        };
        let outcome = self.run_locked(&guard, target);
        drop(guard);

        match &outcome {
            RunOutcome::Applied { from, to, units_applied } => tracing::info!(
                from = %from,
                to = %to,
                units = units_applied.len(),
                "Schema upgrade applied"
            ),
            RunOutcome::Failed { at_unit, cause } => tracing::warn!(
                at_unit = at_unit.as_deref().unwrap_or("-"),
                kind = cause.kind(),
                "Schema upgrade halted: {}", cause
            ),
            RunOutcome::NoOpAlreadyCurrent { .. } => {}
        }
        outcome
    }

    fn run_locked(&self, guard: &LeaseGuard, target: &SchemaVersion) -> RunOutcome {
        // Another instance may have advanced the marker while we waited.
        let marker = match marker_repo::get(&self.pool) {
            Ok(m) => m,
            Err(e) => return RunOutcome::failed(None, e),
        };
        let chain = match resolver::resolve(&self.registry, &marker.current_version, target) {
            Ok(chain) => chain,
            Err(e) => return RunOutcome::failed(None, e),
        };
        if chain.is_empty() {
            tracing::info!(version = %marker.current_version, "Schema reached target while waiting for the lock");
            return RunOutcome::NoOpAlreadyCurrent {
                version: marker.current_version,
            };
        }

        let mut units_applied = Vec::new();
        for unit in chain {
            if marker.is_applied(&unit.id) {
                tracing::debug!(unit_id = %unit.id, "Unit already checkpointed, skipping");
                continue;
            }
            if !unit.supports_rolling_upgrade {
                if let Err(e) = self.check_rolling_safety(unit) {
                    self.record_refusal(unit, &e);
                    return RunOutcome::failed(Some(&unit.id), e);
                }
            }
            // The rolling check may have waited a long time.
            if guard.is_lost() {
                tracing::warn!(unit_id = %unit.id, "Migration lease lost, halting before the next unit");
                return RunOutcome::failed(Some(&unit.id), self.lock.lost_error());
            }

            tracing::info!(
                unit_id = %unit.id,
                from = %unit.range_from,
                to = %unit.produced_version,
                "Applying migration unit"
            );
            match self.apply_unit(unit) {
                Ok(()) => units_applied.push(unit.id.clone()),
                Err(e @ AppError::LockHeldElsewhere { .. }) => {
                    tracing::warn!(unit_id = %unit.id, "Lease taken over before commit, unit rolled back: {}", e);
                    return RunOutcome::failed(Some(&unit.id), e);
                }
                Err(e) => {
                    let cause = e.to_string();
                    tracing::error!(unit_id = %unit.id, kind = e.kind(), "Migration unit failed, rolled back: {}", cause);
                    self.record_failure(unit, &cause);
                    return RunOutcome::failed(
                        Some(&unit.id),
                        AppError::UnitExecutionFailure {
                            unit_id: unit.id.clone(),
                            cause,
                        },
                    );
                }
            }
        }

        RunOutcome::Applied {
            from: marker.current_version,
            to: target.clone(),
            units_applied,
        }
    }

    fn check_rolling_safety(&self, unit: &MigrationUnit) -> Result<(), AppError> {
        let blockers = fleet::wait_until_clear(
            self.fleet.as_ref(),
            self.options.rolling_check_timeout,
            self.options.fleet_poll,
            |members| fleet::rolling_upgrade_blockers(members, &self.instance_id, &unit.range_from),
        )?;
        if blockers.is_empty() {
            return Ok(());
        }
        Err(AppError::RollingUpgradeUnsafe {
            unit_id: unit.id.clone(),
            range_from: unit.range_from.to_string(),
            blockers: fleet::describe(&blockers),
        })
    }

    /// One all-or-nothing transaction, fenced on the lease: nothing commits
    /// unless the lock row still names this instance.
    fn apply_unit(&self, unit: &MigrationUnit) -> Result<(), AppError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        self.lock.fence(&tx, &self.instance_id)?;
        let from = marker_repo::current_version(&tx)?;
        if from != unit.range_from {
            return Err(AppError::Internal(format!(
                "marker at {from} while holding the lock, expected {}",
                unit.range_from
            )));
        }
        actions::apply(&tx, "prepare", &unit.prepare_actions)?;
        if let Some(step) = &unit.data_migration {
            actions::apply_data_migration(&tx, step)?;
        }
        marker_repo::record_unit_applied(&tx, unit, &self.instance_id)?;
        history_repo::insert(
            &tx,
            NewHistoryEntry {
                unit_id: &unit.id,
                phase: HistoryPhase::Prepare,
                outcome: HistoryOutcome::Applied,
                from_version: Some(from.to_string()),
                to_version: Some(unit.produced_version.to_string()),
                instance_id: &self.instance_id,
                detail: unit.description.clone(),
            },
        )?;

        // The heartbeat was blocked behind this transaction; refresh the lease as we commit.
        self.lock.fence(&tx, &self.instance_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Best effort: a failure row is written outside the rolled-back
    /// transaction and never masks the original error.
    fn record_failure(&self, unit: &MigrationUnit, detail: &str) {
        let result = self.pool.get().map_err(AppError::from).and_then(|conn| {
            history_repo::insert(
                &conn,
                NewHistoryEntry {
                    unit_id: &unit.id,
                    phase: HistoryPhase::Prepare,
                    outcome: HistoryOutcome::Failed,
                    from_version: Some(unit.range_from.to_string()),
                    to_version: Some(unit.produced_version.to_string()),
                    instance_id: &self.instance_id,
                    detail: Some(detail.to_string()),
                },
            )
        });
        if let Err(e) = result {
            tracing::warn!(unit_id = %unit.id, "Could not record failed attempt in history: {}", e);
        }
    }

    /// A rolling-upgrade refusal is retried until the fleet drains, so only
    /// a change in the blocking set gets a new history row.
    fn record_refusal(&self, unit: &MigrationUnit, cause: &AppError) {
        let detail = cause.to_string();
        let repeated = self
            .pool
            .get()
            .map_err(AppError::from)
            .and_then(|conn| history_repo::latest_for_unit(&conn, &unit.id))
            .map(|last| {
                last.is_some_and(|entry| {
                    entry.outcome == HistoryOutcome::Failed && entry.detail.as_deref() == Some(detail.as_str())
                })
            })
            .unwrap_or(false);
        if repeated {
            tracing::debug!(unit_id = %unit.id, "Rolling-upgrade refusal unchanged, not recorded again");
            return;
        }
        self.record_failure(unit, &detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db_at;
    use crate::db::models::{FleetMember, MemberStatus};
    use crate::db::repos::fleet as fleet_repo;
    use crate::db::repos::to_ts;
    use crate::engine::fleet::{SqliteFleet, StaticFleet};
    use crate::engine::lock::LeaseOptions;
    use crate::engine::registry::DataMigration;
    use crate::engine::version::v;
    use rusqlite::Transaction;
    use std::sync::atomic::{AtomicBool, Ordering};

    const AUDITED: [&str; 5] = [
        "schema_version_marker",
        "schema_unit_checkpoints",
        "schema_cleanup_pending",
        "schema_migration_lock",
        "schema_upgrade_history",
    ];

    /// Count every write to the bookkeeping tables from now on.
    fn install_write_audit(pool: &DbPool) {
        let conn = pool.get().unwrap();
        conn.execute_batch("CREATE TABLE write_audit (tbl TEXT NOT NULL)").unwrap();
        for table in AUDITED {
            for op in ["INSERT", "UPDATE", "DELETE"] {
                conn.execute_batch(&format!(
                    "CREATE TRIGGER audit_{table}_{op} AFTER {op} ON {table}
                     BEGIN INSERT INTO write_audit (tbl) VALUES ('{table}'); END;"
                ))
                .unwrap();
            }
        }
    }

    fn audited_writes(pool: &DbPool) -> i64 {
        let conn = pool.get().unwrap();
        conn.query_row("SELECT COUNT(*) FROM write_audit", [], |r| r.get(0)).unwrap()
    }

    fn table_exists(pool: &DbPool, name: &str) -> bool {
        let conn = pool.get().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |r| r.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    fn copy_names(tx: &Transaction<'_>) -> Result<(), AppError> {
        tx.execute("UPDATE users SET full_name = name", [])?;
        Ok(())
    }

    fn rename_registry() -> Registry {
        Registry::new(vec![
            MigrationUnit::new("users-1.1", v("1.0"), v("1.1"))
                .prepare_sql("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
                .prepare_sql("INSERT INTO users (name) VALUES ('ada'), ('grace')"),
            MigrationUnit::new("users-2.0", v("1.1"), v("2.0"))
                .with_description("rename users.name to full_name")
                .prepare_sql("ALTER TABLE users ADD COLUMN full_name TEXT")
                .with_data_migration(DataMigration::Native(copy_names))
                .cleanup_sql("ALTER TABLE users DROP COLUMN name")
                .rolling(false),
        ])
        .unwrap()
    }

    fn executor(pool: &DbPool, registry: Registry, fleet: Arc<dyn FleetMembership>) -> UpgradeExecutor {
        let options = LeaseOptions {
            acquire_timeout: Duration::ZERO,
            ..LeaseOptions::default()
        };
        let lock = MigrationLock::new(pool.clone(), "schema-upgrade", options);
        UpgradeExecutor::new(pool.clone(), Arc::new(registry), lock, fleet, "node-a")
    }

    fn no_fleet() -> Arc<dyn FleetMembership> {
        Arc::new(StaticFleet::new(Vec::new()))
    }

    fn three_step_registry() -> Registry {
        Registry::new(vec![
            MigrationUnit::new("u1", v("1.0"), v("1.1")).prepare_sql("CREATE TABLE t1 (id INTEGER)"),
            MigrationUnit::new("u2", v("1.1"), v("1.2"))
                .prepare_sql("CREATE TABLE t2 (id INTEGER)")
                .rolling(false),
            MigrationUnit::new("u3", v("1.2"), v("1.3")).prepare_sql("CREATE TABLE t3 (id INTEGER)"),
        ])
        .unwrap()
    }

    /// Fleet view that, the first time it is consulted, hands the lease to
    /// `node-b` (as if ours had lapsed and node-b claimed it), then waits
    /// `settle`.
    struct Takeover {
        pool: DbPool,
        settle: Duration,
        fired: AtomicBool,
    }

    impl FleetMembership for Takeover {
        fn list_members(&self) -> Result<Vec<FleetMember>, AppError> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let now = chrono::Utc::now();
                self.pool.get()?.execute(
                    "UPDATE schema_migration_lock
                     SET holder_id = 'node-b', lease_expires_at = ?1, acquired_at = ?2, renewed_at = ?2",
                    [to_ts(now + chrono::Duration::seconds(60)), to_ts(now)],
                )?;
                std::thread::sleep(self.settle);
            }
            Ok(Vec::new())
        }
    }

    fn executor_losing_lease(pool: &DbPool, renew_interval: Duration) -> UpgradeExecutor {
        let options = LeaseOptions {
            acquire_timeout: Duration::ZERO,
            renew_interval,
            ..LeaseOptions::default()
        };
        let lock = MigrationLock::new(pool.clone(), "schema-upgrade", options);
        let fleet = Arc::new(Takeover {
            pool: pool.clone(),
            settle: Duration::from_millis(300),
            fired: AtomicBool::new(false),
        });
        UpgradeExecutor::new(pool.clone(), Arc::new(three_step_registry()), lock, fleet, "node-a")
    }

    fn assert_halted_at_u2_for_node_b(pool: &DbPool, outcome: RunOutcome) {
        match outcome {
            RunOutcome::Failed { at_unit, cause } => {
                assert_eq!(at_unit.as_deref(), Some("u2"));
                assert!(matches!(cause, AppError::LockHeldElsewhere { ref holder, .. } if holder == "node-b"));
            }
            other => panic!("expected lease loss, got {other:?}"),
        }
        let marker = marker_repo::get(pool).unwrap();
        assert_eq!(marker.current_version, v("1.1"));
        assert!(!marker.is_applied("u2") && !marker.is_applied("u3"));
        assert!(!table_exists(pool, "t2") && !table_exists(pool, "t3"));
        // Our guard's release must not have removed the new holder's lease.
        let lock = MigrationLock::new(pool.clone(), "schema-upgrade", LeaseOptions::default());
        assert_eq!(lock.current().unwrap().unwrap().holder_id, "node-b");
    }

    #[test]
    fn test_end_to_end_upgrade_registers_cleanup() {
        let pool = init_test_db_at("1.0").unwrap();
        let exec = executor(&pool, rename_registry(), no_fleet());

        match exec.run(&v("2.0")) {
            RunOutcome::Applied { from, to, units_applied } => {
                assert_eq!(from, v("1.0"));
                assert_eq!(to, v("2.0"));
                assert_eq!(units_applied, vec!["users-1.1", "users-2.0"]);
            }
            other => panic!("expected Applied, got {other:?}"),
        }

        let marker = marker_repo::get(&pool).unwrap();
        assert_eq!(marker.current_version, v("2.0"));
        assert!(marker.is_applied("users-1.1") && marker.is_applied("users-2.0"));
        assert_eq!(marker.pending_ids(), vec!["users-2.0"]);

        let conn = pool.get().unwrap();
        let full: String = conn
            .query_row("SELECT full_name FROM users WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(full, "ada");
        drop(conn);

        let history = history_repo::get_recent(&pool, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.outcome == HistoryOutcome::Applied));
        assert!(exec.lock.current().unwrap().is_none());
    }

    #[test]
    fn test_second_run_is_noop_without_writes() {
        let pool = init_test_db_at("1.0").unwrap();
        let exec = executor(&pool, rename_registry(), no_fleet());
        assert!(matches!(exec.run(&v("2.0")), RunOutcome::Applied { .. }));

        install_write_audit(&pool);
        match exec.run(&v("2.0")) {
            RunOutcome::NoOpAlreadyCurrent { version } => assert_eq!(version, v("2.0")),
            other => panic!("expected NoOp, got {other:?}"),
        }
        assert_eq!(audited_writes(&pool), 0);
    }

    #[test]
    fn test_resumes_at_failed_unit() {
        let pool = init_test_db_at("1.0").unwrap();
        let broken = Registry::new(vec![
            MigrationUnit::new("u1", v("1.0"), v("1.1")).prepare_sql("CREATE TABLE t1 (id INTEGER)"),
            MigrationUnit::new("u2", v("1.1"), v("1.2"))
                .prepare_sql("CREATE TABLE t2 (id INTEGER)")
                .prepare_sql("INSERT INTO missing_table VALUES (1)"),
            MigrationUnit::new("u3", v("1.2"), v("1.3")).prepare_sql("CREATE TABLE t3 (id INTEGER)"),
        ])
        .unwrap();

        match executor(&pool, broken, no_fleet()).run(&v("1.3")) {
            RunOutcome::Failed { at_unit, cause } => {
                assert_eq!(at_unit.as_deref(), Some("u2"));
                assert!(matches!(cause, AppError::UnitExecutionFailure { ref unit_id, .. } if unit_id == "u2"));
                assert_eq!(cause.exit_code(), 20);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let marker = marker_repo::get(&pool).unwrap();
        assert_eq!(marker.current_version, v("1.1"));
        assert_eq!(marker.applied_unit_checkpoints.iter().collect::<Vec<_>>(), vec!["u1"]);
        // The first statement of u2 was rolled back with the rest.
        assert!(!table_exists(&pool, "t2"));
        let u2_history = history_repo::get_by_unit(&pool, "u2").unwrap();
        assert_eq!(u2_history.len(), 1);
        assert_eq!(u2_history[0].outcome, HistoryOutcome::Failed);

        let fixed = Registry::new(vec![
            MigrationUnit::new("u1", v("1.0"), v("1.1")).prepare_sql("CREATE TABLE t1 (id INTEGER)"),
            MigrationUnit::new("u2", v("1.1"), v("1.2")).prepare_sql("CREATE TABLE t2 (id INTEGER)"),
            MigrationUnit::new("u3", v("1.2"), v("1.3")).prepare_sql("CREATE TABLE t3 (id INTEGER)"),
        ])
        .unwrap();
        match executor(&pool, fixed, no_fleet()).run(&v("1.3")) {
            RunOutcome::Applied { from, units_applied, .. } => {
                assert_eq!(from, v("1.1"));
                assert_eq!(units_applied, vec!["u2", "u3"]);
            }
            other => panic!("expected Applied, got {other:?}"),
        }
        assert!(table_exists(&pool, "t2") && table_exists(&pool, "t3"));
    }

    #[test]
    fn test_non_rolling_unit_waits_for_old_members() {
        let pool = init_test_db_at("1.0").unwrap();
        fleet_repo::report(&pool, "node-a", &v("1.0"), MemberStatus::Starting).unwrap();
        fleet_repo::report(&pool, "node-old", &v("1.0"), MemberStatus::Serving).unwrap();
        let fleet: Arc<dyn FleetMembership> = Arc::new(SqliteFleet::new(pool.clone(), None));
        let exec = executor(&pool, rename_registry(), fleet);

        match exec.run(&v("2.0")) {
            RunOutcome::Failed { at_unit, cause } => {
                assert_eq!(at_unit.as_deref(), Some("users-2.0"));
                match cause {
                    AppError::RollingUpgradeUnsafe { blockers, range_from, .. } => {
                        assert_eq!(range_from, "1.1");
                        assert_eq!(blockers, vec!["node-old@1.0 (serving)"]);
                    }
                    other => panic!("expected RollingUpgradeUnsafe, got {other:?}"),
                }
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // The rolling-safe unit before it still committed.
        assert_eq!(exec.current_version().unwrap(), v("1.1"));
        assert!(exec.lock.current().unwrap().is_none());

        // Retrying against the same blockers does not grow the history.
        assert!(!exec.run(&v("2.0")).is_success());
        let refusals = history_repo::get_by_unit(&pool, "users-2.0").unwrap();
        assert_eq!(refusals.len(), 1);
        assert_eq!(refusals[0].outcome, HistoryOutcome::Failed);

        fleet_repo::report(&pool, "node-old", &v("1.1"), MemberStatus::Serving).unwrap();
        match exec.run(&v("2.0")) {
            RunOutcome::Applied { units_applied, .. } => assert_eq!(units_applied, vec!["users-2.0"]),
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[test]
    fn test_lock_held_elsewhere_changes_nothing() {
        let pool = init_test_db_at("1.0").unwrap();
        let exec = executor(&pool, rename_registry(), no_fleet());
        assert!(exec.lock.acquire("node-b", Duration::from_secs(60)).unwrap().is_granted());

        match exec.run(&v("2.0")) {
            RunOutcome::Failed { at_unit: None, cause } => {
                assert!(cause.is_transient());
                assert!(matches!(cause, AppError::LockHeldElsewhere { ref holder, .. } if holder == "node-b"));
            }
            other => panic!("expected lock denial, got {other:?}"),
        }
        assert_eq!(exec.current_version().unwrap(), v("1.0"));
        assert_eq!(exec.lock.current().unwrap().unwrap().holder_id, "node-b");
    }

    #[test]
    fn test_heartbeat_detects_takeover_and_halts() {
        let pool = init_test_db_at("1.0").unwrap();
        // Fast heartbeat: the renewal during the rolling check sees node-b.
        let exec = executor_losing_lease(&pool, Duration::from_millis(50));
        let outcome = exec.run(&v("1.3"));
        assert_halted_at_u2_for_node_b(&pool, outcome);
    }

    #[test]
    fn test_commit_fenced_when_lease_taken_before_heartbeat_notices() {
        let pool = init_test_db_at("1.0").unwrap();
        // The heartbeat never ticks during the run; only the in-transaction check can catch it.
        let exec = executor_losing_lease(&pool, Duration::from_secs(60));
        let outcome = exec.run(&v("1.3"));
        assert_halted_at_u2_for_node_b(&pool, outcome);
        let u2_history = history_repo::get_by_unit(&pool, "u2").unwrap();
        assert!(u2_history.iter().all(|h| h.outcome != HistoryOutcome::Applied));
    }

    fn slow_backfill(_tx: &Transaction<'_>) -> Result<(), AppError> {
        // Longer than the pool's busy_timeout.
        std::thread::sleep(Duration::from_secs(7));
        Ok(())
    }

    fn slow_registry() -> Registry {
        Registry::new(vec![MigrationUnit::new("slow", v("1.0"), v("1.1"))
            .with_data_migration(DataMigration::Native(slow_backfill))])
        .unwrap()
    }

    #[test]
    fn test_peer_mid_unit_reported_as_lock_holder() {
        let pool = init_test_db_at("1.0").unwrap();
        let node_a = executor(&pool, slow_registry(), no_fleet());
        let running = std::thread::spawn(move || node_a.run(&v("1.1")));
        std::thread::sleep(Duration::from_millis(500));

        let options = LeaseOptions {
            acquire_timeout: Duration::ZERO,
            ..LeaseOptions::default()
        };
        let lock = MigrationLock::new(pool.clone(), "schema-upgrade", options);
        let node_b = UpgradeExecutor::new(pool.clone(), Arc::new(slow_registry()), lock, no_fleet(), "node-b");
        match node_b.run(&v("1.1")) {
            RunOutcome::Failed { at_unit: None, cause } => {
                assert!(cause.is_transient());
                assert!(matches!(cause, AppError::LockHeldElsewhere { ref holder, .. } if holder == "node-a"));
            }
            other => panic!("expected LockHeldElsewhere, got {other:?}"),
        }

        assert!(matches!(running.join().unwrap(), RunOutcome::Applied { .. }));
        assert_eq!(marker_repo::get(&pool).unwrap().current_version, v("1.1"));
    }

    #[test]
    fn test_resolution_errors_fail_before_locking() {
        let pool = init_test_db_at("1.0").unwrap();
        let exec = executor(&pool, rename_registry(), no_fleet());

        let outcome = exec.run(&v("3.0"));
        assert!(matches!(outcome, RunOutcome::Failed { at_unit: None, cause: AppError::NoUpgradePath { .. } }));
        assert_eq!(outcome.exit_code(), 10);

        let outcome = exec.run(&v("0.9"));
        assert!(matches!(
            outcome,
            RunOutcome::Failed { cause: AppError::DowngradeNotSupported { .. }, .. }
        ));
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(RunOutcome::NoOpAlreadyCurrent { version: v("2.0") }).unwrap();
        assert_eq!(json["outcome"], "no_op_already_current");
        assert_eq!(json["version"], "2.0");

        let failed = RunOutcome::Failed {
            at_unit: Some("u1".into()),
            cause: AppError::UnitExecutionFailure { unit_id: "u1".into(), cause: "boom".into() },
        };
        let json = serde_json::to_value(failed).unwrap();
        assert_eq!(json["cause"]["kind"], "unit_execution_failure");
    }
}

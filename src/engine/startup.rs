//! Blocking startup step: do not serve traffic until the schema is at the
//! target version.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::StartupSettings;
use crate::engine::executor::{RunOutcome, UpgradeExecutor};
use crate::engine::version::SchemaVersion;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub deadline: Duration,
    pub poll: Duration,
    pub max_backoff: Duration,
}

impl From<&StartupSettings> for WaitPolicy {
    fn from(s: &StartupSettings) -> Self {
        Self {
            deadline: s.deadline(),
            poll: s.poll_interval(),
            max_backoff: s.max_backoff(),
        }
    }
}

/// Operator-facing terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupStatus {
    Done,
    WaitedForPeer,
    NeedsIntervention,
    UnsafeDuringRollout,
}

#[derive(Debug, Serialize)]
pub struct StartupReport {
    pub status: StartupStatus,
    pub version: Option<SchemaVersion>,
    pub attempts: u32,
    pub error: Option<AppError>,
}

impl StartupReport {
    /// Safe to start serving.
    pub fn is_ready(&self) -> bool {
        self.error.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, AppError::exit_code)
    }
}

enum PeerWait {
    Reached(SchemaVersion),
    LockFreed,
    TimedOut(SchemaVersion),
}

/// Run the executor, waiting out a peer's migration and retrying a
/// rolling-unsafe unit with backoff, both bounded by the policy deadline.
pub fn ensure_schema_current(
    executor: &UpgradeExecutor,
    target: &SchemaVersion,
    policy: &WaitPolicy,
) -> StartupReport {
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut waited = false;
    let mut backoff = policy.poll;

    loop {
        attempts += 1;
        let cause = match executor.run(target) {
            RunOutcome::Applied { to, .. } => {
                return finish(if waited { StartupStatus::WaitedForPeer } else { StartupStatus::Done }, Some(to), attempts, None);
            }
            RunOutcome::NoOpAlreadyCurrent { version } => {
                return finish(if waited { StartupStatus::WaitedForPeer } else { StartupStatus::Done }, Some(version), attempts, None);
            }
            RunOutcome::Failed { cause, .. } => cause,
        };

        if !cause.is_transient() {
            let version = executor.current_version().ok();
            return finish(StartupStatus::NeedsIntervention, version, attempts, Some(cause));
        }

        match cause {
            AppError::LockHeldElsewhere { ref holder, .. } => {
                waited = true;
                tracing::info!(holder = %holder, target = %target, "Waiting for peer to finish migrating");
                match wait_for_peer(executor, target, policy, started) {
                    Ok(PeerWait::Reached(version)) => {
                        return finish(StartupStatus::WaitedForPeer, Some(version), attempts, None);
                    }
                    Ok(PeerWait::LockFreed) => {
                        tracing::info!("Peer released the migration lock before reaching target, retrying");
                    }
                    Ok(PeerWait::TimedOut(current)) => {
                        let err = AppError::StartupTimeout {
                            target: target.to_string(),
                            current: current.to_string(),
                            waited_secs: started.elapsed().as_secs(),
                        };
                        return finish(StartupStatus::WaitedForPeer, Some(current), attempts, Some(err));
                    }
                    Err(e) => return finish(StartupStatus::NeedsIntervention, None, attempts, Some(e)),
                }
            }
            // Rolling-upgrade unsafe: old members still serving.
            _ => {
                if started.elapsed() + backoff > policy.deadline {
                    let version = executor.current_version().ok();
                    return finish(StartupStatus::UnsafeDuringRollout, version, attempts, Some(cause));
                }
                tracing::info!(
                    backoff_ms = backoff.as_millis() as u64,
                    "Old-version members still serving, backing off: {}", cause
                );
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(policy.max_backoff.max(policy.poll));
            }
        }
    }
}

fn wait_for_peer(
    executor: &UpgradeExecutor,
    target: &SchemaVersion,
    policy: &WaitPolicy,
    started: Instant,
) -> Result<PeerWait, AppError> {
    loop {
        let current = executor.current_version()?;
        if current >= *target {
            return Ok(PeerWait::Reached(current));
        }
        let now = chrono::Utc::now();
        let held = executor.lock().current()?.is_some_and(|record| !record.is_expired(now));
        if !held {
            return Ok(PeerWait::LockFreed);
        }
        if started.elapsed() + policy.poll > policy.deadline {
            return Ok(PeerWait::TimedOut(current));
        }
        std::thread::sleep(policy.poll);
    }
}

fn finish(
    status: StartupStatus,
    version: Option<SchemaVersion>,
    attempts: u32,
    error: Option<AppError>,
) -> StartupReport {
    match &error {
        None => tracing::info!(status = ?status, attempts, "Schema ready"),
        Some(e) => tracing::error!(status = ?status, attempts, kind = e.kind(), "Schema not ready: {}", e),
    }
    StartupReport {
        status,
        version,
        attempts,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db_at;
    use crate::db::models::{FleetMember, MemberStatus};
    use crate::db::repos::history as history_repo;
    use crate::db::DbPool;
    use crate::engine::fleet::{FleetMembership, StaticFleet};
    use crate::engine::lock::{LeaseOptions, MigrationLock};
    use crate::engine::registry::{MigrationUnit, Registry};
    use crate::engine::version::v;
    use std::sync::Arc;

    fn registry() -> Arc<Registry> {
        Arc::new(
            Registry::new(vec![
                MigrationUnit::new("u1", v("1.0"), v("1.1")).prepare_sql("CREATE TABLE t1 (id INTEGER)"),
                MigrationUnit::new("u2", v("1.1"), v("2.0"))
                    .prepare_sql("CREATE TABLE t2 (id INTEGER)")
                    .rolling(false),
            ])
            .unwrap(),
        )
    }

    fn executor(pool: &DbPool, instance: &str, members: Vec<FleetMember>) -> UpgradeExecutor {
        let options = LeaseOptions {
            acquire_timeout: Duration::ZERO,
            ..LeaseOptions::default()
        };
        let lock = MigrationLock::new(pool.clone(), "schema-upgrade", options);
        let fleet: Arc<dyn FleetMembership> = Arc::new(StaticFleet::new(members));
        UpgradeExecutor::new(pool.clone(), registry(), lock, fleet, instance)
    }

    fn policy(deadline_ms: u64) -> WaitPolicy {
        WaitPolicy {
            deadline: Duration::from_millis(deadline_ms),
            poll: Duration::from_millis(20),
            max_backoff: Duration::from_millis(80),
        }
    }

    #[test]
    fn test_done_when_we_migrate() {
        let pool = init_test_db_at("1.0").unwrap();
        let report = ensure_schema_current(&executor(&pool, "node-a", vec![]), &v("2.0"), &policy(1000));
        assert_eq!(report.status, StartupStatus::Done);
        assert!(report.is_ready());
        assert_eq!(report.version, Some(v("2.0")));
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_waits_for_peer_holding_lock() {
        let pool = init_test_db_at("1.0").unwrap();
        let peer = executor(&pool, "node-b", vec![]);
        assert!(peer.lock().acquire("node-b", Duration::from_secs(30)).unwrap().is_granted());

        let peer_thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            // Re-entrant for node-b: runs and releases.
            assert!(peer.run(&v("2.0")).is_success());
        });

        let report = ensure_schema_current(&executor(&pool, "node-a", vec![]), &v("2.0"), &policy(5000));
        peer_thread.join().unwrap();
        assert_eq!(report.status, StartupStatus::WaitedForPeer);
        assert!(report.is_ready());
        assert_eq!(report.version, Some(v("2.0")));
    }

    #[test]
    fn test_peer_never_finishes_times_out() {
        let pool = init_test_db_at("1.0").unwrap();
        let exec = executor(&pool, "node-a", vec![]);
        exec.lock().acquire("node-b", Duration::from_secs(60)).unwrap();

        let report = ensure_schema_current(&exec, &v("2.0"), &policy(150));
        assert_eq!(report.status, StartupStatus::WaitedForPeer);
        assert!(!report.is_ready());
        assert!(matches!(report.error, Some(AppError::StartupTimeout { .. })));
        assert_eq!(report.version, Some(v("1.0")));
    }

    #[test]
    fn test_crashed_peer_lock_expires_then_we_migrate() {
        let pool = init_test_db_at("1.0").unwrap();
        let exec = executor(&pool, "node-a", vec![]);
        exec.lock().acquire("dead", Duration::from_millis(100)).unwrap();

        let report = ensure_schema_current(&exec, &v("2.0"), &policy(5000));
        assert!(report.is_ready());
        assert_eq!(report.status, StartupStatus::WaitedForPeer);
        assert!(report.attempts >= 2);
        assert_eq!(exec.current_version().unwrap(), v("2.0"));
    }

    #[test]
    fn test_unsafe_during_rollout_after_deadline() {
        let pool = init_test_db_at("1.0").unwrap();
        let old = vec![FleetMember::new("node-old", v("1.0"), MemberStatus::Serving)];
        let report = ensure_schema_current(&executor(&pool, "node-a", old), &v("2.0"), &policy(150));

        assert_eq!(report.status, StartupStatus::UnsafeDuringRollout);
        assert_eq!(report.exit_code(), 13);
        assert!(report.attempts > 1);
        assert_eq!(report.version, Some(v("1.1")));
        // Every backoff retry hit the same blocker; history keeps one refusal.
        assert_eq!(history_repo::get_by_unit(&pool, "u2").unwrap().len(), 1);
    }

    #[test]
    fn test_registry_defect_needs_intervention() {
        let pool = init_test_db_at("1.0").unwrap();
        let report = ensure_schema_current(&executor(&pool, "node-a", vec![]), &v("3.0"), &policy(1000));
        assert_eq!(report.status, StartupStatus::NeedsIntervention);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.exit_code(), 10);
    }
}

//! Fleet membership oracle and the two safety predicates evaluated against it.
//!
//! Where the membership comes from is pluggable: live heartbeats in the
//! shared database, or a static deployment descriptor from configuration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::{FleetSettings, FleetSource};
use crate::db::models::{FleetMember, MemberStatus};
use crate::db::repos::fleet as fleet_repo;
use crate::db::DbPool;
use crate::engine::version::SchemaVersion;
use crate::error::AppError;

/// Read-only view of the service instances currently in the fleet.
pub trait FleetMembership: Send + Sync {
    fn list_members(&self) -> Result<Vec<FleetMember>, AppError>;
}

// ============================================================================
// Implementations
// ============================================================================

/// Members that heartbeat into the `fleet_members` table.
pub struct SqliteFleet {
    pool: DbPool,
    stale_after: Option<Duration>,
}

impl SqliteFleet {
    pub fn new(pool: DbPool, stale_after: Option<Duration>) -> Self {
        Self { pool, stale_after }
    }

    fn is_fresh(&self, member: &FleetMember, now: DateTime<Utc>) -> bool {
        let Some(limit) = self.stale_after else {
            return true;
        };
        let Some(seen) = member
            .last_heartbeat_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        else {
            return false;
        };
        match (now - seen.with_timezone(&Utc)).to_std() {
            Ok(age) => age <= limit,
            // Heartbeat from the future (clock skew): keep it.
            Err(_) => true,
        }
    }
}

impl FleetMembership for SqliteFleet {
    fn list_members(&self) -> Result<Vec<FleetMember>, AppError> {
        let now = Utc::now();
        let (fresh, stale): (Vec<_>, Vec<_>) = fleet_repo::get_all(&self.pool)?
            .into_iter()
            .partition(|m| self.is_fresh(m, now));
        for member in &stale {
            tracing::debug!(instance_id = %member.instance_id, "Ignoring stale fleet heartbeat");
        }
        Ok(fresh)
    }
}

/// Fixed deployment descriptor.
pub struct StaticFleet {
    members: Vec<FleetMember>,
}

impl StaticFleet {
    pub fn new(members: Vec<FleetMember>) -> Self {
        Self { members }
    }
}

impl FleetMembership for StaticFleet {
    fn list_members(&self) -> Result<Vec<FleetMember>, AppError> {
        Ok(self.members.clone())
    }
}

/// Build the configured oracle.
pub fn from_config(settings: &FleetSettings, pool: &DbPool) -> Arc<dyn FleetMembership> {
    match settings.source {
        FleetSource::Database => Arc::new(SqliteFleet::new(
            pool.clone(),
            settings.stale_after_secs.map(Duration::from_secs),
        )),
        FleetSource::Static => Arc::new(StaticFleet::new(settings.members.clone())),
    }
}

// ============================================================================
// Safety predicates
// ============================================================================

fn handles_traffic(status: MemberStatus) -> bool {
    matches!(status, MemberStatus::Serving | MemberStatus::Draining)
}

/// Other members still handling traffic on a schema older than `range_from`.
/// A non-rolling unit may only run when this is empty.
pub fn rolling_upgrade_blockers(
    members: &[FleetMember],
    self_id: &str,
    range_from: &SchemaVersion,
) -> Vec<FleetMember> {
    members
        .iter()
        .filter(|m| m.instance_id != self_id)
        .filter(|m| handles_traffic(m.status))
        .filter(|m| m.reported_version < *range_from)
        .cloned()
        .collect()
}

/// Non-stopped members that have not yet reached `version`.
pub fn convergence_laggards(members: &[FleetMember], version: &SchemaVersion) -> Vec<FleetMember> {
    members
        .iter()
        .filter(|m| m.status != MemberStatus::Stopped)
        .filter(|m| m.reported_version < *version)
        .cloned()
        .collect()
}

/// Poll the oracle until `blockers` comes back empty or `timeout` elapses.
/// Returns the last non-empty blocker list, or an empty list once clear.
/// A zero timeout checks exactly once.
pub fn wait_until_clear<F>(
    oracle: &dyn FleetMembership,
    timeout: Duration,
    poll: Duration,
    mut blockers: F,
) -> Result<Vec<FleetMember>, AppError>
where
    F: FnMut(&[FleetMember]) -> Vec<FleetMember>,
{
    let started = Instant::now();
    loop {
        let members = oracle.list_members()?;
        let found = blockers(&members);
        if found.is_empty() || started.elapsed() + poll > timeout {
            return Ok(found);
        }
        std::thread::sleep(poll);
    }
}

pub fn describe(members: &[FleetMember]) -> Vec<String> {
    members
        .iter()
        .map(|m| format!("{}@{} ({})", m.instance_id, m.reported_version, m.status))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::engine::version::v;
    use std::sync::Mutex;

    fn member(id: &str, version: &str, status: MemberStatus) -> FleetMember {
        FleetMember::new(id, v(version), status)
    }

    #[test]
    fn test_rolling_blockers() {
        let members = vec![
            member("self", "1.0", MemberStatus::Serving),
            member("old", "1.0", MemberStatus::Serving),
            member("draining", "1.0", MemberStatus::Draining),
            member("gone", "0.9", MemberStatus::Stopped),
            member("booting", "1.0", MemberStatus::Starting),
            member("new", "1.1", MemberStatus::Serving),
        ];
        let blockers = rolling_upgrade_blockers(&members, "self", &v("1.1"));
        let ids: Vec<_> = blockers.iter().map(|m| m.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["old", "draining"]);

        assert!(rolling_upgrade_blockers(&members, "self", &v("1.0")).is_empty());
    }

    #[test]
    fn test_convergence_ignores_stopped() {
        let members = vec![
            member("a", "2.0", MemberStatus::Serving),
            member("b", "1.1", MemberStatus::Stopped),
            member("c", "1.1", MemberStatus::Starting),
        ];
        let laggards = convergence_laggards(&members, &v("2.0"));
        assert_eq!(laggards.len(), 1);
        assert_eq!(laggards[0].instance_id, "c");
        assert_eq!(describe(&laggards), vec!["c@1.1 (starting)"]);
    }

    #[test]
    fn test_sqlite_fleet_drops_stale() {
        let pool = init_test_db().unwrap();
        fleet_repo::report(&pool, "fresh", &v("1.0"), MemberStatus::Serving).unwrap();
        pool.get()
            .unwrap()
            .execute(
                "INSERT INTO fleet_members (instance_id, reported_version, status, last_heartbeat_at)
                 VALUES ('old', '1.0', 'serving', '2000-01-01T00:00:00.000Z')",
                [],
            )
            .unwrap();

        let all = SqliteFleet::new(pool.clone(), None).list_members().unwrap();
        assert_eq!(all.len(), 2);
        let live = SqliteFleet::new(pool.clone(), Some(Duration::from_secs(60))).list_members().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].instance_id, "fresh");
    }

    struct Scripted {
        snapshots: Mutex<Vec<Vec<FleetMember>>>,
    }

    impl FleetMembership for Scripted {
        fn list_members(&self) -> Result<Vec<FleetMember>, AppError> {
            let mut snapshots = self.snapshots.lock().unwrap();
            if snapshots.len() > 1 {
                Ok(snapshots.remove(0))
            } else {
                Ok(snapshots[0].clone())
            }
        }
    }

    #[test]
    fn test_wait_until_clear_polls() {
        let oracle = Scripted {
            snapshots: Mutex::new(vec![
                vec![member("old", "1.0", MemberStatus::Serving)],
                vec![member("old", "1.1", MemberStatus::Serving)],
            ]),
        };
        let range_from = v("1.1");
        let check = |m: &[FleetMember]| rolling_upgrade_blockers(m, "self", &range_from);

        let once = wait_until_clear(&oracle, Duration::ZERO, Duration::from_millis(5), check).unwrap();
        assert_eq!(once.len(), 1);

        let waited = wait_until_clear(&oracle, Duration::from_secs(1), Duration::from_millis(5), check).unwrap();
        assert!(waited.is_empty());
    }
}

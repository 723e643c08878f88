use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::models::{PendingCleanup, VersionMarker};
use crate::db::DbPool;
use crate::engine::registry::MigrationUnit;
use crate::engine::version::SchemaVersion;
use crate::error::AppError;

use super::{now_ts, parse_version};

// ============================================================================
// Row Mappers
// ============================================================================

fn row_to_pending(row: &Row) -> rusqlite::Result<PendingCleanup> {
    Ok(PendingCleanup {
        unit_id: row.get("unit_id")?,
        produced_version: parse_version(&row.get::<_, String>("produced_version")?)?,
        registered_at: row.get("registered_at")?,
        attempts: row.get("attempts")?,
        last_error: row.get("last_error")?,
    })
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Create the marker row at `baseline` unless it already exists.
/// Returns true when the row was created.
pub fn bootstrap(conn: &Connection, baseline: &SchemaVersion, instance_id: &str) -> Result<bool, AppError> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO schema_version_marker (id, current_version, updated_by, updated_at)
         VALUES (1, ?1, ?2, ?3)",
        params![baseline.to_string(), instance_id, now_ts()],
    )?;
    Ok(rows > 0)
}

// ============================================================================
// Reads
// ============================================================================

pub fn current_version(conn: &Connection) -> Result<SchemaVersion, AppError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT current_version FROM schema_version_marker WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => SchemaVersion::parse(&raw),
        None => Err(AppError::Internal(
            "version marker missing; database was not bootstrapped".into(),
        )),
    }
}

/// Read the full marker: version, checkpoints and pending cleanups.
pub fn load(conn: &Connection) -> Result<VersionMarker, AppError> {
    let current_version = current_version(conn)?;
    let (updated_by, updated_at): (Option<String>, String) = conn.query_row(
        "SELECT updated_by, updated_at FROM schema_version_marker WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut stmt = conn.prepare("SELECT unit_id FROM schema_unit_checkpoints")?;
    let applied_unit_checkpoints = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(VersionMarker {
        current_version,
        applied_unit_checkpoints,
        cleanup_pending: pending_cleanups(conn)?,
        updated_by,
        updated_at,
    })
}

pub fn get(pool: &DbPool) -> Result<VersionMarker, AppError> {
    let conn = pool.get()?;
    load(&conn)
}

/// Pending cleanups in the order they must run (oldest produced version first).
pub fn pending_cleanups(conn: &Connection) -> Result<Vec<PendingCleanup>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT unit_id, produced_version, registered_at, attempts, last_error
         FROM schema_cleanup_pending",
    )?;
    let mut pending = stmt
        .query_map([], row_to_pending)?
        .collect::<Result<Vec<_>, _>>()?;
    // Versions are not lexically ordered, so sort in Rust.
    pending.sort_by(|a, b| {
        a.produced_version
            .cmp(&b.produced_version)
            .then_with(|| a.unit_id.cmp(&b.unit_id))
    });
    Ok(pending)
}

// ============================================================================
// Writes (called inside the per-unit transaction)
// ============================================================================

/// Advance the marker to `unit.produced_version`, checkpoint the unit and
/// register its cleanup. Must run inside the unit's transaction.
pub fn record_unit_applied(conn: &Connection, unit: &MigrationUnit, instance_id: &str) -> Result<(), AppError> {
    let current = current_version(conn)?;
    if unit.produced_version <= current {
        return Err(AppError::Internal(format!(
            "refusing to move version marker backwards from {current} to {} (unit {})",
            unit.produced_version, unit.id
        )));
    }

    let now = now_ts();
    conn.execute(
        "UPDATE schema_version_marker SET current_version = ?1, updated_by = ?2, updated_at = ?3 WHERE id = 1",
        params![unit.produced_version.to_string(), instance_id, now],
    )?;
    conn.execute(
        "INSERT INTO schema_unit_checkpoints (unit_id, produced_version, applied_by, applied_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![unit.id, unit.produced_version.to_string(), instance_id, now],
    )?;
    if unit.has_cleanup() {
        conn.execute(
            "INSERT OR IGNORE INTO schema_cleanup_pending (unit_id, produced_version, registered_at)
             VALUES (?1, ?2, ?3)",
            params![unit.id, unit.produced_version.to_string(), now],
        )?;
    }
    Ok(())
}

/// Remove a unit from the pending set once its cleanup committed.
pub fn clear_cleanup_pending(conn: &Connection, unit_id: &str) -> Result<bool, AppError> {
    let rows = conn.execute(
        "DELETE FROM schema_cleanup_pending WHERE unit_id = ?1",
        params![unit_id],
    )?;
    Ok(rows > 0)
}

/// Record a failed cleanup attempt. The unit stays pending.
pub fn record_cleanup_failure(conn: &Connection, unit_id: &str, error: &str) -> Result<(), AppError> {
    conn.execute(
        "UPDATE schema_cleanup_pending SET attempts = attempts + 1, last_error = ?2 WHERE unit_id = ?1",
        params![unit_id, error],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_test_db, init_test_db_at};
    use crate::engine::version::v;

    #[test]
    fn test_bootstrap_once() {
        let pool = init_test_db_at("1.0").unwrap();
        let conn = pool.get().unwrap();
        assert!(!bootstrap(&conn, &v("9.9"), "other").unwrap());
        assert_eq!(current_version(&conn).unwrap(), v("1.0"));
    }

    #[test]
    fn test_record_unit_applied() {
        let pool = init_test_db_at("1.0").unwrap();
        let mut conn = pool.get().unwrap();
        let unit = MigrationUnit::new("u1", v("1.0"), v("1.1")).cleanup_sql("SELECT 1");

        let tx = conn.transaction().unwrap();
        record_unit_applied(&tx, &unit, "node-a").unwrap();
        tx.commit().unwrap();

        let marker = load(&conn).unwrap();
        assert_eq!(marker.current_version, v("1.1"));
        assert!(marker.is_applied("u1"));
        assert_eq!(marker.pending_ids(), vec!["u1"]);
        assert_eq!(marker.updated_by.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_marker_never_moves_backwards() {
        let pool = init_test_db_at("2.0").unwrap();
        let conn = pool.get().unwrap();
        let unit = MigrationUnit::new("old", v("1.0"), v("1.1"));
        assert!(record_unit_applied(&conn, &unit, "node-a").is_err());
        assert_eq!(current_version(&conn).unwrap(), v("2.0"));
    }

    #[test]
    fn test_pending_sorted_by_version_and_failures_tracked() {
        let pool = init_test_db().unwrap();
        let conn = pool.get().unwrap();
        for unit in [
            MigrationUnit::new("late", SchemaVersion::baseline(), v("1.10")).cleanup_sql("SELECT 1"),
            MigrationUnit::new("early", SchemaVersion::baseline(), v("1.9")).cleanup_sql("SELECT 1"),
        ] {
            conn.execute(
                "INSERT INTO schema_cleanup_pending (unit_id, produced_version, registered_at) VALUES (?1, ?2, ?3)",
                params![unit.id, unit.produced_version.to_string(), now_ts()],
            )
            .unwrap();
        }
        record_cleanup_failure(&conn, "late", "no such table").unwrap();

        let pending = pending_cleanups(&conn).unwrap();
        assert_eq!(pending[0].unit_id, "early");
        assert_eq!(pending[1].attempts, 1);
        assert_eq!(pending[1].last_error.as_deref(), Some("no such table"));

        assert!(clear_cleanup_pending(&conn, "early").unwrap());
        assert!(!clear_cleanup_pending(&conn, "early").unwrap());
    }
}

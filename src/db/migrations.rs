use rusqlite::Connection;

use crate::error::AppError;

/// Create the upgrade bookkeeping tables. Idempotent.
///
/// These tables are owned by the engine itself and are never touched by
/// migration units, so they evolve through `run_incremental` instead of the
/// unit registry.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Creating upgrade bookkeeping schema");

    conn.execute_batch(SCHEMA)?;

    tracing::debug!("Upgrade bookkeeping schema ready");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Version Marker (single row)
-- ============================================================================

CREATE TABLE IF NOT EXISTS schema_version_marker (
    id              INTEGER PRIMARY KEY CHECK(id = 1),
    current_version TEXT NOT NULL,
    updated_by      TEXT,
    updated_at      TEXT NOT NULL
);

-- ============================================================================
-- Applied unit checkpoints
-- ============================================================================

CREATE TABLE IF NOT EXISTS schema_unit_checkpoints (
    unit_id          TEXT PRIMARY KEY,
    produced_version TEXT NOT NULL,
    applied_by       TEXT NOT NULL,
    applied_at       TEXT NOT NULL
);

-- ============================================================================
-- Deferred cleanups
-- ============================================================================

CREATE TABLE IF NOT EXISTS schema_cleanup_pending (
    unit_id          TEXT PRIMARY KEY,
    produced_version TEXT NOT NULL,
    registered_at    TEXT NOT NULL
);

-- ============================================================================
-- Migration Lock (leased)
-- ============================================================================

CREATE TABLE IF NOT EXISTS schema_migration_lock (
    name             TEXT PRIMARY KEY,
    holder_id        TEXT NOT NULL,
    lease_expires_at TEXT NOT NULL,
    acquired_at      TEXT NOT NULL,
    renewed_at       TEXT NOT NULL
);

-- ============================================================================
-- Fleet membership heartbeats
-- ============================================================================

CREATE TABLE IF NOT EXISTS fleet_members (
    instance_id       TEXT PRIMARY KEY,
    reported_version  TEXT NOT NULL,
    status            TEXT NOT NULL
                      CHECK(status IN ('starting', 'serving', 'draining', 'stopped')),
    last_heartbeat_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fm_status ON fleet_members(status);

-- ============================================================================
-- Upgrade history (append-only)
-- ============================================================================

CREATE TABLE IF NOT EXISTS schema_upgrade_history (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    unit_id      TEXT NOT NULL,
    phase        TEXT NOT NULL CHECK(phase IN ('prepare', 'cleanup')),
    outcome      TEXT NOT NULL CHECK(outcome IN ('applied', 'failed')),
    from_version TEXT,
    to_version   TEXT,
    instance_id  TEXT NOT NULL,
    detail       TEXT,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_suh_unit ON schema_upgrade_history(unit_id);
"#;

/// Column additions to bookkeeping tables created by earlier builds.
pub fn run_incremental(conn: &Connection) -> Result<(), AppError> {
    // Failure diagnostics on deferred cleanups
    let has_attempts = has_column(conn, "schema_cleanup_pending", "attempts")?;
    if !has_attempts {
        conn.execute_batch(
            "ALTER TABLE schema_cleanup_pending ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
             ALTER TABLE schema_cleanup_pending ADD COLUMN last_error TEXT;",
        )?;
        tracing::info!("Added failure diagnostics columns to schema_cleanup_pending");
    }

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, AppError> {
    let count: i64 = conn
        .prepare("SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2")?
        .query_row([table, column], |row| row.get(0))?;
    Ok(count > 0)
}

use rusqlite::{params, Row};

use crate::db::models::{FleetMember, MemberStatus};
use crate::db::DbPool;
use crate::engine::version::SchemaVersion;
use crate::error::AppError;

use super::{now_ts, parse_version};

fn row_to_member(row: &Row) -> rusqlite::Result<FleetMember> {
    let status: String = row.get("status")?;
    Ok(FleetMember {
        instance_id: row.get("instance_id")?,
        reported_version: parse_version(&row.get::<_, String>("reported_version")?)?,
        status: status.parse().map_err(|e: AppError| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        last_heartbeat_at: row.get("last_heartbeat_at")?,
    })
}

/// Insert or refresh this instance's heartbeat.
pub fn report(
    pool: &DbPool,
    instance_id: &str,
    version: &SchemaVersion,
    status: MemberStatus,
) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO fleet_members (instance_id, reported_version, status, last_heartbeat_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(instance_id) DO UPDATE SET
            reported_version = ?2, status = ?3, last_heartbeat_at = ?4",
        params![instance_id, version.to_string(), status.as_str(), now_ts()],
    )?;
    Ok(())
}

pub fn get_all(pool: &DbPool) -> Result<Vec<FleetMember>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT instance_id, reported_version, status, last_heartbeat_at
         FROM fleet_members ORDER BY instance_id",
    )?;
    let rows = stmt.query_map([], row_to_member)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(AppError::Database)
}

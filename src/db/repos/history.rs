use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::models::{HistoryEntry, HistoryOutcome, HistoryPhase};
use crate::db::DbPool;
use crate::error::AppError;

use super::now_ts;

// ---------------------------------------------------------------------------
// Insert (append-only)
// ---------------------------------------------------------------------------

pub struct NewHistoryEntry<'a> {
    pub unit_id: &'a str,
    pub phase: HistoryPhase,
    pub outcome: HistoryOutcome,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub instance_id: &'a str,
    pub detail: Option<String>,
}

/// Append an entry. Takes a connection so prepare/cleanup commits can write
/// their row inside the same transaction.
pub fn insert(conn: &Connection, entry: NewHistoryEntry<'_>) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO schema_upgrade_history
         (unit_id, phase, outcome, from_version, to_version, instance_id, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.unit_id,
            entry.phase.as_str(),
            entry.outcome.as_str(),
            entry.from_version,
            entry.to_version,
            entry.instance_id,
            entry.detail,
            now_ts()
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn row_to_entry(row: &Row) -> rusqlite::Result<HistoryEntry> {
    let phase: String = row.get("phase")?;
    let outcome: String = row.get("outcome")?;
    let convert = |e: AppError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    };
    Ok(HistoryEntry {
        seq: row.get("seq")?,
        unit_id: row.get("unit_id")?,
        phase: HistoryPhase::parse(&phase).map_err(convert)?,
        outcome: HistoryOutcome::parse(&outcome).map_err(convert)?,
        from_version: row.get("from_version")?,
        to_version: row.get("to_version")?,
        instance_id: row.get("instance_id")?,
        detail: row.get("detail")?,
        created_at: row.get("created_at")?,
    })
}

/// Most recent entries first.
pub fn get_recent(pool: &DbPool, limit: u32) -> Result<Vec<HistoryEntry>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM schema_upgrade_history ORDER BY seq DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], row_to_entry)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(AppError::Database)
}

/// Newest entry for a unit, if any.
pub fn latest_for_unit(conn: &Connection, unit_id: &str) -> Result<Option<HistoryEntry>, AppError> {
    conn.query_row(
        "SELECT * FROM schema_upgrade_history WHERE unit_id = ?1 ORDER BY seq DESC LIMIT 1",
        params![unit_id],
        row_to_entry,
    )
    .optional()
    .map_err(AppError::Database)
}

/// All entries for a unit, oldest first.
pub fn get_by_unit(pool: &DbPool, unit_id: &str) -> Result<Vec<HistoryEntry>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM schema_upgrade_history WHERE unit_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![unit_id], row_to_entry)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(AppError::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_insert_and_query() {
        let pool = init_test_db().unwrap();
        let conn = pool.get().unwrap();
        for outcome in [HistoryOutcome::Failed, HistoryOutcome::Applied] {
            insert(
                &conn,
                NewHistoryEntry {
                    unit_id: "u1",
                    phase: HistoryPhase::Prepare,
                    outcome,
                    from_version: Some("1.0".into()),
                    to_version: Some("1.1".into()),
                    instance_id: "node-a",
                    detail: None,
                },
            )
            .unwrap();
        }
        drop(conn);

        let recent = get_recent(&pool, 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].outcome, HistoryOutcome::Applied);

        let for_unit = get_by_unit(&pool, "u1").unwrap();
        assert_eq!(for_unit.len(), 2);
        assert_eq!(for_unit[0].outcome, HistoryOutcome::Failed);
        assert!(get_by_unit(&pool, "u2").unwrap().is_empty());
    }
}

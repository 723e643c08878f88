use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::db::models::{LockGrant, LockRecord};
use crate::error::AppError;

use super::{parse_ts, to_ts};

fn row_to_lock(row: &Row) -> rusqlite::Result<LockRecord> {
    Ok(LockRecord {
        holder_id: row.get("holder_id")?,
        lease_expires_at: parse_ts(&row.get::<_, String>("lease_expires_at")?)?,
        acquired_at: parse_ts(&row.get::<_, String>("acquired_at")?)?,
        renewed_at: parse_ts(&row.get::<_, String>("renewed_at")?)?,
    })
}

pub fn read(conn: &Connection, name: &str) -> Result<Option<LockRecord>, AppError> {
    conn.query_row(
        "SELECT holder_id, lease_expires_at, acquired_at, renewed_at
         FROM schema_migration_lock WHERE name = ?1",
        params![name],
        row_to_lock,
    )
    .optional()
    .map_err(AppError::Database)
}

/// Atomic check-and-set. Granted when there is no lease, the lease expired,
/// or `holder` already owns it (re-entrant; keeps the original `acquired_at`).
pub fn try_acquire(
    conn: &mut Connection,
    name: &str,
    holder: &str,
    lease: Duration,
    now: DateTime<Utc>,
) -> Result<LockGrant, AppError> {
    // IMMEDIATE takes the write lock up front so two instances cannot both
    // observe an expired lease and both claim it.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing = read(&tx, name)?;
    let acquired_at = match &existing {
        Some(current) if current.holder_id != holder && !current.is_expired(now) => {
            return Ok(LockGrant::Denied {
                holder: current.holder_id.clone(),
                expires_at: current.lease_expires_at,
                acquired_at: current.acquired_at,
            });
        }
        Some(current) if current.holder_id == holder && !current.is_expired(now) => current.acquired_at,
        _ => now,
    };

    let record = LockRecord {
        holder_id: holder.to_string(),
        lease_expires_at: now + lease,
        acquired_at,
        renewed_at: now,
    };
    tx.execute(
        "INSERT INTO schema_migration_lock (name, holder_id, lease_expires_at, acquired_at, renewed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(name) DO UPDATE SET
            holder_id = ?2, lease_expires_at = ?3, acquired_at = ?4, renewed_at = ?5",
        params![
            name,
            record.holder_id,
            to_ts(record.lease_expires_at),
            to_ts(record.acquired_at),
            to_ts(record.renewed_at)
        ],
    )?;
    tx.commit()?;
    Ok(LockGrant::Granted(record))
}

/// Extend the lease. Returns false if `holder` no longer owns the lock.
pub fn renew(
    conn: &Connection,
    name: &str,
    holder: &str,
    lease: Duration,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let rows = conn.execute(
        "UPDATE schema_migration_lock SET lease_expires_at = ?3, renewed_at = ?4
         WHERE name = ?1 AND holder_id = ?2",
        params![name, holder, to_ts(now + lease), to_ts(now)],
    )?;
    Ok(rows > 0)
}

/// Drop the lease if `holder` owns it. Returns true when a row was removed.
pub fn release(conn: &Connection, name: &str, holder: &str) -> Result<bool, AppError> {
    let rows = conn.execute(
        "DELETE FROM schema_migration_lock WHERE name = ?1 AND holder_id = ?2",
        params![name, holder],
    )?;
    Ok(rows > 0)
}

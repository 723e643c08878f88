pub mod migrations;
pub mod models;
pub mod repos;

use std::path::Path;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;

use crate::engine::version::SchemaVersion;
use crate::error::AppError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Ok(())
    }
}

/// Open the database, create the bookkeeping schema and bootstrap the
/// version marker at `baseline` if this is a fresh deployment.
pub fn init_db(db_path: &Path, baseline: &SchemaVersion, instance_id: &str) -> Result<DbPool, AppError> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path.display(), "Initializing database");

    let manager = SqliteConnectionManager::file(db_path);
    let pool = Pool::builder()
        .max_size(4)
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;

    // WAL is database-wide, only needs to run once
    {
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        tracing::debug!("SQLite pragmas configured (WAL, FK, busy_timeout)");
    }

    {
        let conn = pool.get()?;
        migrations::run(&conn)?;
        migrations::run_incremental(&conn)?;
        if repos::marker::bootstrap(&conn, baseline, instance_id)? {
            tracing::info!(baseline = %baseline, "Version marker bootstrapped");
        }
    }

    tracing::info!("Database initialized successfully");
    Ok(pool)
}

/// Test database. Derefs to the pool; the backing directory (database, WAL
/// and SHM files) is removed when this is dropped.
#[cfg(test)]
pub struct TestDb {
    pool: DbPool,
    _dir: tempfile::TempDir,
}

#[cfg(test)]
impl std::ops::Deref for TestDb {
    type Target = DbPool;

    fn deref(&self) -> &DbPool {
        &self.pool
    }
}

#[cfg(test)]
pub fn init_test_db() -> Result<TestDb, AppError> {
    init_test_db_at("none")
}

/// Fresh database whose marker starts at `baseline`.
#[cfg(test)]
pub fn init_test_db_at(baseline: &str) -> Result<TestDb, AppError> {
    use std::time::Duration;

    // File-backed so every pooled connection sees the same database.
    let dir = tempfile::Builder::new().prefix("fleet_upgrade_test_").tempdir()?;
    let manager = SqliteConnectionManager::file(dir.path().join("test.db"));
    let pool = Pool::builder()
        .max_size(4)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    migrations::run(&conn)?;
    migrations::run_incremental(&conn)?;
    repos::marker::bootstrap(&conn, &SchemaVersion::parse(baseline)?, "test-bootstrap")?;
    drop(conn);
    Ok(TestDb { pool, _dir: dir })
}

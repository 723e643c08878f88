//! Lease-based migration lock.
//!
//! The lease row lives in the shared database, so the lock works across
//! service instances. A holder must keep renewing; if it crashes the lease
//! simply expires and another instance can take over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{Connection, ErrorCode};

use crate::config::LockSettings;
use crate::db::models::{LockGrant, LockRecord};
use crate::db::repos::lock as lock_repo;
use crate::db::DbPool;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct LeaseOptions {
    pub lease: Duration,
    pub renew_interval: Duration,
    pub acquire_timeout: Duration,
    pub poll_interval: Duration,
    pub stuck_after_leases: u32,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        (&LockSettings::default()).into()
    }
}

impl From<&LockSettings> for LeaseOptions {
    fn from(s: &LockSettings) -> Self {
        Self {
            lease: Duration::from_secs(s.lease_secs),
            renew_interval: Duration::from_secs(s.renew_secs),
            acquire_timeout: Duration::from_secs(s.acquire_timeout_secs),
            poll_interval: Duration::from_millis(s.poll_millis),
            stuck_after_leases: s.stuck_after_leases,
        }
    }
}

fn to_chrono(d: Duration) -> Result<chrono::Duration, AppError> {
    chrono::Duration::from_std(d).map_err(|e| AppError::Config(format!("lease duration out of range: {e}")))
}

#[derive(Clone)]
pub struct MigrationLock {
    pool: DbPool,
    name: String,
    options: LeaseOptions,
}

impl MigrationLock {
    pub fn new(pool: DbPool, name: impl Into<String>, options: LeaseOptions) -> Self {
        Self {
            pool,
            name: name.into(),
            options,
        }
    }

    /// Single attempt. Granted iff unheld, expired, or already ours.
    ///
    /// A write transaction that outlasts `busy_timeout` (the holder applying
    /// a long unit) comes back as a denial naming the recorded holder.
    pub fn acquire(&self, holder: &str, lease: Duration) -> Result<LockGrant, AppError> {
        let mut conn = self.pool.get()?;
        match lock_repo::try_acquire(&mut conn, &self.name, holder, to_chrono(lease)?, Utc::now()) {
            Err(AppError::Database(e)) if is_busy(&e) => {
                tracing::debug!(lock = %self.name, holder = %holder, "Database busy during lock attempt: {}", e);
                self.busy_denial(&conn)
            }
            other => other,
        }
    }

    // WAL readers are not blocked by the writer, so the row is still visible.
    fn busy_denial(&self, conn: &Connection) -> Result<LockGrant, AppError> {
        let now = Utc::now();
        Ok(match lock_repo::read(conn, &self.name)? {
            Some(record) => LockGrant::Denied {
                holder: record.holder_id,
                expires_at: record.lease_expires_at,
                acquired_at: record.acquired_at,
            },
            None => LockGrant::Denied {
                holder: "unknown".into(),
                expires_at: now,
                acquired_at: now,
            },
        })
    }

    /// Extend our lease by the configured duration. False if we lost it.
    pub fn renew(&self, holder: &str) -> Result<bool, AppError> {
        let conn = self.pool.get()?;
        lock_repo::renew(&conn, &self.name, holder, to_chrono(self.options.lease)?, Utc::now())
    }

    /// Re-assert and extend the lease from inside the caller's write
    /// transaction. `LockHeldElsewhere` means another holder took over and
    /// the caller must roll back.
    pub fn fence(&self, conn: &Connection, holder: &str) -> Result<(), AppError> {
        if lock_repo::renew(conn, &self.name, holder, to_chrono(self.options.lease)?, Utc::now())? {
            return Ok(());
        }
        Err(held_elsewhere(lock_repo::read(conn, &self.name)?))
    }

    /// The error for a lease this instance no longer holds.
    pub fn lost_error(&self) -> AppError {
        held_elsewhere(self.current().ok().flatten())
    }

    pub fn release(&self, holder: &str) -> Result<bool, AppError> {
        let conn = self.pool.get()?;
        lock_repo::release(&conn, &self.name, holder)
    }

    pub fn current(&self) -> Result<Option<LockRecord>, AppError> {
        let conn = self.pool.get()?;
        lock_repo::read(&conn, &self.name)
    }

    /// Retry `acquire` until granted or the acquisition timeout elapses.
    /// A timed-out attempt reports the last denial rather than an error.
    pub fn acquire_with_timeout(&self, holder: &str) -> Result<LockGrant, AppError> {
        let started = Instant::now();
        let mut alerted = false;
        loop {
            let grant = self.acquire(holder, self.options.lease)?;
            if let LockGrant::Denied { holder: current, acquired_at, .. } = &grant {
                if !alerted && self.looks_stuck(*acquired_at) {
                    alerted = true;
                    tracing::error!(
                        lock = %self.name,
                        holder = %current,
                        acquired_at = %acquired_at,
                        "Migration lock held past several lease lifetimes; holder may be stuck"
                    );
                }
                if started.elapsed() + self.options.poll_interval <= self.options.acquire_timeout {
                    std::thread::sleep(self.options.poll_interval);
                    continue;
                }
            }
            return Ok(grant);
        }
    }

    fn looks_stuck(&self, acquired_at: chrono::DateTime<Utc>) -> bool {
        let limit = self.options.lease * self.options.stuck_after_leases.max(1);
        match (Utc::now() - acquired_at).to_std() {
            Ok(held) => held > limit,
            Err(_) => false,
        }
    }

    /// Scoped acquisition: a guard that heartbeats and releases on drop.
    pub fn acquire_guard(&self, holder: &str) -> Result<LeaseGuard, AppError> {
        let grant = self.acquire_with_timeout(holder)?;
        self.guard_for(holder, grant)
    }

    /// Like `acquire_guard` but a single attempt, no waiting.
    pub fn try_acquire_guard(&self, holder: &str) -> Result<LeaseGuard, AppError> {
        let grant = self.acquire(holder, self.options.lease)?;
        self.guard_for(holder, grant)
    }

    fn guard_for(&self, holder: &str, grant: LockGrant) -> Result<LeaseGuard, AppError> {
        match grant {
            LockGrant::Granted(record) => {
                tracing::info!(
                    lock = %self.name,
                    holder = %holder,
                    expires_at = %record.lease_expires_at,
                    "Migration lock acquired"
                );
                Ok(LeaseGuard::start(self.clone(), holder.to_string()))
            }
            LockGrant::Denied { holder, expires_at, .. } => Err(AppError::LockHeldElsewhere {
                holder,
                expires_at: expires_at.to_rfc3339(),
            }),
        }
    }
}

fn held_elsewhere(record: Option<LockRecord>) -> AppError {
    match record {
        Some(record) => AppError::LockHeldElsewhere {
            holder: record.holder_id,
            expires_at: record.lease_expires_at.to_rfc3339(),
        },
        None => AppError::LockHeldElsewhere {
            holder: "unknown".into(),
            expires_at: "unknown".into(),
        },
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Held lease with a background heartbeat. Dropping it stops the heartbeat
/// and releases the lease.
pub struct LeaseGuard {
    lock: MigrationLock,
    holder: String,
    lost: Arc<AtomicBool>,
    stop: Option<mpsc::Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    fn start(lock: MigrationLock, holder: String) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let lost = Arc::new(AtomicBool::new(false));

        let heartbeat = {
            let lock = lock.clone();
            let holder = holder.clone();
            let lost = lost.clone();
            let interval = lock.options.renew_interval;
            std::thread::Builder::new()
                .name("migration-lock-heartbeat".into())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => match lock.renew(&holder) {
                            Ok(true) => tracing::trace!(holder = %holder, "Migration lock renewed"),
                            Ok(false) => {
                                tracing::warn!(holder = %holder, "Migration lock lost to another instance");
                                lost.store(true, Ordering::Release);
                                return;
                            }
                            // Transient DB trouble: try again next tick, the lease may still hold.
                            Err(e) => tracing::warn!(holder = %holder, "Migration lock renewal failed: {}", e),
                        },
                        _ => return,
                    }
                })
        };

        let heartbeat = match heartbeat {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("Could not start lock heartbeat, lease will rely on its TTL: {}", e);
                None
            }
        };

        Self {
            lock,
            holder,
            lost,
            stop: Some(stop_tx),
            heartbeat,
        }
    }

    /// True once a renewal found the lease owned by someone else.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }
        match self.lock.release(&self.holder) {
            Ok(true) => tracing::info!(holder = %self.holder, "Migration lock released"),
            Ok(false) => tracing::debug!(holder = %self.holder, "Migration lock already gone at release"),
            Err(e) => tracing::warn!(
                holder = %self.holder,
                "Migration lock release failed, lease will expire: {}", e
            ),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub holder_id: String,
    pub lease_expires_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockGrant {
    Granted(LockRecord),
    Denied {
        holder: String,
        expires_at: DateTime<Utc>,
        acquired_at: DateTime<Utc>,
    },
}

impl LockGrant {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockGrant::Granted(_))
    }
}

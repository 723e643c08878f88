use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::version::SchemaVersion;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// Booting; not yet accepting traffic.
    Starting,
    /// Accepting traffic against the schema it reports.
    Serving,
    /// Finishing in-flight work, no new traffic.
    Draining,
    /// Decommissioned; ignored by safety checks.
    Stopped,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Starting => "starting",
            MemberStatus::Serving => "serving",
            MemberStatus::Draining => "draining",
            MemberStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(MemberStatus::Starting),
            "serving" => Ok(MemberStatus::Serving),
            "draining" => Ok(MemberStatus::Draining),
            "stopped" => Ok(MemberStatus::Stopped),
            other => Err(AppError::Validation(format!("unknown member status '{other}'"))),
        }
    }
}

/// One service instance as seen by the fleet membership oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetMember {
    pub instance_id: String,
    pub reported_version: SchemaVersion,
    pub status: MemberStatus,
    #[serde(default)]
    pub last_heartbeat_at: Option<String>,
}

impl FleetMember {
    pub fn new(instance_id: impl Into<String>, reported_version: SchemaVersion, status: MemberStatus) -> Self {
        Self {
            instance_id: instance_id.into(),
            reported_version,
            status,
            last_heartbeat_at: None,
        }
    }
}

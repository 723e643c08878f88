use serde::Serialize;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryPhase {
    Prepare,
    Cleanup,
}

impl HistoryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryPhase::Prepare => "prepare",
            HistoryPhase::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "prepare" => Ok(HistoryPhase::Prepare),
            "cleanup" => Ok(HistoryPhase::Cleanup),
            other => Err(AppError::Internal(format!("unknown history phase '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOutcome {
    Applied,
    Failed,
}

impl HistoryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryOutcome::Applied => "applied",
            HistoryOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "applied" => Ok(HistoryOutcome::Applied),
            "failed" => Ok(HistoryOutcome::Failed),
            other => Err(AppError::Internal(format!("unknown history outcome '{other}'"))),
        }
    }
}

/// One row of the append-only upgrade history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub seq: i64,
    pub unit_id: String,
    pub phase: HistoryPhase,
    pub outcome: HistoryOutcome,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub instance_id: String,
    pub detail: Option<String>,
    pub created_at: String,
}

use std::collections::BTreeSet;

use serde::Serialize;

use crate::engine::version::SchemaVersion;

// ============================================================================
// Version Marker
// ============================================================================

/// Durable record of the applied schema state.
#[derive(Debug, Clone, Serialize)]
pub struct VersionMarker {
    pub current_version: SchemaVersion,
    pub applied_unit_checkpoints: BTreeSet<String>,
    pub cleanup_pending: Vec<PendingCleanup>,
    pub updated_by: Option<String>,
    pub updated_at: String,
}

impl VersionMarker {
    pub fn is_applied(&self, unit_id: &str) -> bool {
        self.applied_unit_checkpoints.contains(unit_id)
    }

    pub fn pending_ids(&self) -> Vec<&str> {
        self.cleanup_pending.iter().map(|p| p.unit_id.as_str()).collect()
    }
}

// ============================================================================
// Deferred cleanup
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PendingCleanup {
    pub unit_id: String,
    pub produced_version: SchemaVersion,
    pub registered_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
}

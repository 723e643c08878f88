use serde::Serialize;

/// Crate-wide error type. Every fallible function returns `Result<T, AppError>`.
/// Serializes as `{ error, kind }` so `migrate status --json` and run reports
/// carry structured failures.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Manifest parse error: {0}")]
    Manifest(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No upgrade path from version {at} towards {target}")]
    NoUpgradePath { at: String, target: String },

    #[error("Ambiguous upgrade path at version {at}: units {units:?} all start there")]
    AmbiguousUpgradePath { at: String, units: Vec<String> },

    #[error("Downgrade from {current} to {target} is not supported")]
    DowngradeNotSupported { current: String, target: String },

    #[error("Unit {unit_id} cannot run during a rolling upgrade: members {blockers:?} still serve below {range_from}")]
    RollingUpgradeUnsafe {
        unit_id: String,
        range_from: String,
        blockers: Vec<String>,
    },

    #[error("Migration lock is held by {holder} until {expires_at}")]
    LockHeldElsewhere { holder: String, expires_at: String },

    #[error("Unit {unit_id} failed: {cause}")]
    UnitExecutionFailure { unit_id: String, cause: String },

    #[error("Cleanup for unit {unit_id} failed: {cause}")]
    CleanupExecutionFailure { unit_id: String, cause: String },

    #[error("Timed out after {waited_secs}s waiting for schema version {target} (marker at {current})")]
    StartupTimeout {
        target: String,
        current: String,
        waited_secs: u64,
    },

    /// A schema action or data migration failed; `context` names the step.
    #[error("{context}: {source}")]
    Action {
        context: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Conditions expected to clear on their own as the fleet converges.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::LockHeldElsewhere { .. } | AppError::RollingUpgradeUnsafe { .. }
        )
    }

    /// Process exit code for the `migrate` binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::NoUpgradePath { .. } => 10,
            AppError::AmbiguousUpgradePath { .. } => 11,
            AppError::DowngradeNotSupported { .. } => 12,
            AppError::RollingUpgradeUnsafe { .. } => 13,
            AppError::LockHeldElsewhere { .. } => 14,
            AppError::UnitExecutionFailure { .. } => 20,
            AppError::CleanupExecutionFailure { .. } => 21,
            AppError::Config(_) | AppError::Manifest(_) | AppError::Validation(_) => 30,
            _ => 1,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Manifest(_) => "manifest",
            AppError::Config(_) => "config",
            AppError::Validation(_) => "validation",
            AppError::NoUpgradePath { .. } => "no_upgrade_path",
            AppError::AmbiguousUpgradePath { .. } => "ambiguous_upgrade_path",
            AppError::DowngradeNotSupported { .. } => "downgrade_not_supported",
            AppError::RollingUpgradeUnsafe { .. } => "rolling_upgrade_unsafe",
            AppError::LockHeldElsewhere { .. } => "lock_held_elsewhere",
            AppError::UnitExecutionFailure { .. } => "unit_execution_failure",
            AppError::CleanupExecutionFailure { .. } => "cleanup_execution_failure",
            AppError::StartupTimeout { .. } => "startup_timeout",
            AppError::Action { .. } => "action",
            AppError::Internal(_) => "internal",
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}

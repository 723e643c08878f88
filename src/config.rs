//! Runtime configuration.
//!
//! Layering, lowest precedence first: built-in defaults, TOML file
//! (`--config` or `FLEET_UPGRADE_CONFIG`), environment (`.env` honoured),
//! then CLI flags applied by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::models::FleetMember;
use crate::engine::version::SchemaVersion;
use crate::error::AppError;
use crate::validation;

pub const ENV_CONFIG: &str = "FLEET_UPGRADE_CONFIG";
pub const ENV_DATABASE: &str = "FLEET_UPGRADE_DATABASE";
pub const ENV_MANIFEST: &str = "FLEET_UPGRADE_MANIFEST";
pub const ENV_INSTANCE_ID: &str = "FLEET_UPGRADE_INSTANCE_ID";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpgradeConfig {
    pub database: PathBuf,
    pub manifest: PathBuf,
    pub instance_id: Option<String>,
    pub baseline_version: SchemaVersion,
    /// Directory for daily-rotated log files. Stdout only when unset.
    pub log_dir: Option<PathBuf>,
    pub lock: LockSettings,
    pub fleet: FleetSettings,
    pub startup: StartupSettings,
    pub cleanup: CleanupSettings,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("data/fleet-upgrade.db"),
            manifest: PathBuf::from("migrations/units.toml"),
            instance_id: None,
            baseline_version: SchemaVersion::baseline(),
            log_dir: None,
            lock: LockSettings::default(),
            fleet: FleetSettings::default(),
            startup: StartupSettings::default(),
            cleanup: CleanupSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockSettings {
    pub name: String,
    pub lease_secs: u64,
    /// Heartbeat interval; must stay well under `lease_secs`.
    pub renew_secs: u64,
    pub acquire_timeout_secs: u64,
    pub poll_millis: u64,
    /// A lease held this many lifetimes since acquisition raises an alert.
    pub stuck_after_leases: u32,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            name: "schema-upgrade".into(),
            lease_secs: 30,
            renew_secs: 10,
            acquire_timeout_secs: 15,
            poll_millis: 500,
            stuck_after_leases: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetSource {
    /// Live heartbeats in the `fleet_members` table.
    Database,
    /// Deployment descriptor listed under `[[fleet.members]]`.
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetSettings {
    pub source: FleetSource,
    /// Ignore database heartbeats older than this. Unset keeps every row.
    pub stale_after_secs: Option<u64>,
    pub convergence_timeout_secs: u64,
    pub rolling_check_timeout_secs: u64,
    pub poll_millis: u64,
    pub members: Vec<FleetMember>,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            source: FleetSource::Database,
            stale_after_secs: None,
            convergence_timeout_secs: 0,
            rolling_check_timeout_secs: 0,
            poll_millis: 1000,
            members: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StartupSettings {
    pub wait_deadline_secs: u64,
    pub poll_millis: u64,
    pub max_backoff_secs: u64,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            wait_deadline_secs: 600,
            poll_millis: 2000,
            max_backoff_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupSettings {
    pub interval_secs: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl UpgradeConfig {
    /// Load defaults, the optional TOML file and environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let from_env = std::env::var(ENV_CONFIG).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, AppError> {
        toml::from_str(text).map_err(|e| AppError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(db) = std::env::var(ENV_DATABASE) {
            self.database = PathBuf::from(db);
        }
        if let Ok(manifest) = std::env::var(ENV_MANIFEST) {
            self.manifest = PathBuf::from(manifest);
        }
        if let Ok(id) = std::env::var(ENV_INSTANCE_ID) {
            self.instance_id = Some(id);
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.lock.lease_secs == 0 {
            return Err(AppError::Config("lock.lease_secs must be positive".into()));
        }
        if self.lock.renew_secs == 0 || self.lock.renew_secs >= self.lock.lease_secs {
            return Err(AppError::Config(format!(
                "lock.renew_secs ({}) must be positive and below lock.lease_secs ({})",
                self.lock.renew_secs, self.lock.lease_secs
            )));
        }
        if self.lock.poll_millis == 0 || self.fleet.poll_millis == 0 || self.startup.poll_millis == 0 {
            return Err(AppError::Config("poll intervals must be positive".into()));
        }
        if self.cleanup.interval_secs == 0 {
            return Err(AppError::Config("cleanup.interval_secs must be positive".into()));
        }
        validation::require_valid_id("lock.name", &self.lock.name)?;
        if let Some(id) = &self.instance_id {
            validation::require_valid_id("instance_id", id)?;
        }
        Ok(())
    }

    /// Configured instance id, or `<hostname>-<random suffix>`.
    pub fn resolved_instance_id(&self) -> String {
        if let Some(id) = &self.instance_id {
            return id.clone();
        }
        let host: String = whoami::fallible::hostname()
            .unwrap_or_else(|_| "instance".into())
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{host}-{}", &suffix[..8])
    }
}

impl StartupSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.wait_deadline_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_millis)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

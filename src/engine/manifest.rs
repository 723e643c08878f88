//! Declarative registry source.
//!
//! ```toml
//! [[unit]]
//! id = "1.1-2.0"
//! range_from = "1.1"
//! produced_version = "2.0"
//! supports_rolling_upgrade = false
//! prepare = [{ sql = "ALTER TABLE hosts ADD COLUMN display_name TEXT" }]
//! data_migration = [{ script = "sql/2.0/backfill.sql" }]
//! cleanup = [{ sql = "ALTER TABLE hosts DROP COLUMN name" }]
//! ```
//!
//! Script paths are resolved against the manifest's directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::registry::{Action, DataMigration, MigrationUnit, Registry};
use crate::engine::version::SchemaVersion;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    #[serde(default, rename = "unit")]
    units: Vec<ManifestUnit>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestUnit {
    id: Option<String>,
    range_from: SchemaVersion,
    range_to: Option<SchemaVersion>,
    produced_version: SchemaVersion,
    description: Option<String>,
    #[serde(default = "default_rolling")]
    supports_rolling_upgrade: bool,
    #[serde(default)]
    prepare: Vec<Action>,
    #[serde(default)]
    data_migration: Vec<Action>,
    #[serde(default)]
    cleanup: Vec<Action>,
}

fn default_rolling() -> bool {
    true
}

impl ManifestUnit {
    fn into_unit(self, base_dir: &Path) -> MigrationUnit {
        let id = self
            .id
            .unwrap_or_else(|| format!("{}-{}", self.range_from, self.produced_version));
        let resolve = |actions: Vec<Action>| -> Vec<Action> {
            actions
                .into_iter()
                .map(|a| match a {
                    Action::Script(p) if p.is_relative() => Action::Script(base_dir.join(p)),
                    other => other,
                })
                .collect()
        };

        let mut unit = MigrationUnit::new(id, self.range_from, self.produced_version)
            .rolling(self.supports_rolling_upgrade);
        if let Some(range_to) = self.range_to {
            unit = unit.with_range_to(range_to);
        }
        if let Some(description) = self.description {
            unit = unit.with_description(description);
        }
        unit.prepare_actions = resolve(self.prepare);
        unit.cleanup_actions = resolve(self.cleanup);
        let data = resolve(self.data_migration);
        if !data.is_empty() {
            unit = unit.with_data_migration(DataMigration::Actions(data));
        }
        unit
    }
}

/// Parse manifest text. `base_dir` anchors relative script paths.
pub fn parse(text: &str, base_dir: &Path) -> Result<Registry, AppError> {
    let file: ManifestFile = toml::from_str(text)?;
    let units = file
        .units
        .into_iter()
        .map(|u| u.into_unit(base_dir))
        .collect();
    Registry::new(units)
}

/// Load and validate a manifest file. Called once at boot.
pub fn load(path: &Path) -> Result<Registry, AppError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("cannot read manifest {}: {e}", path.display()))
    })?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(PathBuf::new);
    let registry = parse(&text, &base_dir)?;
    tracing::info!(
        path = %path.display(),
        units = registry.len(),
        "Loaded migration manifest"
    );
    Ok(registry)
}

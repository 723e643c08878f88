//! Migration unit registry.
//!
//! Units are plain records: a version edge, ordered action lists and a
//! rolling-upgrade flag. The registry is built explicitly at startup (from a
//! manifest or a compiled table) and handed to the resolver, executor and
//! cleanup scheduler; nothing is registered globally.

use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Transaction;
use serde::Deserialize;

use crate::engine::version::SchemaVersion;
use crate::error::AppError;
use crate::validation;

/// A single schema action.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Inline SQL, executed as a batch.
    Sql(String),
    /// Path to a SQL script file, executed as a batch.
    Script(PathBuf),
}

impl Action {
    pub fn describe(&self) -> String {
        match self {
            Action::Sql(sql) => {
                let first = sql.trim().lines().next().unwrap_or_default();
                format!("sql: {first}")
            }
            Action::Script(path) => format!("script: {}", path.display()),
        }
    }
}

/// Compiled data migration, run inside the unit transaction.
pub type NativeMigration = fn(&Transaction<'_>) -> Result<(), AppError>;

/// The optional data-migration step of a unit.
#[derive(Debug, Clone)]
pub enum DataMigration {
    Actions(Vec<Action>),
    Native(NativeMigration),
}

/// One versioned step: the edge `range_from → produced_version`.
#[derive(Debug, Clone)]
pub struct MigrationUnit {
    pub id: String,
    pub range_from: SchemaVersion,
    pub range_to: SchemaVersion,
    pub produced_version: SchemaVersion,
    pub description: Option<String>,
    pub prepare_actions: Vec<Action>,
    pub data_migration: Option<DataMigration>,
    pub cleanup_actions: Vec<Action>,
    pub supports_rolling_upgrade: bool,
}

impl MigrationUnit {
    /// The edge `from → to`. `range_to` starts out equal to `to`.
    pub fn new(id: impl Into<String>, from: SchemaVersion, to: SchemaVersion) -> Self {
        Self {
            id: id.into(),
            range_to: to.clone(),
            range_from: from,
            produced_version: to,
            description: None,
            prepare_actions: Vec::new(),
            data_migration: None,
            cleanup_actions: Vec::new(),
            supports_rolling_upgrade: true,
        }
    }

    pub fn with_range_to(mut self, range_to: SchemaVersion) -> Self {
        self.range_to = range_to;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn prepare(mut self, action: Action) -> Self {
        self.prepare_actions.push(action);
        self
    }

    pub fn prepare_sql(self, sql: impl Into<String>) -> Self {
        self.prepare(Action::Sql(sql.into()))
    }

    pub fn cleanup(mut self, action: Action) -> Self {
        self.cleanup_actions.push(action);
        self
    }

    pub fn cleanup_sql(self, sql: impl Into<String>) -> Self {
        self.cleanup(Action::Sql(sql.into()))
    }

    pub fn with_data_migration(mut self, step: DataMigration) -> Self {
        self.data_migration = Some(step);
        self
    }

    pub fn rolling(mut self, supports_rolling_upgrade: bool) -> Self {
        self.supports_rolling_upgrade = supports_rolling_upgrade;
        self
    }

    pub fn has_cleanup(&self) -> bool {
        !self.cleanup_actions.is_empty()
    }

    fn validate(&self) -> Result<(), AppError> {
        validation::require_valid_id("unit id", &self.id)?;
        if self.range_from > self.range_to {
            return Err(AppError::Config(format!(
                "unit {}: range_from {} is above range_to {}",
                self.id, self.range_from, self.range_to
            )));
        }
        if self.range_to > self.produced_version || self.range_from >= self.produced_version {
            return Err(AppError::Config(format!(
                "unit {}: produced version {} must be above its accepted range {}..{}",
                self.id, self.produced_version, self.range_from, self.range_to
            )));
        }
        Ok(())
    }
}

/// Validated, immutable catalog of migration units.
#[derive(Debug, Clone)]
pub struct Registry {
    units: Vec<MigrationUnit>,
    by_from: HashMap<SchemaVersion, Vec<usize>>,
}

impl Registry {
    /// Validate and index `units`. Fails fast on authoring defects.
    pub fn new(units: Vec<MigrationUnit>) -> Result<Self, AppError> {
        let mut ids: HashMap<&str, usize> = HashMap::new();
        let mut edges: HashMap<(&SchemaVersion, &SchemaVersion), &str> = HashMap::new();

        for (idx, unit) in units.iter().enumerate() {
            unit.validate()?;
            if ids.insert(unit.id.as_str(), idx).is_some() {
                return Err(AppError::Config(format!("duplicate unit id '{}'", unit.id)));
            }
            if let Some(existing) = edges.insert((&unit.range_from, &unit.range_to), &unit.id) {
                let mut clash = vec![existing.to_string(), unit.id.clone()];
                clash.sort();
                return Err(AppError::AmbiguousUpgradePath {
                    at: unit.range_from.to_string(),
                    units: clash,
                });
            }
        }

        let mut by_from: HashMap<SchemaVersion, Vec<usize>> = HashMap::new();
        for (idx, unit) in units.iter().enumerate() {
            by_from.entry(unit.range_from.clone()).or_default().push(idx);
        }

        tracing::debug!(units = units.len(), "Migration registry validated");
        Ok(Self { units, by_from })
    }

    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MigrationUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Units whose `range_from` equals `version`, ordered by id.
    pub fn outgoing(&self, version: &SchemaVersion) -> Vec<&MigrationUnit> {
        let mut found: Vec<&MigrationUnit> = self
            .by_from
            .get(version)
            .map(|idxs| idxs.iter().map(|i| &self.units[*i]).collect())
            .unwrap_or_default();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Highest version any unit produces.
    pub fn latest_version(&self) -> Option<&SchemaVersion> {
        self.units.iter().map(|u| &u.produced_version).max()
    }
}

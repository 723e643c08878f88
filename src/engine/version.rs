use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AppError;

/// Literal used for the pre-bootstrap baseline.
pub const BASELINE: &str = "none";

/// A dotted numeric schema version such as `4.3.1`.
///
/// Missing trailing components compare as zero, so `4.3` and `4.3.0` are
/// equal. The baseline `none` has no components and sorts below every
/// real version.
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    parts: Vec<u32>,
}

impl SchemaVersion {
    pub fn baseline() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn is_baseline(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case(BASELINE) {
            return Ok(Self::baseline());
        }
        if trimmed.is_empty() {
            return Err(AppError::Validation("schema version cannot be empty".into()));
        }
        let parts = trimmed
            .split('.')
            .map(|p| {
                p.parse::<u32>().map_err(|_| {
                    AppError::Validation(format!("invalid schema version '{raw}'"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { parts })
    }

    fn component(&self, idx: usize) -> u32 {
        self.parts.get(idx).copied().unwrap_or(0)
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_baseline(), other.is_baseline()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SchemaVersion {}

impl Hash for SchemaVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Trailing zeros are insignificant for equality, so they must be for hashing too.
        let significant = self
            .parts
            .iter()
            .rposition(|p| *p != 0)
            .map(|last| &self.parts[..=last])
            .unwrap_or(&[]);
        self.is_baseline().hash(state);
        significant.hash(state);
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_baseline() {
            return f.write_str(BASELINE);
        }
        let joined = self
            .parts
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".");
        f.write_str(&joined)
    }
}

impl FromStr for SchemaVersion {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) fn v(raw: &str) -> SchemaVersion {
    SchemaVersion::parse(raw).unwrap()
}

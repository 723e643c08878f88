//! Path resolution over the registry's version graph.
//!
//! Versions are nodes and units are edges keyed by `range_from`. Walking
//! from the current version, each frontier must have exactly one outgoing
//! edge. Every edge strictly increases the version, so the walk terminates.

use crate::engine::registry::{MigrationUnit, Registry};
use crate::engine::version::SchemaVersion;
use crate::error::AppError;

/// Compute the contiguous chain of units from `current` to `target`.
///
/// Returns an empty chain when already at the target. Never skips a gap and
/// never picks between competing edges.
pub fn resolve<'r>(
    registry: &'r Registry,
    current: &SchemaVersion,
    target: &SchemaVersion,
) -> Result<Vec<&'r MigrationUnit>, AppError> {
    if current == target {
        return Ok(Vec::new());
    }
    if current > target {
        return Err(AppError::DowngradeNotSupported {
            current: current.to_string(),
            target: target.to_string(),
        });
    }

    let mut chain = Vec::new();
    let mut frontier = current.clone();

    while frontier < *target {
        let outgoing = registry.outgoing(&frontier);
        let unit = match outgoing.as_slice() {
            [] => {
                return Err(AppError::NoUpgradePath {
                    at: frontier.to_string(),
                    target: target.to_string(),
                })
            }
            [only] => *only,
            many => {
                return Err(AppError::AmbiguousUpgradePath {
                    at: frontier.to_string(),
                    units: many.iter().map(|u| u.id.clone()).collect(),
                })
            }
        };
        chain.push(unit);
        frontier = unit.produced_version.clone();
    }

    if frontier != *target {
        // The last edge jumped past the target; there is no way to stop on it.
        return Err(AppError::NoUpgradePath {
            at: frontier.to_string(),
            target: target.to_string(),
        });
    }

    tracing::debug!(
        from = %current,
        to = %target,
        steps = chain.len(),
        "Resolved upgrade path"
    );
    Ok(chain)
}

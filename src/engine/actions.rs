use rusqlite::Transaction;

use crate::engine::registry::{Action, DataMigration};
use crate::error::AppError;

/// Run `actions` in declared order on `tx`. A failure is wrapped in
/// `AppError::Action` naming the step; the caller decides which taxonomy
/// failure it becomes.
pub fn apply(tx: &Transaction<'_>, phase: &str, actions: &[Action]) -> Result<(), AppError> {
    for (idx, action) in actions.iter().enumerate() {
        tracing::debug!(phase, step = idx + 1, action = %action.describe(), "Applying schema action");
        run_one(tx, action).map_err(|e| AppError::Action {
            context: format!("{phase} action #{} ({})", idx + 1, action.describe()),
            source: Box::new(e),
        })?;
    }
    Ok(())
}

pub fn apply_data_migration(tx: &Transaction<'_>, step: &DataMigration) -> Result<(), AppError> {
    match step {
        DataMigration::Actions(actions) => apply(tx, "data migration", actions),
        DataMigration::Native(migrate) => migrate(tx).map_err(|e| AppError::Action {
            context: "data migration".into(),
            source: Box::new(e),
        }),
    }
}

fn run_one(tx: &Transaction<'_>, action: &Action) -> Result<(), AppError> {
    match action {
        Action::Sql(sql) => tx.execute_batch(sql)?,
        Action::Script(path) => {
            let sql = std::fs::read_to_string(path).map_err(|e| {
                AppError::Io(std::io::Error::new(e.kind(), format!("cannot read {}: {e}", path.display())))
            })?;
            tx.execute_batch(&sql)?
        }
    }
    Ok(())
}

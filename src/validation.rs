use crate::error::AppError;

pub fn require_non_empty(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Identifiers end up in lock rows, checkpoints and log lines, so keep them
/// to a conservative character set.
pub fn require_valid_id(field: &str, value: &str) -> Result<(), AppError> {
    require_non_empty(field, value)?;
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'));
    if !ok {
        return Err(AppError::Validation(format!(
            "{field} must be a valid ID (got '{value}')"
        )));
    }
    Ok(())
}

//! Opaque caller-facing task identifiers.
//!
//! Task ids are short random alphanumeric strings. They carry no provider
//! information, so provider job handles never leak to callers.

use rand::Rng;

use crate::error::CoreError;

/// Length of a generated task id.
pub const TASK_ID_LENGTH: usize = 16;

/// Longest task id accepted on lookup.
pub const MAX_TASK_ID_LENGTH: usize = 128;

/// Generate a new random task id.
pub fn new_task_id() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(TASK_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// Normalize a caller-supplied task id.
///
/// Surrounding whitespace is stripped; empty, oversized, or non-alphanumeric
/// ids are rejected before they reach storage.
pub fn normalize_task_id(raw: &str) -> Result<&str, CoreError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(CoreError::Validation("Task id must not be empty".into()));
    }
    if id.len() > MAX_TASK_ID_LENGTH {
        return Err(CoreError::Validation(format!(
            "Task id must be at most {MAX_TASK_ID_LENGTH} characters"
        )));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(CoreError::Validation(
            "Task id must be alphanumeric".into(),
        ));
    }
    Ok(id)
}

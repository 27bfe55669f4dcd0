//! Errors raised while grouping requests by field.

use thiserror::Error;

/// Reasons the field merger cannot build runner arguments.
///
/// Only the requests involved fail: a malformed request is put in a failed
/// group of its own, and the scheduler reports the error to it as a runner
/// error.
#[derive(Debug, Error)]
pub enum FieldMergeError {
    #[error("request arguments must be a JSON object, got {found}")]
    NotAnObject { found: &'static str },

    #[error("request arguments are missing field '{field}'")]
    MissingField { field: String },

    #[error("field '{field}' must be a string or a number, got {value}")]
    UnsupportedValue { field: String, value: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// Record-level error types shared across the workspace

use thiserror::Error;

/// Errors raised while decoding an execution record from its KV hash form.
///
/// A record that fails to decode is malformed: the owning worker marks the
/// execution `failed` without consulting the retry policy.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A required hash field was absent.
    #[error("execution record missing required field: {0}")]
    MissingField(&'static str),

    /// A hash field was present but not parseable as its typed value.
    #[error("invalid value for field {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    /// The event payload was not valid JSON.
    #[error("unparseable event payload: {0}")]
    MalformedPayload(String),
}

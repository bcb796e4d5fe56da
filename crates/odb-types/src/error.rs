use thiserror::Error;

/// Errors produced by object model operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("object is immutable")]
    Immutable,

    #[error("compound key must have 1..={max} parts, got {actual}")]
    InvalidKeyArity { max: usize, actual: usize },

    #[error("field path '{path}' cannot be resolved: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("field '{field}' has unexpected shape: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("invalid date '{0}'")]
    InvalidDate(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("merge conflict: {0}")]
    MergeConflict(String),
}

impl TypeError {
    pub(crate) fn path(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn field(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

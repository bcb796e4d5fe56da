use odb_rules::{ErrorKind, RulesError, ValidationError};
use odb_store::StoreError;
use odb_types::TypeError;

use crate::status::ChainStatus;

/// Errors produced by chain layer operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The operation or block was rejected. The layer is unchanged.
    #[error(transparent)]
    Validation(ValidationError),

    /// The rules engine failed for a reason other than a rule violation.
    #[error("rules error: {0}")]
    Rules(RulesError),

    /// The persistence collaborator failed, e.g. a stale superblock.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("object model error: {0}")]
    Types(#[from] TypeError),

    #[error("chain layer is locked: {status}")]
    Locked { status: ChainStatus },

    /// A mutation failed after the layer entered `LOCKED_OP_IN_PROGRESS`.
    /// The layer is now `LOCKED_ERROR`.
    #[error("chain layer poisoned: {0}")]
    Poisoned(String),

    #[error("invalid chain state: {0}")]
    InvalidState(String),

    #[error("merge conflict: {0}")]
    MergeConflict(String),
}

impl ChainError {
    /// Kind of the violated rule, if this is a validation failure.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Validation(v) => Some(v.kind),
            _ => None,
        }
    }

    /// Whether the layer is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Poisoned(_))
    }
}

impl From<RulesError> for ChainError {
    fn from(e: RulesError) -> Self {
        match e {
            RulesError::Validation(v) => Self::Validation(v),
            RulesError::Store(s) => Self::Store(s),
            RulesError::Types(t) => Self::Types(t),
            other => Self::Rules(other),
        }
    }
}

impl From<ValidationError> for ChainError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

/// Result alias for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

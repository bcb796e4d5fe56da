use odb_types::TypeError;

/// Errors from superblock storage.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The superblock was merged or unloaded and must not be read anymore.
    #[error("superblock {0} is stale")]
    Stale(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation is not supported by this store: {0}")]
    Unsupported(String),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Types(#[from] TypeError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

use std::fmt;

use crate::error::{ChainError, ChainResult};

/// Lock state of a chain layer.
///
/// The transition functions are the only way to move between states; each
/// returns the next state or [`ChainError::Locked`] with the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainStatus {
    /// Mutable: accepts operations and blocks.
    Unlocked,
    /// A multi-step mutation is running.
    LockedOpInProgress,
    /// Frozen for good, usually because the layer became a parent.
    LockedState,
    /// Paused by an operator.
    LockedByUser,
    /// A mutation failed halfway. The layer must be rebuilt.
    LockedError,
}

impl ChainStatus {
    /// Numeric code used in logs and status reports.
    pub fn code(self) -> i32 {
        match self {
            Self::LockedError => -1,
            Self::Unlocked => 0,
            Self::LockedOpInProgress => 1,
            Self::LockedState => 2,
            Self::LockedByUser => 4,
        }
    }

    pub fn is_unlocked(self) -> bool {
        self == Self::Unlocked
    }

    /// Enter a mutation: `Unlocked` -> `LockedOpInProgress`.
    pub fn begin(self) -> ChainResult<Self> {
        match self {
            Self::Unlocked => Ok(Self::LockedOpInProgress),
            other => Err(ChainError::Locked { status: other }),
        }
    }

    /// Leave a mutation that succeeded.
    pub fn complete(self) -> ChainResult<Self> {
        match self {
            Self::LockedOpInProgress => Ok(Self::Unlocked),
            other => Err(ChainError::Locked { status: other }),
        }
    }

    /// Leave a mutation that failed halfway.
    pub fn poison(self) -> Self {
        Self::LockedError
    }

    /// Freeze the layer: `Unlocked` or `LockedState` -> `LockedState`.
    pub fn freeze(self) -> ChainResult<Self> {
        match self {
            Self::Unlocked | Self::LockedState => Ok(Self::LockedState),
            other => Err(ChainError::Locked { status: other }),
        }
    }

    pub fn lock_by_user(self) -> ChainResult<Self> {
        match self {
            Self::Unlocked | Self::LockedByUser => Ok(Self::LockedByUser),
            other => Err(ChainError::Locked { status: other }),
        }
    }

    pub fn unlock_by_user(self) -> ChainResult<Self> {
        match self {
            Self::LockedByUser | Self::Unlocked => Ok(Self::Unlocked),
            other => Err(ChainError::Locked { status: other }),
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unlocked => "UNLOCKED",
            Self::LockedOpInProgress => "LOCKED_OP_IN_PROGRESS",
            Self::LockedState => "LOCKED_STATE",
            Self::LockedByUser => "LOCKED_BY_USER",
            Self::LockedError => "LOCKED_ERROR",
        };
        f.write_str(name)
    }
}

use serde::{Deserialize, Serialize};

/// Limits and switches of the rules engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Objects a single operation may create.
    pub max_created_objects_per_op: usize,
    /// Canonical JSON length limit of one operation.
    pub max_op_size: usize,
    /// Operations a block may hold.
    pub max_block_size_ops: usize,
    /// Canonical JSON length limit of one block.
    pub max_block_size: usize,
    /// Version written into new block headers.
    pub block_version: i64,
    /// Verify operation signatures. Replay of trusted input turns this off.
    pub validate_signatures: bool,
}

pub const MAX_BLOCK_SIZE: usize = (1 << 20) + (1 << 16);

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            max_created_objects_per_op: 256,
            max_op_size: MAX_BLOCK_SIZE / 4,
            max_block_size_ops: 4096,
            max_block_size: MAX_BLOCK_SIZE,
            block_version: 1,
            validate_signatures: true,
        }
    }
}

impl RulesConfig {
    /// Configuration for replaying input that was already validated
    /// elsewhere: signature checks are skipped.
    pub fn permissive() -> Self {
        Self {
            validate_signatures: false,
            ..Default::default()
        }
    }
}

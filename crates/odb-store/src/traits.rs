use std::sync::Arc;

use odb_types::{Block, CompoundKey, Operation, OperationDeleteInfo};

use crate::error::{StoreError, StoreResult};
use crate::object::StoredObject;

/// Read access to one persisted superblock.
///
/// A DB-backed chain layer redirects every lookup here instead of holding
/// its maps in memory. Implementations must fail with
/// [`StoreError::Stale`] once the superblock has been merged away, so a
/// reader never sees a half-merged state.
pub trait BlockDbAccess: Send + Sync {
    /// Object version (or tombstone) stored in this superblock.
    fn get_object_by_id(&self, obj_type: &str, key: &CompoundKey) -> StoreResult<Option<StoredObject>>;

    /// All entries of one type, tombstones included, in key order.
    /// `limit` caps the number of returned entries.
    fn stream_objects(
        &self,
        obj_type: &str,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(CompoundKey, StoredObject)>>;

    /// Number of live objects of one type.
    fn count_objects(&self, obj_type: &str) -> StoreResult<usize>;

    /// Object types with at least one entry.
    fn object_types(&self) -> StoreResult<Vec<String>>;

    fn get_operation(&self, raw_hash: &str) -> StoreResult<Option<Arc<Operation>>>;

    fn get_operation_info(&self, raw_hash: &str) -> StoreResult<Option<OperationDeleteInfo>>;

    fn get_block_by_hash(&self, raw_hash: &str) -> StoreResult<Option<Block>>;

    /// Full blocks for the given headers, in the same order.
    ///
    /// Default implementation calls `get_block_by_hash()` per header. Loads
    /// every operation of the superblock, so use sparingly.
    fn get_all_blocks(&self, headers: &[Block]) -> StoreResult<Vec<Block>> {
        headers
            .iter()
            .map(|h| {
                self.get_block_by_hash(h.raw_hash())?
                    .ok_or_else(|| StoreError::NotFound(format!("block {}", h.raw_hash())))
            })
            .collect()
    }
}

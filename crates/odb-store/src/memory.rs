use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use odb_types::{superblock_hash, Block, CompoundKey, Operation, OperationDeleteInfo};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::object::StoredObject;
use crate::traits::BlockDbAccess;

/// Everything persisted for one superblock.
#[derive(Debug, Clone, Default)]
pub struct SuperblockSnapshot {
    /// Full blocks, newest first.
    pub blocks: Vec<Block>,
    /// Operations by raw hash.
    pub operations: HashMap<String, Arc<Operation>>,
    pub op_infos: HashMap<String, OperationDeleteInfo>,
    /// Object versions and tombstones per type.
    pub objects: BTreeMap<String, BTreeMap<CompoundKey, StoredObject>>,
}

impl SuperblockSnapshot {
    pub fn headers(&self) -> Vec<Block> {
        self.blocks.iter().map(Block::header).collect()
    }

    pub fn superblock_hash(&self) -> String {
        match self.blocks.first() {
            Some(last) => superblock_hash(self.blocks.len(), last.raw_hash()),
            None => String::new(),
        }
    }
}

/// In-memory rendition of a persisted superblock.
///
/// Reads take a shared lock. [`merge`](Self::merge) takes exclusive locks on
/// both inputs, builds the merged superblock and only then flags both inputs
/// stale, so a failed merge leaves them readable and unchanged.
#[derive(Debug)]
pub struct InMemorySuperblockDb {
    hash: String,
    data: RwLock<SuperblockSnapshot>,
    stale: AtomicBool,
}

impl InMemorySuperblockDb {
    pub fn new(snapshot: SuperblockSnapshot) -> Self {
        let hash = snapshot.superblock_hash();
        debug!(superblock = %hash, blocks = snapshot.blocks.len(), "superblock stored");
        Self {
            hash,
            data: RwLock::new(snapshot),
            stale: AtomicBool::new(false),
        }
    }

    pub fn superblock_hash(&self) -> &str {
        &self.hash
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Retire this superblock. All later reads fail with [`StoreError::Stale`].
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn headers(&self) -> StoreResult<Vec<Block>> {
        Ok(self.read()?.headers())
    }

    pub fn size(&self) -> StoreResult<usize> {
        Ok(self.read()?.blocks.len())
    }

    /// Copy of the stored content, used to unload a superblock into memory.
    pub fn snapshot(&self) -> StoreResult<SuperblockSnapshot> {
        Ok(self.read()?.clone())
    }

    /// Merge a superblock with the one directly below it into a new
    /// superblock. Both inputs are marked stale on success.
    pub fn merge(newer: &Self, older: &Self) -> StoreResult<Self> {
        if std::ptr::eq(newer, older) {
            return Err(StoreError::Unsupported("merge of a superblock with itself".into()));
        }
        let older_data = older.data.write().map_err(|_| StoreError::LockPoisoned)?;
        let newer_data = newer.data.write().map_err(|_| StoreError::LockPoisoned)?;
        for db in [older, newer] {
            if db.is_stale() {
                return Err(StoreError::Stale(db.hash.clone()));
            }
        }

        let mut merged = SuperblockSnapshot {
            blocks: newer_data
                .blocks
                .iter()
                .chain(older_data.blocks.iter())
                .cloned()
                .collect(),
            operations: older_data.operations.clone(),
            op_infos: HashMap::new(),
            objects: older_data.objects.clone(),
        };
        merged
            .operations
            .extend(newer_data.operations.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (obj_type, entries) in &newer_data.objects {
            let target = merged.objects.entry(obj_type.clone()).or_default();
            for (k, v) in entries {
                target.insert(k.clone(), v.clone());
            }
        }
        let hashes: BTreeSet<&String> = older_data
            .op_infos
            .keys()
            .chain(newer_data.op_infos.keys())
            .collect();
        for h in hashes {
            let info = OperationDeleteInfo::merge(newer_data.op_infos.get(h), older_data.op_infos.get(h))?;
            merged.op_infos.insert(h.clone(), info);
        }

        let db = Self::new(merged);
        older.mark_stale();
        newer.mark_stale();
        info!(
            older = %older.hash,
            newer = %newer.hash,
            merged = %db.hash,
            "superblocks merged"
        );
        Ok(db)
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, SuperblockSnapshot>> {
        let guard = self.data.read().map_err(|_| StoreError::LockPoisoned)?;
        if self.is_stale() {
            return Err(StoreError::Stale(self.hash.clone()));
        }
        Ok(guard)
    }
}

impl BlockDbAccess for InMemorySuperblockDb {
    fn get_object_by_id(&self, obj_type: &str, key: &CompoundKey) -> StoreResult<Option<StoredObject>> {
        let data = self.read()?;
        Ok(data.objects.get(obj_type).and_then(|m| m.get(key)).cloned())
    }

    fn stream_objects(
        &self,
        obj_type: &str,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(CompoundKey, StoredObject)>> {
        let data = self.read()?;
        let Some(entries) = data.objects.get(obj_type) else {
            return Ok(Vec::new());
        };
        let iter = entries.iter().map(|(k, v)| (k.clone(), v.clone()));
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    fn count_objects(&self, obj_type: &str) -> StoreResult<usize> {
        let data = self.read()?;
        Ok(data
            .objects
            .get(obj_type)
            .map_or(0, |m| m.values().filter(|o| !o.is_deleted()).count()))
    }

    fn object_types(&self) -> StoreResult<Vec<String>> {
        Ok(self.read()?.objects.keys().cloned().collect())
    }

    fn get_operation(&self, raw_hash: &str) -> StoreResult<Option<Arc<Operation>>> {
        Ok(self.read()?.operations.get(raw_hash).cloned())
    }

    fn get_operation_info(&self, raw_hash: &str) -> StoreResult<Option<OperationDeleteInfo>> {
        Ok(self.read()?.op_infos.get(raw_hash).cloned())
    }

    fn get_block_by_hash(&self, raw_hash: &str) -> StoreResult<Option<Block>> {
        let data = self.read()?;
        Ok(data.blocks.iter().find(|b| b.raw_hash() == raw_hash).cloned())
    }
}

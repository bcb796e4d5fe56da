//! Private containers of one chain layer.
//!
//! An in-memory layer owns a [`MemoryLayer`]; a persisted one reads
//! through a [`DbLayer`]. Both only grow while the layer is unlocked and
//! are replaced wholesale by rebase, queue removal and compaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use odb_store::{BlockDbAccess, StoreError, StoreResult, StoredObject, SuperblockSnapshot};
use odb_types::{superblock_hash, Block, CompoundKey, Operation, OperationDeleteInfo};

/// Blocks of one layer, oldest first, indexed by raw hash.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlockList {
    blocks: Vec<Block>,
    by_hash: HashMap<String, usize>,
}

impl BlockList {
    pub fn from_newest_first(mut blocks: Vec<Block>) -> Self {
        blocks.reverse();
        let mut list = Self::default();
        for b in blocks {
            list.push(b);
        }
        list
    }

    pub fn push(&mut self, block: Block) {
        self.by_hash.insert(block.raw_hash().to_string(), self.blocks.len());
        self.blocks.push(block);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn newest_first(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().rev()
    }

    pub fn oldest_first(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    pub fn by_raw_hash(&self, raw_hash: &str) -> Option<&Block> {
        self.by_hash.get(raw_hash).map(|&i| &self.blocks[i])
    }

    /// Block ids inside a layer are contiguous.
    pub fn by_id(&self, block_id: i64) -> Option<&Block> {
        let first = self.blocks.first()?.block_id();
        let index = usize::try_from(block_id.checked_sub(first)?).ok()?;
        self.blocks.get(index)
    }

    pub fn superblock_hash(&self) -> String {
        match self.blocks.last() {
            Some(last) => superblock_hash(self.blocks.len(), last.raw_hash()),
            None => String::new(),
        }
    }

    /// `older` followed by `newer`.
    pub fn concat(older: &Self, newer: &Self) -> Self {
        let mut list = older.clone();
        for b in newer.oldest_first() {
            list.push(b.clone());
        }
        list
    }
}

/// Object versions of one type inside one layer.
#[derive(Debug, Clone, Default)]
pub(crate) struct ObjectInstances {
    pub objects: BTreeMap<CompoundKey, StoredObject>,
    /// Bumped on every change; search caches are keyed by it.
    pub edit_version: u64,
}

/// Queued and sealed operations of one layer.
#[derive(Debug, Clone, Default)]
pub(crate) struct OperationStore {
    /// Operations not yet in a block, in submission order.
    pub queue: Vec<Arc<Operation>>,
    /// Every operation of the layer, queued or sealed, by raw hash.
    pub by_hash: HashMap<String, Arc<Operation>>,
    pub infos: HashMap<String, OperationDeleteInfo>,
}

impl OperationStore {
    pub fn enqueue(&mut self, op: Arc<Operation>) {
        self.by_hash.insert(op.raw_hash().to_string(), op.clone());
        self.infos
            .insert(op.raw_hash().to_string(), OperationDeleteInfo::created(op.clone()));
        self.queue.push(op);
    }

    /// Mark object slot `index` of `op` as deleted by `by_hash`.
    pub fn mark_deleted(&mut self, op: &Arc<Operation>, index: usize, by_hash: &str) {
        self.infos
            .entry(op.raw_hash().to_string())
            .or_insert_with(|| OperationDeleteInfo::referenced(op.clone()))
            .mark_deleted(index, by_hash);
    }
}

/// Everything an in-memory layer holds.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryLayer {
    pub blocks: BlockList,
    pub objects: BTreeMap<String, ObjectInstances>,
    pub ops: OperationStore,
}

impl MemoryLayer {
    /// Object map of a type, created on first write. Marks it edited.
    pub fn objects_mut(&mut self, obj_type: &str, version: u64) -> &mut BTreeMap<CompoundKey, StoredObject> {
        let inst = self.objects.entry(obj_type.to_string()).or_default();
        inst.edit_version = version;
        &mut inst.objects
    }

    /// Seal the whole queue into `block`.
    pub fn seal_queue(&mut self, block: Block) {
        self.ops.queue.clear();
        self.blocks.push(block);
    }

    /// Seal the oldest queued operations into `block`, one per operation
    /// of the block. The rest stays queued.
    pub fn seal_prefix(&mut self, block: Block) {
        let n = block.operations().len().min(self.ops.queue.len());
        self.ops.queue.drain(..n);
        self.blocks.push(block);
    }

    /// Union of a layer and its parent. The child's object versions win;
    /// delete bookkeeping may not overlap.
    pub fn merge(child: &Self, parent: &Self, version: u64) -> Result<Self, odb_types::TypeError> {
        let mut objects = parent.objects.clone();
        for (obj_type, inst) in &child.objects {
            let target = objects.entry(obj_type.clone()).or_default();
            target
                .objects
                .extend(inst.objects.iter().map(|(k, v)| (k.clone(), v.clone())));
            target.edit_version = version;
        }
        let mut infos = parent.ops.infos.clone();
        for (hash, info) in &child.ops.infos {
            let merged = OperationDeleteInfo::merge(Some(info), parent.ops.infos.get(hash))?;
            infos.insert(hash.clone(), merged);
        }
        let mut by_hash = parent.ops.by_hash.clone();
        by_hash.extend(child.ops.by_hash.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(Self {
            blocks: BlockList::concat(&parent.blocks, &child.blocks),
            objects,
            ops: OperationStore {
                queue: Vec::new(),
                by_hash,
                infos,
            },
        })
    }

    pub fn to_snapshot(&self) -> SuperblockSnapshot {
        SuperblockSnapshot {
            blocks: self.blocks.newest_first().cloned().collect(),
            operations: self.ops.by_hash.clone(),
            op_infos: self.ops.infos.clone(),
            objects: self
                .objects
                .iter()
                .map(|(t, inst)| (t.clone(), inst.objects.clone()))
                .collect(),
        }
    }
}

/// A persisted superblock: headers in memory, everything else behind
/// [`BlockDbAccess`].
#[derive(Clone)]
pub(crate) struct DbLayer {
    pub db: Arc<dyn BlockDbAccess>,
    pub headers: BlockList,
}

/// Storage of a layer.
#[derive(Clone)]
pub(crate) enum Local {
    Memory(MemoryLayer),
    Db(DbLayer),
}

impl Local {
    pub fn blocks(&self) -> &BlockList {
        match self {
            Self::Memory(m) => &m.blocks,
            Self::Db(d) => &d.headers,
        }
    }

    pub fn queue(&self) -> &[Arc<Operation>] {
        match self {
            Self::Memory(m) => &m.ops.queue,
            Self::Db(_) => &[],
        }
    }

    pub fn is_db(&self) -> bool {
        matches!(self, Self::Db(_))
    }

    pub fn object(&self, obj_type: &str, key: &CompoundKey) -> StoreResult<Option<StoredObject>> {
        match self {
            Self::Memory(m) => Ok(m
                .objects
                .get(obj_type)
                .and_then(|inst| inst.objects.get(key))
                .cloned()),
            Self::Db(d) => d.db.get_object_by_id(obj_type, key),
        }
    }

    /// Every entry of a type, tombstones included.
    pub fn objects(&self, obj_type: &str) -> StoreResult<Vec<(CompoundKey, StoredObject)>> {
        match self {
            Self::Memory(m) => Ok(m
                .objects
                .get(obj_type)
                .map(|inst| {
                    inst.objects
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .unwrap_or_default()),
            Self::Db(d) => d.db.stream_objects(obj_type, None),
        }
    }

    pub fn object_types(&self) -> StoreResult<Vec<String>> {
        match self {
            Self::Memory(m) => Ok(m.objects.keys().cloned().collect()),
            Self::Db(d) => d.db.object_types(),
        }
    }

    /// Edit version of a type's map, `None` if the layer never touched it.
    pub fn edit_version(&self, obj_type: &str) -> Option<u64> {
        match self {
            Self::Memory(m) => m.objects.get(obj_type).map(|inst| inst.edit_version),
            Self::Db(_) => None,
        }
    }

    pub fn operation(&self, raw_hash: &str) -> StoreResult<Option<Arc<Operation>>> {
        match self {
            Self::Memory(m) => Ok(m.ops.by_hash.get(raw_hash).cloned()),
            Self::Db(d) => d.db.get_operation(raw_hash),
        }
    }

    pub fn operation_info(&self, raw_hash: &str) -> StoreResult<Option<OperationDeleteInfo>> {
        match self {
            Self::Memory(m) => Ok(m.ops.infos.get(raw_hash).cloned()),
            Self::Db(d) => d.db.get_operation_info(raw_hash),
        }
    }

    /// Full block for a header of this layer.
    pub fn full_block(&self, header: &Block) -> StoreResult<Block> {
        match self {
            Self::Memory(m) => m
                .blocks
                .by_raw_hash(header.raw_hash())
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("block {}", header.raw_hash()))),
            Self::Db(d) => d
                .db
                .get_block_by_hash(header.raw_hash())?
                .ok_or_else(|| StoreError::NotFound(format!("block {}", header.raw_hash()))),
        }
    }

    pub fn full_blocks(&self) -> StoreResult<Vec<Block>> {
        match self {
            Self::Memory(m) => Ok(m.blocks.newest_first().cloned().collect()),
            Self::Db(d) => {
                let headers: Vec<Block> = d.headers.newest_first().cloned().collect();
                d.db.get_all_blocks(&headers)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_types::OpObject;
    use serde_json::json;

    fn block(id: i64, hash: &str) -> Block {
        Block::from_value(json!({"block_id": id, "hash": format!("sha256:{hash}")})).unwrap()
    }

    fn op(hash: &str) -> Arc<Operation> {
        let mut op = Operation::from_value(json!({"type": "t", "hash": format!("json:sha256:{hash}")})).unwrap();
        op.make_immutable();
        Arc::new(op)
    }

    fn live(name: &str) -> StoredObject {
        StoredObject::Live(Arc::new(OpObject::with_id(&[name])))
    }

    fn key(k: &str) -> CompoundKey {
        CompoundKey::primary(k, None)
    }

    #[test]
    fn block_list_indexes() {
        let list = BlockList::from_newest_first(vec![block(6, "c"), block(5, "b"), block(4, "a")]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.last().unwrap().raw_hash(), "c");
        assert_eq!(list.by_id(5).unwrap().raw_hash(), "b");
        assert!(list.by_id(3).is_none());
        assert!(list.by_id(7).is_none());
        assert_eq!(list.by_raw_hash("a").unwrap().block_id(), 4);
        assert_eq!(list.superblock_hash(), "00000003c");
        let ids: Vec<i64> = list.newest_first().map(Block::block_id).collect();
        assert_eq!(ids, vec![6, 5, 4]);
    }

    #[test]
    fn merge_keeps_child_versions() {
        let mut parent = MemoryLayer::default();
        parent.objects_mut("t", 1).insert(key("a"), live("a"));
        parent.objects_mut("t", 1).insert(key("b"), live("b"));
        parent.ops.enqueue(op("p1"));
        parent.seal_queue(block(0, "x"));

        let mut child = MemoryLayer::default();
        child.objects_mut("t", 2).insert(key("a"), StoredObject::deleted("t", "c1"));
        child.ops.enqueue(op("c1"));
        child.ops.mark_deleted(&op("p1"), 0, "c1");
        child.seal_queue(block(1, "y"));

        let merged = MemoryLayer::merge(&child, &parent, 3).unwrap();
        let t = &merged.objects["t"];
        assert!(t.objects[&key("a")].is_deleted());
        assert!(!t.objects[&key("b")].is_deleted());
        assert_eq!(t.edit_version, 3);
        assert_eq!(merged.blocks.len(), 2);
        assert_eq!(merged.blocks.last().unwrap().raw_hash(), "y");
        let info = &merged.ops.infos["p1"];
        assert!(info.create);
        assert!(info.is_deleted(0));
        assert!(merged.ops.by_hash.contains_key("c1"));
    }

    #[test]
    fn merge_rejects_double_creation() {
        let mut parent = MemoryLayer::default();
        parent.ops.enqueue(op("p1"));
        let mut child = MemoryLayer::default();
        child.ops.enqueue(op("p1"));
        assert!(MemoryLayer::merge(&child, &parent, 1).is_err());
    }

    #[test]
    fn seal_prefix_keeps_the_rest_queued() {
        let mut layer = MemoryLayer::default();
        for h in ["o1", "o2", "o3"] {
            layer.ops.enqueue(op(h));
        }
        let mut sealed = block(0, "a");
        sealed.push_operation(op("o1")).unwrap();
        layer.seal_prefix(sealed);
        let left: Vec<&str> = layer.ops.queue.iter().map(|o| o.raw_hash()).collect();
        assert_eq!(left, vec!["o2", "o3"]);
        assert_eq!(layer.blocks.len(), 1);
        assert!(layer.ops.by_hash.contains_key("o1"));
    }

    #[test]
    fn snapshot_lists_blocks_newest_first() {
        let mut layer = MemoryLayer::default();
        layer.ops.enqueue(op("o1"));
        layer.seal_queue(block(0, "a"));
        layer.ops.enqueue(op("o2"));
        layer.seal_queue(block(1, "b"));
        let snap = layer.to_snapshot();
        assert_eq!(snap.blocks[0].raw_hash(), "b");
        assert_eq!(snap.operations.len(), 2);
        assert_eq!(snap.superblock_hash(), layer.blocks.superblock_hash());
    }
}

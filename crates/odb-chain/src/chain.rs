use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use odb_crypto::KeyPair;
use odb_rules::{
    ChainView, ErrorKind, LocalValidationCtx, ObjectsSearchRequest, OpBlockchainRules,
};
use odb_store::{BlockDbAccess, StoreError, StoreResult, StoredObject};
use odb_types::{Block, CompoundKey, OpObject, Operation, OperationDeleteInfo};
use tracing::{debug, error, info, warn};

use crate::error::{ChainError, ChainResult};
use crate::history::DeletedObjectCtx;
use crate::lookup::{CacheSlots, LayerView};
use crate::prepare::{apply, prepare, Prepared};
use crate::status::ChainStatus;
use crate::store::{BlockList, DbLayer, Local, MemoryLayer};

/// One layer of the chain.
///
/// A layer holds a run of sealed blocks, the queue of operations not yet
/// sealed, and the object versions those operations produced. Everything
/// older lives in the parent layer; a layer without a parent is the root.
/// Lookups check the local maps first and fall back to the parent.
///
/// Mutations are serialized per layer and follow the [`ChainStatus`]
/// machine: validation runs first with no side effects, then the layer
/// flips to `LockedOpInProgress` for the mutation itself. A layer that
/// becomes a parent is frozen in `LockedState`.
pub struct OpBlockChain {
    rules: Arc<OpBlockchainRules>,
    writer: Mutex<()>,
    inner: RwLock<Inner>,
    caches: CacheSlots,
    edit_seq: AtomicU64,
}

struct Inner {
    status: ChainStatus,
    parent: Option<Arc<OpBlockChain>>,
    local: Local,
    /// Edit version reported for types this layer never touched. Renewed
    /// whenever the local storage or the parent is replaced.
    base_version: u64,
}

impl Inner {
    fn view<'a>(&'a self, cache: Option<&'a CacheSlots>) -> LayerView<'a> {
        LayerView::new(&self.local, self.parent.as_ref(), self.base_version, cache)
    }

    fn ensure_unlocked(&self) -> ChainResult<()> {
        if self.status.is_unlocked() {
            Ok(())
        } else {
            Err(ChainError::Locked { status: self.status })
        }
    }

    fn ensure_memory(&self) -> ChainResult<()> {
        match self.local {
            Local::Memory(_) => Ok(()),
            Local::Db(_) => Err(persisted()),
        }
    }

    fn memory_mut(&mut self) -> ChainResult<&mut MemoryLayer> {
        match &mut self.local {
            Local::Memory(m) => Ok(m),
            Local::Db(_) => Err(persisted()),
        }
    }
}

fn persisted() -> ChainError {
    ChainError::Store(StoreError::Unsupported("layer is persisted".into()))
}

fn frozen(mut op: Operation) -> Arc<Operation> {
    op.make_immutable();
    Arc::new(op)
}

/// Run `mutation` between `LockedOpInProgress` and `Unlocked`. A failure
/// leaves the layer in `LockedError`.
fn atomically<T>(
    inner: &mut Inner,
    action: &str,
    mutation: impl FnOnce(&mut Inner) -> ChainResult<T>,
) -> ChainResult<T> {
    inner.status = inner.status.begin()?;
    match mutation(inner) {
        Ok(v) => {
            inner.status = inner.status.complete()?;
            Ok(v)
        }
        Err(e) => {
            inner.status = inner.status.poison();
            error!(action, error = %e, "mutation failed, layer is poisoned");
            Err(ChainError::Poisoned(format!("{action}: {e}")))
        }
    }
}

impl OpBlockChain {
    /// Empty in-memory root layer.
    pub fn new_root(rules: Arc<OpBlockchainRules>) -> Arc<Self> {
        Arc::new(Self::build(None, Local::Memory(MemoryLayer::default()), rules))
    }

    /// Empty in-memory layer on top of `parent`. The parent is frozen.
    pub fn new(parent: Option<Arc<Self>>, rules: Arc<OpBlockchainRules>) -> ChainResult<Arc<Self>> {
        check_parent(parent.as_ref(), &rules)?;
        Ok(Arc::new(Self::build(
            parent,
            Local::Memory(MemoryLayer::default()),
            rules,
        )))
    }

    /// Layer whose content lives in a persisted superblock.
    /// `headers` are the superblock's block headers, newest first.
    pub fn with_db(
        parent: Option<Arc<Self>>,
        headers: Vec<Block>,
        db: Arc<dyn BlockDbAccess>,
        rules: Arc<OpBlockchainRules>,
    ) -> ChainResult<Arc<Self>> {
        check_parent(parent.as_ref(), &rules)?;
        let headers = BlockList::from_newest_first(headers.iter().map(Block::header).collect());
        Ok(Arc::new(Self::build(parent, Local::Db(DbLayer { db, headers }), rules)))
    }

    /// Merge an in-memory layer with its in-memory parent. The result sits
    /// on the parent's parent and holds the blocks of both.
    pub fn merged(child: &Arc<Self>, parent: &Arc<Self>) -> ChainResult<Arc<Self>> {
        if !child.parent().is_some_and(|p| Arc::ptr_eq(&p, parent)) {
            return Err(ChainError::InvalidState(
                "merged layer must be the parent of the other".into(),
            ));
        }
        child.validate_locked()?;
        parent.validate_locked()?;
        let c = child.read()?;
        let p = parent.read()?;
        let (Local::Memory(cm), Local::Memory(pm)) = (&c.local, &p.local) else {
            return Err(persisted());
        };
        let local = MemoryLayer::merge(cm, pm, 0)
            .map_err(|e| ChainError::MergeConflict(e.to_string()))?;
        let grandparent = p.parent.clone();
        check_parent(grandparent.as_ref(), &parent.rules)?;
        debug!(
            blocks = local.blocks.len(),
            superblock = %local.blocks.superblock_hash(),
            "layers merged"
        );
        Ok(Arc::new(Self::build(
            grandparent,
            Local::Memory(local),
            parent.rules.clone(),
        )))
    }

    fn build(parent: Option<Arc<Self>>, local: Local, rules: Arc<OpBlockchainRules>) -> Self {
        Self {
            rules,
            writer: Mutex::new(()),
            inner: RwLock::new(Inner {
                status: ChainStatus::Unlocked,
                parent,
                local,
                base_version: 0,
            }),
            caches: CacheSlots::default(),
            edit_seq: AtomicU64::new(1),
        }
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> ChainResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| ChainError::Poisoned("layer lock poisoned".into()))
    }

    fn writer(&self) -> ChainResult<MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|_| ChainError::Poisoned("writer lock poisoned".into()))
    }

    fn next_version(&self) -> u64 {
        self.edit_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn with_view<T>(&self, f: impl FnOnce(&LayerView<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let inner = self.read()?;
        f(&inner.view(Some(&self.caches)))
    }

    // ---- status ----

    pub fn rules(&self) -> &Arc<OpBlockchainRules> {
        &self.rules
    }

    pub fn status(&self) -> ChainStatus {
        self.inner
            .read()
            .map_or(ChainStatus::LockedError, |inner| inner.status)
    }

    pub fn parent(&self) -> Option<Arc<Self>> {
        self.inner.read().ok().and_then(|inner| inner.parent.clone())
    }

    pub fn is_db_accessed(&self) -> bool {
        self.inner.read().is_ok_and(|inner| inner.local.is_db())
    }

    /// Freeze the layer so it can serve as a parent.
    pub fn validate_locked(&self) -> ChainResult<()> {
        let mut inner = self.write()?;
        let next = inner.status.freeze()?;
        if next != inner.status {
            debug!(superblock = %inner.local.blocks().superblock_hash(), "layer frozen");
        }
        inner.status = next;
        Ok(())
    }

    pub fn lock_by_user(&self) -> ChainResult<()> {
        let _w = self.writer()?;
        let mut inner = self.write()?;
        inner.status = inner.status.lock_by_user()?;
        info!("layer locked by user");
        Ok(())
    }

    pub fn unlock_by_user(&self) -> ChainResult<()> {
        let _w = self.writer()?;
        let mut inner = self.write()?;
        inner.status = inner.status.unlock_by_user()?;
        info!("layer unlocked by user");
        Ok(())
    }

    // ---- mutations ----

    /// Validate `op` against this layer and append it to the queue.
    ///
    /// Objects deleted by the operation are recorded in `history` when one
    /// is given.
    pub fn add_operation(
        &self,
        op: Operation,
        history: Option<&mut DeletedObjectCtx>,
    ) -> ChainResult<Arc<Operation>> {
        let op = frozen(op);
        let _w = self.writer()?;
        let prepared = {
            let inner = self.read()?;
            inner.ensure_unlocked()?;
            inner.ensure_memory()?;
            let view = inner.view(Some(&self.caches));
            prepare(&view, &self.rules, op.clone(), LocalValidationCtx::new(""))
        };
        let prepared = prepared.inspect_err(|e| {
            warn!(op = %op.raw_hash(), op_type = op.op_type(), error = %e, "operation rejected");
        })?;
        let deleted = prepared.ctx.deleted_objs.clone();
        let version = self.next_version();
        let mut inner = self.write()?;
        atomically(&mut inner, "add operation", |inner| {
            apply(inner.memory_mut()?, prepared, version);
            Ok(())
        })?;
        if let Some(h) = history {
            h.record(op.raw_hash(), deleted);
        }
        debug!(op = %op.raw_hash(), op_type = op.op_type(), "operation queued");
        Ok(op)
    }

    /// Run every check `add_operation` would, without changing the layer.
    pub fn validate_operation(&self, op: &Operation) -> ChainResult<()> {
        let op = frozen(op.mutable_copy());
        let inner = self.read()?;
        let view = inner.view(Some(&self.caches));
        prepare(&view, &self.rules, op, LocalValidationCtx::new("")).map(|_| ())
    }

    /// Seal the oldest queued operations into a new block signed by
    /// `user`. The block takes as many operations as the block limits
    /// allow; the rest stays queued for the next block.
    pub fn create_block(&self, user: Option<&str>, key: Option<&KeyPair>) -> ChainResult<Block> {
        let _w = self.writer()?;
        let block = {
            let inner = self.read()?;
            inner.ensure_unlocked()?;
            inner.ensure_memory()?;
            let view = inner.view(Some(&self.caches));
            let prev = view.last_block_header()?;
            let picked = self.rules.pick_block_operations(inner.local.queue());
            let block = self
                .rules
                .create_and_sign_block(picked, prev.as_ref(), user, key)?;
            self.rules.calculate_block_size(&block)?;
            let check_sig = self.rules.config().validate_signatures;
            self.rules
                .validate_block(&view, &block, prev.as_ref(), check_sig)?;
            block
        };
        let mut inner = self.write()?;
        let queued = atomically(&mut inner, "create block", |inner| {
            let layer = inner.memory_mut()?;
            layer.seal_prefix(block.clone());
            Ok(layer.ops.queue.len())
        })?;
        info!(
            block_id = block.block_id(),
            hash = %block.full_hash(),
            ops = block.operations().len(),
            queued,
            "block created"
        );
        Ok(block)
    }

    /// Append a block sealed elsewhere, re-validating each of its
    /// operations against this layer.
    ///
    /// Returns `false` without changes when the queue is not empty. A
    /// block operation that fails validation poisons the layer.
    pub fn replicate_block(
        &self,
        block: &Block,
        mut history: Option<&mut DeletedObjectCtx>,
    ) -> ChainResult<bool> {
        if !block.is_immutable() {
            return Err(ChainError::InvalidState(format!(
                "block {} is not sealed",
                block.full_hash()
            )));
        }
        let _w = self.writer()?;
        let mut inner = self.write()?;
        inner.ensure_unlocked()?;
        inner.ensure_memory()?;
        if !inner.local.queue().is_empty() {
            return Ok(false);
        }
        {
            let view = inner.view(Some(&self.caches));
            let prev = view.last_block_header()?;
            self.rules.calculate_block_size(block)?;
            let check_sig = self.rules.config().validate_signatures && block.block_id() != 0;
            self.rules
                .validate_block(&view, block, prev.as_ref(), check_sig)?;
        }
        atomically(&mut inner, "replicate block", |inner| {
            for op in block.operations() {
                let prepared = {
                    let view = inner.view(Some(&self.caches));
                    prepare(
                        &view,
                        &self.rules,
                        op.clone(),
                        LocalValidationCtx::new(block.full_hash()),
                    )?
                };
                let deleted = prepared.ctx.deleted_objs.clone();
                apply(inner.memory_mut()?, prepared, self.next_version());
                if let Some(h) = history.as_deref_mut() {
                    h.record(op.raw_hash(), deleted);
                }
            }
            inner.memory_mut()?.seal_queue(block.clone());
            Ok(())
        })?;
        info!(
            block_id = block.block_id(),
            hash = %block.full_hash(),
            ops = block.operations().len(),
            "block replicated"
        );
        Ok(true)
    }

    /// Move the queue onto `new_parent`, which must already contain every
    /// block of this layer and the tip of the current parent. Queued
    /// operations the new parent already has are dropped, the rest are
    /// re-validated; the ones that no longer validate are discarded.
    ///
    /// Returns `false` without changes when `new_parent` does not qualify.
    pub fn rebase_operations(&self, new_parent: &Arc<Self>) -> ChainResult<bool> {
        let _w = self.writer()?;
        {
            let inner = self.read()?;
            inner.ensure_unlocked()?;
            inner.ensure_memory()?;
        }
        if !Arc::ptr_eq(&self.rules, &new_parent.rules) {
            return Err(ChainError::InvalidState("new parent uses different rules".into()));
        }
        new_parent.validate_locked()?;
        if !new_parent.is_queue_empty()? {
            return Ok(false);
        }
        let queue = {
            let inner = self.read()?;
            for b in inner.local.blocks().oldest_first() {
                if new_parent.block_depth(b)? < 0 {
                    debug!(block = %b.full_hash(), "rebase target misses a block of this layer");
                    return Ok(false);
                }
            }
            if let Some(p) = &inner.parent {
                if let Some(tip) = p.last_block_header()? {
                    if new_parent.block_depth(&tip)? == -1 {
                        return Ok(false);
                    }
                }
            }
            inner.local.queue().to_vec()
        };

        let base_version = self.next_version();
        let mut local = Local::Memory(MemoryLayer::default());
        let mut dropped = 0usize;
        let mut discarded = 0usize;
        for op in queue {
            if new_parent.operation_by_hash(op.raw_hash())?.is_some() {
                dropped += 1;
                continue;
            }
            let view = LayerView::new(&local, Some(new_parent), base_version, None);
            let prepared = match prepare(&view, &self.rules, op.clone(), LocalValidationCtx::new("")) {
                Ok(p) => p,
                Err(ChainError::Validation(e)) => {
                    warn!(op = %op.raw_hash(), error = %e, "queued operation discarded on rebase");
                    discarded += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Local::Memory(m) = &mut local {
                apply(m, prepared, self.next_version());
            }
        }

        let mut inner = self.write()?;
        let queued = local.queue().len();
        atomically(&mut inner, "rebase operations", |inner| {
            inner.local = local;
            inner.parent = Some(new_parent.clone());
            inner.base_version = base_version;
            Ok(())
        })?;
        self.caches.clear();
        info!(
            parent = %new_parent.superblock_hash(),
            queued,
            dropped,
            discarded,
            "queue rebased"
        );
        Ok(true)
    }

    /// Swap the parent for a layer with identical content (same tip).
    ///
    /// Allowed on unlocked and frozen layers; the status is kept. Returns
    /// `false` when the tips differ or the layer is in any other state.
    pub fn change_to_equal_parent(&self, new_parent: &Arc<Self>) -> ChainResult<bool> {
        let _w = self.writer()?;
        new_parent.validate_locked()?;
        let current_tip = match self.parent() {
            Some(p) => p.last_block_full_hash()?,
            None => String::new(),
        };
        if new_parent.last_block_full_hash()? != current_tip {
            return Ok(false);
        }
        let mut inner = self.write()?;
        if !matches!(inner.status, ChainStatus::Unlocked | ChainStatus::LockedState) {
            return Ok(false);
        }
        check_parent(Some(new_parent), &self.rules)?;
        inner.parent = Some(new_parent.clone());
        debug!(
            parent = %new_parent.superblock_hash(),
            persisted = new_parent.is_db_accessed(),
            "parent replaced by an equal layer"
        );
        Ok(true)
    }

    /// Drop the whole queue. Only possible while the layer has no blocks.
    pub fn remove_all_queue_operations(&self) -> ChainResult<bool> {
        let _w = self.writer()?;
        let mut inner = self.write()?;
        inner.ensure_unlocked()?;
        inner.ensure_memory()?;
        if !inner.local.blocks().is_empty() {
            return Ok(false);
        }
        let base_version = self.next_version();
        let removed = inner.local.queue().len();
        atomically(&mut inner, "remove queue", |inner| {
            inner.local = Local::Memory(MemoryLayer::default());
            inner.base_version = base_version;
            Ok(())
        })?;
        self.caches.clear();
        info!(removed, "queue cleared");
        Ok(true)
    }

    /// Remove the given operations from the queue. Unknown hashes are
    /// ignored.
    ///
    /// The layer is rebuilt from its blocks and the remaining queue; if a
    /// remaining operation no longer validates without the removed ones the
    /// call fails with `MGMT_CANT_DELETE_NON_LAST_OPERATIONS` and the layer
    /// is unchanged. Returns the hashes actually removed.
    pub fn remove_queue_operations(&self, hashes: &HashSet<String>) -> ChainResult<BTreeSet<String>> {
        let _w = self.writer()?;
        let (blocks, queue, parent) = {
            let inner = self.read()?;
            inner.ensure_unlocked()?;
            inner.ensure_memory()?;
            (
                inner.local.blocks().clone(),
                inner.local.queue().to_vec(),
                inner.parent.clone(),
            )
        };
        let removed: BTreeSet<String> = queue
            .iter()
            .map(|op| op.raw_hash().to_string())
            .filter(|h| hashes.contains(h))
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }

        let base_version = self.next_version();
        let mut local = Local::Memory(MemoryLayer::default());
        for block in blocks.oldest_first() {
            for op in block.operations() {
                let mut ctx = LocalValidationCtx::new(block.full_hash());
                ctx.skip_sig_validation = true;
                let view = LayerView::new(&local, parent.as_ref(), base_version, None);
                let prepared = prepare(&view, &self.rules, op.clone(), ctx)?;
                self.apply_scratch(&mut local, prepared);
            }
            if let Local::Memory(m) = &mut local {
                m.seal_queue(block.clone());
            }
        }
        let removed_list = removed.iter().cloned().collect::<Vec<_>>().join(", ");
        for op in queue.iter().filter(|op| !removed.contains(op.raw_hash())) {
            let view = LayerView::new(&local, parent.as_ref(), base_version, None);
            let prepared = match prepare(&view, &self.rules, op.clone(), LocalValidationCtx::new("")) {
                Ok(p) => p,
                Err(ChainError::Validation(_)) => {
                    return Err(self
                        .rules
                        .error(
                            op.raw_hash(),
                            ErrorKind::MgmtCantDeleteNonLastOperations,
                            &[&op.raw_hash(), &removed_list],
                        )
                        .into());
                }
                Err(e) => return Err(e),
            };
            self.apply_scratch(&mut local, prepared);
        }

        let mut inner = self.write()?;
        atomically(&mut inner, "remove queued operations", |inner| {
            inner.local = local;
            inner.base_version = base_version;
            Ok(())
        })?;
        self.caches.clear();
        info!(removed = removed.len(), "queued operations removed");
        Ok(removed)
    }

    fn apply_scratch(&self, local: &mut Local, prepared: Prepared) {
        if let Local::Memory(m) = local {
            apply(m, prepared, self.next_version());
        }
    }

    // ---- blocks ----

    pub fn is_queue_empty(&self) -> StoreResult<bool> {
        Ok(self.read()?.local.queue().is_empty())
    }

    pub fn queue_operations(&self) -> StoreResult<Vec<Arc<Operation>>> {
        Ok(self.read()?.local.queue().to_vec())
    }

    pub fn last_block_header(&self) -> StoreResult<Option<Block>> {
        self.with_view(|v| v.last_block_header())
    }

    /// Full hash of the newest block, `""` for an empty chain.
    pub fn last_block_full_hash(&self) -> StoreResult<String> {
        Ok(self
            .last_block_header()?
            .map(|b| b.full_hash().to_string())
            .unwrap_or_default())
    }

    pub fn last_block_raw_hash(&self) -> StoreResult<String> {
        Ok(self
            .last_block_header()?
            .map(|b| b.raw_hash().to_string())
            .unwrap_or_default())
    }

    /// Id of the newest block, -1 for an empty chain.
    pub fn last_block_id(&self) -> StoreResult<i64> {
        Ok(self.last_block_header()?.map_or(-1, |b| b.block_id()))
    }

    /// Number of blocks in the chain.
    pub fn depth(&self) -> StoreResult<i64> {
        Ok(self.last_block_id()? + 1)
    }

    /// Number of layers, this one included.
    pub fn superblocks_depth(&self) -> usize {
        1 + self.parent().map_or(0, |p| p.superblocks_depth())
    }

    /// Blocks held by this layer.
    pub fn superblock_size(&self) -> usize {
        self.read().map_or(0, |inner| inner.local.blocks().len())
    }

    pub fn superblock_hash(&self) -> String {
        self.read()
            .map(|inner| inner.local.blocks().superblock_hash())
            .unwrap_or_default()
    }

    /// Headers of this layer's blocks, newest first.
    pub fn superblock_headers(&self) -> StoreResult<Vec<Block>> {
        Ok(self.read()?.local.blocks().newest_first().map(Block::header).collect())
    }

    pub fn superblock_full_blocks(&self) -> StoreResult<Vec<Block>> {
        self.read()?.local.full_blocks()
    }

    /// Newest block headers across the ancestry, at most `depth` of them.
    pub fn block_headers(&self, depth: Option<usize>) -> StoreResult<Vec<Block>> {
        let limit = depth.unwrap_or(usize::MAX);
        let mut headers = Vec::new();
        let mut next = self.push_headers(&mut headers, limit)?;
        while let Some(layer) = next {
            if headers.len() >= limit {
                break;
            }
            next = layer.push_headers(&mut headers, limit)?;
        }
        Ok(headers)
    }

    /// Append local headers to `out`, newest first, and return the parent.
    fn push_headers(&self, out: &mut Vec<Block>, limit: usize) -> StoreResult<Option<Arc<Self>>> {
        let inner = self.read()?;
        for b in inner.local.blocks().newest_first() {
            if out.len() >= limit {
                break;
            }
            out.push(b.header());
        }
        Ok(inner.parent.clone())
    }

    pub fn block_header_by_id(&self, block_id: i64) -> StoreResult<Option<Block>> {
        let inner = self.read()?;
        if let Some(p) = &inner.parent {
            if p.last_block_id()? >= block_id {
                return p.block_header_by_id(block_id);
            }
        }
        Ok(inner.local.blocks().by_id(block_id).map(Block::header))
    }

    pub fn full_block_by_block_id(&self, block_id: i64) -> StoreResult<Option<Block>> {
        let inner = self.read()?;
        if let Some(p) = &inner.parent {
            if p.last_block_id()? >= block_id {
                return p.full_block_by_block_id(block_id);
            }
        }
        match inner.local.blocks().by_id(block_id) {
            Some(h) => inner.local.full_block(h).map(Some),
            None => Ok(None),
        }
    }

    pub fn block_header_by_raw_hash(&self, raw_hash: &str) -> StoreResult<Option<Block>> {
        self.with_view(|v| v.block_header_by_raw_hash(raw_hash))
    }

    pub fn full_block_by_raw_hash(&self, raw_hash: &str) -> StoreResult<Option<Block>> {
        let inner = self.read()?;
        if let Some(h) = inner.local.blocks().by_raw_hash(raw_hash) {
            return inner.local.full_block(h).map(Some);
        }
        match &inner.parent {
            Some(p) => p.full_block_by_raw_hash(raw_hash),
            None => Ok(None),
        }
    }

    // ---- operations and objects ----

    pub fn operation_by_hash(&self, raw_hash: &str) -> StoreResult<Option<Arc<Operation>>> {
        self.with_view(|v| v.operation_by_hash(raw_hash))
    }

    /// Delete bookkeeping of an operation merged over the whole ancestry.
    pub fn operation_info(&self, raw_hash: &str) -> StoreResult<Option<OperationDeleteInfo>> {
        let (local, parent) = {
            let inner = self.read()?;
            (inner.local.operation_info(raw_hash)?, inner.parent.clone())
        };
        let inherited = match parent {
            Some(p) => p.operation_info(raw_hash)?,
            None => None,
        };
        match (local, inherited) {
            (None, p) => Ok(p),
            (Some(c), None) => Ok(Some(c)),
            (Some(c), Some(p)) => Ok(Some(OperationDeleteInfo::merge(Some(&c), Some(&p))?)),
        }
    }

    /// Object by its id parts.
    pub fn object_by_id<S: AsRef<str>>(&self, obj_type: &str, id: &[S]) -> StoreResult<Option<Arc<OpObject>>> {
        let key = CompoundKey::new(id.iter().map(|s| s.as_ref().to_string()))?;
        self.object_by_name(obj_type, &key)
    }

    /// Every version of an object along the ancestry, newest first,
    /// tombstones included.
    pub fn all_objects_by_name(&self, obj_type: &str, key: &CompoundKey) -> StoreResult<Vec<StoredObject>> {
        let (local, parent) = {
            let inner = self.read()?;
            (inner.local.object(obj_type, key)?, inner.parent.clone())
        };
        let mut versions: Vec<StoredObject> = local.into_iter().collect();
        if let Some(p) = parent {
            versions.extend(p.all_objects_by_name(obj_type, key)?);
        }
        Ok(versions)
    }

    /// Live objects of a type visible from this layer.
    pub fn count_all_objects(&self, obj_type: &str) -> StoreResult<usize> {
        Ok(self
            .collect_objects(obj_type)?
            .values()
            .filter(|o| !o.is_deleted())
            .count())
    }

    /// Object maps of this layer, tombstones included.
    pub fn raw_superblock_objects(&self) -> StoreResult<BTreeMap<String, BTreeMap<CompoundKey, StoredObject>>> {
        let inner = self.read()?;
        match &inner.local {
            Local::Memory(m) => Ok(m
                .objects
                .iter()
                .map(|(t, inst)| (t.clone(), inst.objects.clone()))
                .collect()),
            Local::Db(_) => Err(StoreError::Unsupported(
                "raw objects of a persisted layer".into(),
            )),
        }
    }

    /// Object types touched by this layer or any parent.
    pub fn object_types(&self) -> StoreResult<BTreeSet<String>> {
        let (mut types, parent): (BTreeSet<String>, _) = {
            let inner = self.read()?;
            (inner.local.object_types()?.into_iter().collect(), inner.parent.clone())
        };
        if let Some(p) = parent {
            types.extend(p.object_types()?);
        }
        Ok(types)
    }

    pub(crate) fn stored_object(&self, obj_type: &str, key: &CompoundKey) -> StoreResult<Option<StoredObject>> {
        self.with_view(|v| v.stored_object(obj_type, key))
    }

    pub(crate) fn collect_objects(&self, obj_type: &str) -> StoreResult<BTreeMap<CompoundKey, StoredObject>> {
        self.with_view(|v| v.collect_objects(obj_type))
    }

    /// Copy of the in-memory content of this layer.
    pub(crate) fn memory_layer(&self) -> ChainResult<MemoryLayer> {
        match &self.read()?.local {
            Local::Memory(m) => Ok(m.clone()),
            Local::Db(_) => Err(persisted()),
        }
    }
}

/// A parent must share the rules, be frozen and have an empty queue.
fn check_parent(parent: Option<&Arc<OpBlockChain>>, rules: &Arc<OpBlockchainRules>) -> ChainResult<()> {
    let Some(p) = parent else {
        return Ok(());
    };
    if !Arc::ptr_eq(&p.rules, rules) {
        return Err(ChainError::InvalidState("parent uses different rules".into()));
    }
    p.validate_locked()?;
    if !p.is_queue_empty()? {
        return Err(ChainError::InvalidState("parent has queued operations".into()));
    }
    Ok(())
}

impl ChainView for OpBlockChain {
    fn object_by_name(&self, obj_type: &str, key: &CompoundKey) -> StoreResult<Option<Arc<OpObject>>> {
        self.with_view(|v| v.object_by_name(obj_type, key))
    }

    fn block_depth(&self, block: &Block) -> StoreResult<i64> {
        self.with_view(|v| v.block_depth(block))
    }

    fn fetch_all_objects(&self, obj_type: &str, request: &mut ObjectsSearchRequest) -> StoreResult<()> {
        self.with_view(|v| v.fetch_all_objects(obj_type, request))
    }

    fn set_cache_after_search(&self, request: &ObjectsSearchRequest, cache: Arc<dyn Any + Send + Sync>) {
        if let Ok(inner) = self.read() {
            inner
                .view(Some(&self.caches))
                .set_cache_after_search(request, cache);
        }
    }
}

impl fmt::Debug for OpBlockChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpBlockChain")
            .field("status", &self.status())
            .field("superblock", &self.superblock_hash())
            .field("size", &self.superblock_size())
            .field("persisted", &self.is_db_accessed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_rules::names::{F_SUBMITTED_OP_HASH, OP_GRANT, OP_ROLE, OP_VOTE, REF_VOTE, STATE_FINAL};
    use odb_rules::RulesConfig;
    use odb_types::object::F_STATE;
    use serde_json::{json, Value};

    use crate::testing::*;

    fn kind(r: ChainResult<impl fmt::Debug>) -> ErrorKind {
        r.unwrap_err().kind().unwrap()
    }

    fn permissive() -> Arc<OpBlockchainRules> {
        Arc::new(OpBlockchainRules::new(RulesConfig::permissive()))
    }

    #[test]
    fn bootstrap_block() {
        let fx = Fixture::new();
        let chain = fx.bootstrap();
        assert_eq!(chain.depth().unwrap(), 1);
        assert_eq!(chain.last_block_id().unwrap(), 0);
        assert!(chain.is_queue_empty().unwrap());
        assert!(chain.object_by_id(OP_ROLE, &["editor"]).unwrap().is_some());
        assert!(chain.object_by_id(OP_GRANT, &[ADMIN]).unwrap().is_some());
        let block = chain.full_block_by_block_id(0).unwrap().unwrap();
        assert_eq!(block.operations().len(), 5);
        assert_eq!(block.signed_by(), Some(ADMIN));
        assert_eq!(chain.superblock_hash(), format!("00000001{}", block.raw_hash()));
    }

    #[test]
    fn signup_login_and_duplicate() {
        let fx = Fixture::new();
        let chain = fx.bootstrap();
        let alice = KeyPair::generate();
        chain.add_operation(fx.signup("alice", &alice), None).unwrap();
        chain.create_block(Some(ADMIN), Some(&fx.admin)).unwrap();

        let site_key = KeyPair::generate();
        chain
            .add_operation(fx.login("alice", "osm", &alice, &site_key), None)
            .unwrap();
        let mut note = Operation::new("osm.note");
        note.add_created(obj(json!({"id": ["n1"], "text": "hi"}))).unwrap();
        let note = fx.signed(note, "alice:osm", &site_key);
        chain.add_operation(note.clone(), None).unwrap();
        assert_eq!(chain.queue_operations().unwrap().len(), 2);

        assert_eq!(kind(chain.add_operation(note, None)), ErrorKind::OpHashIsDuplicated);
        assert_eq!(chain.status(), ChainStatus::Unlocked);
        assert_eq!(chain.queue_operations().unwrap().len(), 2);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let fx = Fixture::new();
        let chain = fx.bootstrap();
        let mallory = KeyPair::generate();
        let op = fx.place(ADMIN, &mallory, "p1");
        assert_eq!(kind(chain.add_operation(op, None)), ErrorKind::OpSignatureFailed);
        assert!(chain.is_queue_empty().unwrap());
    }

    #[test]
    fn places_need_editor_role() {
        let fx = Fixture::new();
        let chain = fx.bootstrap();
        let bob = KeyPair::generate();
        chain.add_operation(fx.signup("bob", &bob), None).unwrap();
        let denied = fx.place("bob", &bob, "p1");
        assert_eq!(kind(chain.add_operation(denied, None)), ErrorKind::OpValidationFailed);

        chain.add_operation(fx.place(ADMIN, &fx.admin, "p1"), None).unwrap();
        let place = chain.object_by_id(PLACE, &["p1"]).unwrap().unwrap();
        assert_eq!(place.get_str("name"), Some("p1"));
        assert_eq!(place.parent_type(), Some(PLACE));
    }

    #[test]
    fn edit_requires_current_value() {
        let fx = Fixture::new();
        let chain = fx.bootstrap();
        chain.add_operation(fx.place(ADMIN, &fx.admin, "p1"), None).unwrap();

        let edit = |current: Value| {
            let mut op = Operation::new(PLACE);
            let mut e = json!({"id": ["p1"], "change": {"name": {"set": "renamed"}}});
            if !current.is_null() {
                e["current"] = current;
            }
            op.add_edited(obj(e)).unwrap();
            fx.signed(op, ADMIN, &fx.admin)
        };
        assert_eq!(
            kind(chain.add_operation(edit(Value::Null), None)),
            ErrorKind::EditChangeDidNotSpecifyCurrentValue
        );
        assert_eq!(
            kind(chain.add_operation(edit(json!({"name": "wrong"})), None)),
            ErrorKind::EditOldFieldValueIncorrect
        );
        chain.add_operation(edit(json!({"name": "p1"})), None).unwrap();
        let place = chain.object_by_id(PLACE, &["p1"]).unwrap().unwrap();
        assert_eq!(place.get_str("name"), Some("renamed"));
    }

    #[test]
    fn increment_and_append() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        chain.add_operation(create_op(&rules, "test.counter", &["c"]), None).unwrap();
        for change in [json!({"hits": "increment"}), json!({"hits": {"increment": null}})] {
            let op = edit_op(&rules, "test.counter", "c", change, Value::Null);
            chain.add_operation(op, None).unwrap();
        }
        let op = edit_op(&rules, "test.counter", "c", json!({"tags": {"append": "a"}, "seen.by": {"append": {"x": 1}}}), Value::Null);
        chain.add_operation(op, None).unwrap();
        let c = chain.object_by_id("test.counter", &["c"]).unwrap().unwrap();
        assert_eq!(c.get_i64("hits"), Some(2));
        assert_eq!(c.get("tags"), Some(&json!(["a"])));
        assert_eq!(c.field_by_path("seen.by"), Some(&json!([{"x": 1}])));

        let bad = edit_op(&rules, "test.counter", "c", json!({"tags": "increment"}), Value::Null);
        assert_eq!(kind(chain.add_operation(bad, None)), ErrorKind::EditOpIncrementOnlyForNumbers);
        let bad = edit_op(&rules, "test.counter", "c", json!({"hits": {"append": 1}}), Value::Null);
        assert_eq!(kind(chain.add_operation(bad, None)), ErrorKind::EditOpAppendOnlyForListMap);
        let bad = edit_op(&rules, "test.counter", "c", json!({"hits": {"rename": 1}}), Value::Null);
        assert_eq!(kind(chain.add_operation(bad, None)), ErrorKind::EditOpNotSupported);
        assert_eq!(chain.status(), ChainStatus::Unlocked);
    }

    #[test]
    fn increment_wraps_at_integer_limits() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        let mut op = Operation::new("test.counter");
        op.add_created(obj(json!({"id": ["c"], "hits": i64::MAX, "big": u64::MAX, "ratio": 2.75})))
            .unwrap();
        chain.add_operation(hashed(&rules, op), None).unwrap();

        let change = json!({"hits": "increment", "big": "increment", "ratio": "increment"});
        let op = edit_op(&rules, "test.counter", "c", change, Value::Null);
        chain.add_operation(op, None).unwrap();
        let c = chain.object_by_id("test.counter", &["c"]).unwrap().unwrap();
        assert_eq!(c.get("hits"), Some(&json!(i64::MIN)));
        assert_eq!(c.get("big"), Some(&json!(0)));
        assert_eq!(c.get("ratio"), Some(&json!(3)));

        assert_eq!(chain.status(), ChainStatus::Unlocked);
        chain.add_operation(create_op(&rules, "test.counter", &["d"]), None).unwrap();
    }

    #[test]
    fn object_modified_twice_in_one_operation() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        let op = create_op(&rules, "test.item", &["a", "a"]);
        assert_eq!(kind(chain.add_operation(op, None)), ErrorKind::ObjModifiedTwiceInSameOperation);
    }

    #[test]
    fn created_objects_without_id_get_one() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        let mut op = Operation::new("test.item");
        op.add_created(obj(json!({"v": 1}))).unwrap();
        let op = chain.add_operation(hashed(&rules, op), None).unwrap();
        let found = chain.object_by_id("test.item", &[op.raw_hash(), "0"]).unwrap().unwrap();
        assert_eq!(found.get_i64("v"), Some(1));
    }

    #[test]
    fn deletes_leave_tombstones() {
        let rules = permissive();
        let root = OpBlockChain::new_root(rules.clone());
        let create = root
            .add_operation(create_op(&rules, "test.item", &["a", "b"]), None)
            .unwrap();
        root.create_block(None, None).unwrap();
        let child = OpBlockChain::new(Some(root.clone()), rules.clone()).unwrap();

        let mut del = Operation::new("test.item");
        del.add_deleted(&["b"]).unwrap();
        let del = hashed(&rules, del);
        let mut history = DeletedObjectCtx::new();
        child.add_operation(del.clone(), Some(&mut history)).unwrap();

        assert!(child.object_by_id("test.item", &["b"]).unwrap().is_none());
        assert!(root.object_by_id("test.item", &["b"]).unwrap().is_some());
        assert_eq!(child.count_all_objects("test.item").unwrap(), 1);
        let key = CompoundKey::new(["b"]).unwrap();
        let versions = child.all_objects_by_name("test.item", &key).unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].is_deleted());
        assert_eq!(history.deleted_by(del.raw_hash()).len(), 1);

        let info = child.operation_info(create.raw_hash()).unwrap().unwrap();
        assert!(!info.is_deleted(0));
        assert!(info.is_deleted(1));

        let mut again = Operation::new("test.item");
        again.add_deleted(&["b"]).unwrap();
        again.put("comment", json!("again")).unwrap();
        assert_eq!(kind(child.add_operation(hashed(&rules, again), None)), ErrorKind::DelObjNotFound);

        let mut reference = Operation::new("test.link");
        reference.set_ref("target", &["test.item", "b"]).unwrap();
        assert_eq!(kind(child.add_operation(hashed(&rules, reference), None)), ErrorKind::RefObjNotFound);
    }

    #[test]
    fn parent_is_frozen() {
        let (rules, root) = filled_root(1);
        let child = OpBlockChain::new(Some(root.clone()), rules.clone()).unwrap();
        assert_eq!(root.status(), ChainStatus::LockedState);
        let op = create_op(&rules, "test.item", &["late"]);
        assert!(matches!(
            root.add_operation(op.clone(), None),
            Err(ChainError::Locked { status: ChainStatus::LockedState })
        ));
        child.add_operation(op, None).unwrap();
        assert_eq!(child.superblocks_depth(), 2);
        assert_eq!(child.depth().unwrap(), 1);
    }

    #[test]
    fn parent_with_queue_is_refused() {
        let rules = permissive();
        let root = OpBlockChain::new_root(rules.clone());
        root.add_operation(create_op(&rules, "test.item", &["a"]), None).unwrap();
        assert!(matches!(
            OpBlockChain::new(Some(root), rules),
            Err(ChainError::InvalidState(_))
        ));
    }

    #[test]
    fn user_lock() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        chain.lock_by_user().unwrap();
        let op = create_op(&rules, "test.item", &["a"]);
        assert!(chain.add_operation(op.clone(), None).is_err());
        chain.unlock_by_user().unwrap();
        chain.add_operation(op, None).unwrap();
    }

    #[test]
    fn validate_operation_has_no_effect() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        let op = create_op(&rules, "test.item", &["a"]);
        chain.validate_operation(&op).unwrap();
        assert!(chain.is_queue_empty().unwrap());
        assert!(chain.object_by_id("test.item", &["a"]).unwrap().is_none());
    }

    #[test]
    fn block_takes_at_most_the_configured_operations() {
        let rules = Arc::new(OpBlockchainRules::new(RulesConfig {
            max_block_size_ops: 2,
            ..RulesConfig::permissive()
        }));
        let chain = OpBlockChain::new_root(rules.clone());
        for id in ["a", "b", "c", "d", "e"] {
            chain.add_operation(create_op(&rules, "test.item", &[id]), None).unwrap();
        }
        let first = chain.create_block(None, None).unwrap();
        assert_eq!(first.operations().len(), 2);
        assert_eq!(chain.queue_operations().unwrap().len(), 3);

        let second = chain.create_block(None, None).unwrap();
        assert_eq!(second.operations().len(), 2);
        assert_eq!(second.prev_block_hash(), first.full_hash());
        let third = chain.create_block(None, None).unwrap();
        assert_eq!(third.operations().len(), 1);
        assert!(chain.is_queue_empty().unwrap());
        assert_eq!(chain.depth().unwrap(), 3);
        assert_eq!(chain.count_all_objects("test.item").unwrap(), 5);

        let replica = OpBlockChain::new_root(rules);
        for b in [&first, &second, &third] {
            assert!(replica.replicate_block(b, None).unwrap());
        }
        assert_eq!(replica.last_block_full_hash().unwrap(), third.full_hash());
    }

    #[test]
    fn empty_queue_makes_no_block() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules);
        assert_eq!(kind(chain.create_block(None, None)), ErrorKind::BlockEmpty);
        assert_eq!(chain.status(), ChainStatus::Unlocked);
    }

    #[test]
    fn replicate_blocks() {
        let fx = Fixture::new();
        let source = fx.bootstrap();
        source.add_operation(fx.place(ADMIN, &fx.admin, "p1"), None).unwrap();
        source.create_block(Some(ADMIN), Some(&fx.admin)).unwrap();

        let replica = OpBlockChain::new_root(fx.rules.clone());
        for block in source.block_headers(None).unwrap().into_iter().rev() {
            let full = source.full_block_by_raw_hash(block.raw_hash()).unwrap().unwrap();
            assert!(replica.replicate_block(&full, None).unwrap());
        }
        assert_eq!(replica.last_block_full_hash().unwrap(), source.last_block_full_hash().unwrap());
        assert!(replica.object_by_id(PLACE, &["p1"]).unwrap().is_some());

        let again = source.full_block_by_block_id(1).unwrap().unwrap();
        assert_eq!(
            kind(replica.replicate_block(&again, None)),
            ErrorKind::BlockPrevHash
        );
    }

    #[test]
    fn replicate_waits_for_empty_queue() {
        let (rules, source) = filled_root(1);
        let block = source.full_block_by_block_id(0).unwrap().unwrap();
        let replica = OpBlockChain::new_root(rules.clone());
        replica.add_operation(create_op(&rules, "test.item", &["x"]), None).unwrap();
        assert!(!replica.replicate_block(&block, None).unwrap());
        assert_eq!(replica.depth().unwrap(), 0);
    }

    #[test]
    fn failed_replication_poisons_layer() {
        let rules = permissive();
        let mut del = Operation::new("test.item");
        del.add_deleted(&["missing"]).unwrap();
        let del = hashed(&rules, del);
        let block = rules
            .create_and_sign_block(&[Arc::new(del)], None, None, None)
            .unwrap();
        let chain = OpBlockChain::new_root(rules);
        let err = chain.replicate_block(&block, None).unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(chain.status(), ChainStatus::LockedError);
        assert!(chain.lock_by_user().is_err());
    }

    #[test]
    fn remove_dependent_operation_fails() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        let create = chain
            .add_operation(create_op(&rules, "test.counter", &["c"]), None)
            .unwrap();
        let bump = chain
            .add_operation(edit_op(&rules, "test.counter", "c", json!({"n": "increment"}), Value::Null), None)
            .unwrap();

        let only_create = HashSet::from([create.raw_hash().to_string()]);
        assert_eq!(
            kind(chain.remove_queue_operations(&only_create)),
            ErrorKind::MgmtCantDeleteNonLastOperations
        );
        assert_eq!(chain.queue_operations().unwrap().len(), 2);
        assert_eq!(chain.status(), ChainStatus::Unlocked);

        let only_bump = HashSet::from([bump.raw_hash().to_string(), "unknown".to_string()]);
        let removed = chain.remove_queue_operations(&only_bump).unwrap();
        assert_eq!(removed, BTreeSet::from([bump.raw_hash().to_string()]));
        let c = chain.object_by_id("test.counter", &["c"]).unwrap().unwrap();
        assert_eq!(c.get_i64("n"), None);
        assert!(chain.operation_by_hash(bump.raw_hash()).unwrap().is_none());
    }

    #[test]
    fn remove_all_only_without_blocks() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        chain.add_operation(create_op(&rules, "test.item", &["a"]), None).unwrap();
        assert!(chain.remove_all_queue_operations().unwrap());
        assert!(chain.is_queue_empty().unwrap());
        assert!(chain.object_by_id("test.item", &["a"]).unwrap().is_none());

        fill(&chain, 1, "b");
        chain.add_operation(create_op(&rules, "test.item", &["c"]), None).unwrap();
        assert!(!chain.remove_all_queue_operations().unwrap());
    }

    #[test]
    fn rebase_drops_known_and_invalid_operations() {
        let (rules, root) = filled_root(1);
        let queue = OpBlockChain::new(Some(root.clone()), rules.clone()).unwrap();
        let shared = create_op(&rules, "test.item", &["shared"]);
        let own = create_op(&rules, "test.item", &["own"]);
        let mut del = Operation::new("test.item");
        del.add_deleted(&["root-0"]).unwrap();
        let del = hashed(&rules, del);
        for op in [shared.clone(), own, del] {
            queue.add_operation(op, None).unwrap();
        }

        let target = OpBlockChain::new(Some(root.clone()), rules.clone()).unwrap();
        target.add_operation(shared, None).unwrap();
        let mut other_del = Operation::new("test.item");
        other_del.add_deleted(&["root-0"]).unwrap();
        other_del.put("comment", json!("elsewhere")).unwrap();
        target.add_operation(hashed(&rules, other_del), None).unwrap();
        target.create_block(None, None).unwrap();

        assert!(queue.rebase_operations(&target).unwrap());
        let left = queue.queue_operations().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].created()[0].id(), vec!["own".to_string()]);
        assert!(Arc::ptr_eq(&queue.parent().unwrap(), &target));
        assert_eq!(queue.depth().unwrap(), 2);
    }

    #[test]
    fn rebase_needs_current_tip() {
        let (rules, root) = filled_root(1);
        let queue = OpBlockChain::new(Some(root), rules.clone()).unwrap();
        let (_, unrelated) = filled_root(1);
        let foreign = OpBlockChain::new_root(rules.clone());
        fill(&foreign, 1, "other");
        assert!(!queue.rebase_operations(&foreign).unwrap());
        assert!(queue.rebase_operations(&unrelated).is_err());
    }

    #[test]
    fn merged_layers_keep_everything() {
        let (rules, root) = filled_root(2);
        let child = OpBlockChain::new(Some(root.clone()), rules.clone()).unwrap();
        fill(&child, 1, "child");
        let merged = OpBlockChain::merged(&child, &root).unwrap();
        assert_eq!(merged.superblock_size(), 3);
        assert!(merged.parent().is_none());
        assert_eq!(merged.last_block_full_hash().unwrap(), child.last_block_full_hash().unwrap());
        assert_eq!(merged.count_all_objects("test.item").unwrap(), 3);
        assert!(matches!(
            OpBlockChain::merged(&root, &child),
            Err(ChainError::InvalidState(_))
        ));
    }

    #[test]
    fn block_lookups_across_layers() {
        let (rules, root) = filled_root(3);
        let child = OpBlockChain::new(Some(root), rules).unwrap();
        fill(&child, 2, "child");
        let headers = child.block_headers(Some(4)).unwrap();
        let ids: Vec<i64> = headers.iter().map(Block::block_id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
        assert_eq!(child.block_headers(None).unwrap().len(), 5);
        assert_eq!(child.block_header_by_id(1).unwrap().unwrap().block_id(), 1);
        assert_eq!(child.full_block_by_block_id(4).unwrap().unwrap().operations().len(), 1);
        assert!(child.block_header_by_id(9).unwrap().is_none());
        assert_eq!(child.superblock_headers().unwrap().len(), 2);
    }

    #[test]
    fn search_cache_follows_edits() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        chain.add_operation(create_op(&rules, "test.item", &["a"]), None).unwrap();

        let mut req = ObjectsSearchRequest::cached();
        chain.fetch_all_objects("test.item", &mut req).unwrap();
        assert_eq!(req.result.len(), 1);
        chain.set_cache_after_search(&req, Arc::new(7u32));

        let mut again = ObjectsSearchRequest::cached();
        chain.fetch_all_objects("test.item", &mut again).unwrap();
        assert_eq!(again.cache::<u32>().as_deref(), Some(&7));

        chain.add_operation(create_op(&rules, "test.item", &["b"]), None).unwrap();
        let mut fresh = ObjectsSearchRequest::cached();
        chain.fetch_all_objects("test.item", &mut fresh).unwrap();
        assert!(fresh.cache::<u32>().is_none());
        assert_eq!(fresh.result.len(), 2);
    }

    #[test]
    fn vote_is_finalized_by_submission() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        let mut proposal = Operation::new("test.item");
        proposal.add_created(obj(json!({"id": ["voted"]}))).unwrap();
        let mut vote = Operation::new(OP_VOTE);
        vote.add_created(obj(json!({"id": ["v1"], "op": proposal.to_value(true), "state": "open"})))
            .unwrap();
        chain.add_operation(hashed(&rules, vote), None).unwrap();

        let mut different = proposal.mutable_copy();
        different.put("comment", json!("changed")).unwrap();
        different.set_ref(REF_VOTE, &[OP_VOTE, "v1"]).unwrap();
        assert_eq!(
            kind(chain.add_operation(hashed(&rules, different), None)),
            ErrorKind::VoteOpIsNotSame
        );

        let mut submit = proposal.mutable_copy();
        submit.set_ref(REF_VOTE, &[OP_VOTE, "v1"]).unwrap();
        let submit = chain.add_operation(hashed(&rules, submit), None).unwrap();
        let v1 = chain.object_by_id(OP_VOTE, &["v1"]).unwrap().unwrap();
        assert_eq!(v1.get_str(F_STATE), Some(STATE_FINAL));
        assert_eq!(v1.get_str(F_SUBMITTED_OP_HASH), Some(submit.raw_hash()));
        assert!(chain.object_by_id("test.item", &["voted"]).unwrap().is_some());

        let mut late = proposal.mutable_copy();
        late.put("comment", json!("late")).unwrap();
        late.set_ref(REF_VOTE, &[OP_VOTE, "v1"]).unwrap();
        assert_eq!(
            kind(chain.add_operation(hashed(&rules, late), None)),
            ErrorKind::VoteVotingObjIsFinal
        );
    }

    #[test]
    fn vote_ref_must_be_a_vote() {
        let rules = permissive();
        let chain = OpBlockChain::new_root(rules.clone());
        chain.add_operation(create_op(&rules, "test.item", &["x"]), None).unwrap();
        let mut op = Operation::new("test.item");
        op.set_ref(REF_VOTE, &["test.item", "x"]).unwrap();
        assert_eq!(
            kind(chain.add_operation(hashed(&rules, op), None)),
            ErrorKind::VoteOpSupportOnlySysVoteType
        );
    }
}

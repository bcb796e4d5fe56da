//! Persisted superblocks and the compaction policy.
//!
//! The chain engine only reads persisted layers. Everything that writes
//! them (persisting a layer, merging two persisted layers, unloading one
//! back into memory) goes through [`PersistenceManager`], which then hands
//! the new layer back to be spliced in with
//! [`OpBlockChain::change_to_equal_parent`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use odb_rules::OpBlockchainRules;
use odb_store::{InMemorySuperblockDb, StoreError};
use tracing::{debug, info};

use crate::chain::OpBlockChain;
use crate::config::ChainConfig;
use crate::error::{ChainError, ChainResult};

/// Result of compacting the layers below (and including) one layer.
#[derive(Debug, Clone)]
pub struct Compaction {
    /// The layer to use in place of the compacted one.
    pub chain: Arc<OpBlockChain>,
    /// Whether a merge happened in this pass.
    pub merged: bool,
}

/// Owner of the persisted superblocks of one chain.
pub struct PersistenceManager {
    rules: Arc<OpBlockchainRules>,
    config: ChainConfig,
    superblocks: RwLock<HashMap<String, Arc<InMemorySuperblockDb>>>,
}

impl PersistenceManager {
    pub fn new(rules: Arc<OpBlockchainRules>, config: ChainConfig) -> Self {
        Self {
            rules,
            config,
            superblocks: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Persisted superblock by hash.
    pub fn superblock(&self, hash: &str) -> Option<Arc<InMemorySuperblockDb>> {
        self.superblocks.read().ok()?.get(hash).cloned()
    }

    pub fn superblock_count(&self) -> usize {
        self.superblocks.read().map_or(0, |s| s.len())
    }

    fn register(&self, db: Arc<InMemorySuperblockDb>) -> ChainResult<()> {
        let mut superblocks = self
            .superblocks
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        superblocks.insert(db.superblock_hash().to_string(), db);
        Ok(())
    }

    fn backing(&self, layer: &OpBlockChain) -> ChainResult<Arc<InMemorySuperblockDb>> {
        let hash = layer.superblock_hash();
        let superblocks = self
            .superblocks
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        superblocks
            .get(&hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("superblock {hash}")).into())
    }

    /// Write an in-memory layer to a new superblock and return a persisted
    /// layer with the same content on the same parent.
    pub fn persist(&self, layer: &Arc<OpBlockChain>) -> ChainResult<Arc<OpBlockChain>> {
        layer.validate_locked()?;
        let memory = layer.memory_layer()?;
        if !memory.ops.queue.is_empty() {
            return Err(ChainError::InvalidState("layer has queued operations".into()));
        }
        if memory.blocks.is_empty() {
            return Err(ChainError::InvalidState("layer has no blocks".into()));
        }
        let snapshot = memory.to_snapshot();
        let headers = snapshot.headers();
        let db = Arc::new(InMemorySuperblockDb::new(snapshot));
        let persisted = OpBlockChain::with_db(layer.parent(), headers, db.clone(), self.rules.clone())?;
        self.register(db.clone())?;
        info!(
            superblock = %db.superblock_hash(),
            blocks = persisted.superblock_size(),
            "superblock persisted"
        );
        Ok(persisted)
    }

    /// Persist the parent of `child` and splice the persisted copy in.
    pub fn persist_parent_of(&self, child: &Arc<OpBlockChain>) -> ChainResult<Arc<OpBlockChain>> {
        let parent = child
            .parent()
            .ok_or_else(|| ChainError::InvalidState("layer has no parent".into()))?;
        let persisted = self.persist(&parent)?;
        if !child.change_to_equal_parent(&persisted)? {
            return Err(ChainError::InvalidState(
                "persisted layer differs from the original".into(),
            ));
        }
        Ok(persisted)
    }

    /// Merge a persisted layer with its persisted parent into one
    /// superblock. Both inputs are retired only once the merged superblock
    /// is complete.
    pub fn merge(&self, layer: &Arc<OpBlockChain>) -> ChainResult<Arc<OpBlockChain>> {
        let parent = layer
            .parent()
            .ok_or_else(|| ChainError::InvalidState("layer has no parent".into()))?;
        let newer = self.backing(layer)?;
        let older = self.backing(&parent)?;
        layer.validate_locked()?;
        parent.validate_locked()?;
        let grandparent = parent.parent();
        if let Some(gp) = &grandparent {
            gp.validate_locked()?;
        }
        let mut superblocks = self
            .superblocks
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        let merged = Arc::new(InMemorySuperblockDb::merge(&newer, &older)?);
        let headers = merged.headers()?;
        let chain = OpBlockChain::with_db(grandparent, headers, merged.clone(), self.rules.clone())?;
        superblocks.remove(newer.superblock_hash());
        superblocks.remove(older.superblock_hash());
        superblocks.insert(merged.superblock_hash().to_string(), merged.clone());
        drop(superblocks);
        info!(
            superblock = %merged.superblock_hash(),
            blocks = chain.superblock_size(),
            "persisted superblocks merged"
        );
        Ok(chain)
    }

    /// Rebuild a persisted layer in memory by replicating its blocks.
    pub fn unload(&self, layer: &Arc<OpBlockChain>) -> ChainResult<Arc<OpBlockChain>> {
        if !layer.is_db_accessed() {
            return Err(ChainError::InvalidState("layer is not persisted".into()));
        }
        let blocks = layer.superblock_full_blocks()?;
        let unloaded = OpBlockChain::new(layer.parent(), self.rules.clone())?;
        for mut block in blocks.into_iter().rev() {
            block.make_immutable();
            if !unloaded.replicate_block(&block, None)? {
                return Err(ChainError::InvalidState(format!(
                    "block {} could not be replicated",
                    block.full_hash()
                )));
            }
        }
        info!(superblock = %unloaded.superblock_hash(), "superblock unloaded");
        Ok(unloaded)
    }

    /// Compact the layers below `top`, the layer that receives new
    /// operations, and splice the result in. Returns whether a merge
    /// happened.
    pub fn compact_chain(&self, top: &Arc<OpBlockChain>) -> ChainResult<bool> {
        let Some(parent) = top.parent() else {
            return Ok(false);
        };
        let compaction = self.compact(0, &parent)?;
        if compaction.merged && !top.change_to_equal_parent(&compaction.chain)? {
            return Err(ChainError::InvalidState(
                "compacted layer differs from the original".into(),
            ));
        }
        Ok(compaction.merged)
    }

    /// One compaction pass from `layer` towards the root.
    ///
    /// `layer` is merged into its parent when both have the same backing
    /// and `size + coefficient * prev_size > parent size`, where
    /// `prev_size` is the size of the layer above (0 across a change of
    /// backing). At most one merge happens per pass: once a layer below
    /// merged, the layers above only re-point to the merged result.
    pub fn compact(&self, prev_size: usize, layer: &Arc<OpBlockChain>) -> ChainResult<Compaction> {
        let Some(parent) = layer.parent() else {
            return Ok(Compaction {
                chain: layer.clone(),
                merged: false,
            });
        };
        let size = layer.superblock_size();
        let same_backing = layer.is_db_accessed() == parent.is_db_accessed();
        let below = self.compact(if same_backing { size } else { 0 }, &parent)?;
        if same_backing
            && !below.merged
            && self
                .config
                .should_merge(size, prev_size, parent.superblock_size())
        {
            let chain = if layer.is_db_accessed() {
                self.merge(layer)?
            } else {
                OpBlockChain::merged(layer, &parent)?
            };
            info!(
                size,
                prev_size,
                parent_size = parent.superblock_size(),
                superblock = %chain.superblock_hash(),
                "layers compacted"
            );
            return Ok(Compaction {
                chain,
                merged: true,
            });
        }
        if below.merged && !layer.change_to_equal_parent(&below.chain)? {
            return Err(ChainError::InvalidState(
                "compacted parent differs from the original".into(),
            ));
        }
        debug!(size, prev_size, merged = below.merged, "compaction step");
        Ok(Compaction {
            chain: layer.clone(),
            merged: below.merged,
        })
    }
}

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use odb_rules::{ChainView, ObjectsSearchRequest};
use odb_store::{StoreResult, StoredObject};
use odb_types::{Block, CompoundKey, OpObject, Operation};
use tracing::{debug, warn};

use crate::chain::OpBlockChain;
use crate::store::Local;

type CacheValue = Arc<dyn Any + Send + Sync>;

/// Search results cached per object type, each tagged with the edit
/// version it was computed at.
#[derive(Default)]
pub(crate) struct CacheSlots(Mutex<HashMap<String, (u64, CacheValue)>>);

impl CacheSlots {
    fn slots(&self) -> Option<MutexGuard<'_, HashMap<String, (u64, CacheValue)>>> {
        match self.0.lock() {
            Ok(slots) => Some(slots),
            Err(_) => {
                warn!("search cache lock poisoned, cache bypassed");
                None
            }
        }
    }

    pub fn get(&self, obj_type: &str, version: u64) -> Option<CacheValue> {
        let slots = self.slots()?;
        match slots.get(obj_type) {
            Some((v, value)) if *v == version => Some(value.clone()),
            _ => None,
        }
    }

    pub fn put(&self, obj_type: &str, version: u64, value: CacheValue) {
        if let Some(mut slots) = self.slots() {
            slots.insert(obj_type.to_string(), (version, value));
        }
    }

    pub fn clear(&self) {
        if let Some(mut slots) = self.slots() {
            slots.clear();
        }
    }
}

/// Read view over one layer's storage and its ancestry.
///
/// Lookups check the local maps first and recurse into the parent on a
/// miss. The view is also what the rules engine validates against, both
/// for live layers and for scratch layers being rebuilt.
pub(crate) struct LayerView<'a> {
    pub local: &'a Local,
    pub parent: Option<&'a Arc<OpBlockChain>>,
    base_version: u64,
    cache: Option<&'a CacheSlots>,
}

impl<'a> LayerView<'a> {
    pub fn new(
        local: &'a Local,
        parent: Option<&'a Arc<OpBlockChain>>,
        base_version: u64,
        cache: Option<&'a CacheSlots>,
    ) -> Self {
        Self {
            local,
            parent,
            base_version,
            cache,
        }
    }

    pub fn edit_version(&self, obj_type: &str) -> u64 {
        self.local.edit_version(obj_type).unwrap_or(self.base_version)
    }

    /// Newest entry for a key, tombstones included.
    pub fn stored_object(&self, obj_type: &str, key: &CompoundKey) -> StoreResult<Option<StoredObject>> {
        if let Some(found) = self.local.object(obj_type, key)? {
            return Ok(Some(found));
        }
        match self.parent {
            Some(p) => p.stored_object(obj_type, key),
            None => Ok(None),
        }
    }

    /// Every entry of a type visible here, newest version per key.
    pub fn collect_objects(&self, obj_type: &str) -> StoreResult<BTreeMap<CompoundKey, StoredObject>> {
        let mut merged: BTreeMap<CompoundKey, StoredObject> =
            self.local.objects(obj_type)?.into_iter().collect();
        if let Some(p) = self.parent {
            for (k, v) in p.collect_objects(obj_type)? {
                merged.entry(k).or_insert(v);
            }
        }
        Ok(merged)
    }

    pub fn operation_by_hash(&self, raw_hash: &str) -> StoreResult<Option<Arc<Operation>>> {
        if let Some(op) = self.local.operation(raw_hash)? {
            return Ok(Some(op));
        }
        match self.parent {
            Some(p) => p.operation_by_hash(raw_hash),
            None => Ok(None),
        }
    }

    pub fn last_block_header(&self) -> StoreResult<Option<Block>> {
        if let Some(last) = self.local.blocks().last() {
            return Ok(Some(last.header()));
        }
        match self.parent {
            Some(p) => p.last_block_header(),
            None => Ok(None),
        }
    }

    pub fn block_header_by_raw_hash(&self, raw_hash: &str) -> StoreResult<Option<Block>> {
        if let Some(b) = self.local.blocks().by_raw_hash(raw_hash) {
            return Ok(Some(b.header()));
        }
        match self.parent {
            Some(p) => p.block_header_by_raw_hash(raw_hash),
            None => Ok(None),
        }
    }
}

impl ChainView for LayerView<'_> {
    fn object_by_name(&self, obj_type: &str, key: &CompoundKey) -> StoreResult<Option<Arc<OpObject>>> {
        Ok(self.stored_object(obj_type, key)?.and_then(StoredObject::into_live))
    }

    fn block_depth(&self, block: &Block) -> StoreResult<i64> {
        Ok(self
            .block_header_by_raw_hash(block.raw_hash())?
            .map_or(-1, |b| b.block_id()))
    }

    fn fetch_all_objects(&self, obj_type: &str, request: &mut ObjectsSearchRequest) -> StoreResult<()> {
        request.object_type = obj_type.to_string();
        request.edit_version = self.edit_version(obj_type);
        if request.request_cache {
            if let Some(cached) = self.cache.and_then(|c| c.get(obj_type, request.edit_version)) {
                debug!(obj_type, version = request.edit_version, "search served from cache");
                request.cache_object = Some(cached);
                return Ok(());
            }
        }
        let limit = request.limit.unwrap_or(usize::MAX);
        request.result = self
            .collect_objects(obj_type)?
            .into_values()
            .filter_map(StoredObject::into_live)
            .take(limit)
            .collect();
        Ok(())
    }

    fn set_cache_after_search(&self, request: &ObjectsSearchRequest, cache: Arc<dyn Any + Send + Sync>) {
        let Some(slots) = self.cache else {
            return;
        };
        if self.edit_version(&request.object_type) == request.edit_version {
            slots.put(&request.object_type, request.edit_version, cache);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_slots_are_versioned() {
        let slots = CacheSlots::default();
        slots.put("t", 3, Arc::new(7u32));
        assert!(slots.get("t", 3).is_some());
        assert!(slots.get("t", 4).is_none());
        assert!(slots.get("other", 3).is_none());
        slots.clear();
        assert!(slots.get("t", 3).is_none());
    }

    #[test]
    fn poisoned_cache_is_bypassed() {
        let slots = CacheSlots::default();
        slots.put("t", 1, Arc::new(1u32));
        let poisoned = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = slots.0.lock().unwrap();
                panic!("cache writer failed");
            })
            .join()
        });
        assert!(poisoned.is_err());
        assert!(slots.get("t", 1).is_none());
        slots.put("t", 2, Arc::new(2u32));
        slots.clear();
        assert!(slots.get("t", 2).is_none());
    }
}

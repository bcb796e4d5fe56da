use std::any::Any;
use std::fmt;
use std::sync::Arc;

use odb_store::StoreResult;
use odb_types::{Block, CompoundKey, OpObject};

/// Read access to the chain the rules are checked against.
///
/// Implemented by the chain engine; lookups cascade through every parent
/// layer.
pub trait ChainView {
    /// Newest live version of an object, `None` if absent or deleted.
    fn object_by_name(&self, obj_type: &str, key: &CompoundKey) -> StoreResult<Option<Arc<OpObject>>>;

    /// Id of the block with the same raw hash, or -1.
    fn block_depth(&self, block: &Block) -> StoreResult<i64>;

    /// All live objects of a type, newest version first per key.
    ///
    /// When `request.request_cache` is set and the chain holds a cache value
    /// for the type, it is returned in `request.cache_object` and
    /// `request.result` may be left empty.
    fn fetch_all_objects(&self, obj_type: &str, request: &mut ObjectsSearchRequest) -> StoreResult<()>;

    /// Attach a value computed from the result of `request` to the type's
    /// object map. Dropped if the map changed since the search.
    fn set_cache_after_search(&self, request: &ObjectsSearchRequest, cache: Arc<dyn Any + Send + Sync>);
}

/// Parameters and result of [`ChainView::fetch_all_objects`].
#[derive(Default)]
pub struct ObjectsSearchRequest {
    pub limit: Option<usize>,
    pub request_cache: bool,
    pub result: Vec<Arc<OpObject>>,
    pub cache_object: Option<Arc<dyn Any + Send + Sync>>,
    /// Type searched, filled by the search.
    pub object_type: String,
    /// Edit version of the searched object map, filled by the search.
    pub edit_version: u64,
}

impl ObjectsSearchRequest {
    pub fn cached() -> Self {
        Self {
            request_cache: true,
            ..Self::default()
        }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Typed view of the cache value, if one of type `T` was returned.
    pub fn cache<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.cache_object.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for ObjectsSearchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectsSearchRequest")
            .field("limit", &self.limit)
            .field("request_cache", &self.request_cache)
            .field("result", &self.result.len())
            .field("cached", &self.cache_object.is_some())
            .field("object_type", &self.object_type)
            .field("edit_version", &self.edit_version)
            .finish()
    }
}

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use odb_types::OpObject;

/// Objects an operation touches, resolved against the chain before the
/// rules run.
#[derive(Debug, Clone, Default)]
pub struct LocalValidationCtx {
    /// Block the operation is validated for; `""` for the queue.
    pub block_hash: String,
    /// Ids already modified by this operation.
    pub ids: HashSet<Vec<String>>,
    /// Objects named in `ref`.
    pub ref_objs: BTreeMap<String, Arc<OpObject>>,
    pub deleted_objs: Vec<Arc<OpObject>>,
    /// Created or edited objects paired with the version they replace.
    pub new_objs: Vec<(Arc<OpObject>, Option<Arc<OpObject>>)>,
    pub skip_sig_validation: bool,
}

impl LocalValidationCtx {
    pub fn new(block_hash: &str) -> Self {
        Self {
            block_hash: block_hash.to_string(),
            ..Self::default()
        }
    }

    /// Record an id as modified. Returns `false` if it already was.
    pub fn touch(&mut self, id: &[String]) -> bool {
        self.ids.insert(id.to_vec())
    }
}

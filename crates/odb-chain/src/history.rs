use std::collections::BTreeMap;
use std::sync::Arc;

use odb_types::OpObject;

/// Optional sink for the objects an operation deletes, keyed by the raw
/// hash of the deleting operation. Used by history views.
#[derive(Debug, Clone, Default)]
pub struct DeletedObjectCtx {
    deleted: BTreeMap<String, Vec<Arc<OpObject>>>,
}

impl DeletedObjectCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, op_hash: &str, objects: impl IntoIterator<Item = Arc<OpObject>>) {
        let entry = self.deleted.entry(op_hash.to_string()).or_default();
        entry.extend(objects);
        if entry.is_empty() {
            self.deleted.remove(op_hash);
        }
    }

    /// Objects deleted by one operation.
    pub fn deleted_by(&self, op_hash: &str) -> &[Arc<OpObject>] {
        self.deleted.get(op_hash).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Arc<OpObject>])> {
        self.deleted.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
    }
}

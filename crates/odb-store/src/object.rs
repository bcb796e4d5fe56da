use std::sync::Arc;

use odb_types::OpObject;

/// Marker left in an object map when an object is deleted. It shadows older
/// versions in parent layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    /// Type of the deleting operation.
    pub op_type: String,
    /// Raw hash of the deleting operation.
    pub op_hash: String,
}

/// One entry of a per-type object map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredObject {
    Live(Arc<OpObject>),
    Deleted(Tombstone),
}

impl StoredObject {
    pub fn deleted(op_type: &str, op_hash: &str) -> Self {
        Self::Deleted(Tombstone {
            op_type: op_type.to_string(),
            op_hash: op_hash.to_string(),
        })
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted(_))
    }

    pub fn live(&self) -> Option<&Arc<OpObject>> {
        match self {
            Self::Live(o) => Some(o),
            Self::Deleted(_) => None,
        }
    }

    pub fn into_live(self) -> Option<Arc<OpObject>> {
        match self {
            Self::Live(o) => Some(o),
            Self::Deleted(_) => None,
        }
    }
}

impl From<Arc<OpObject>> for StoredObject {
    fn from(obj: Arc<OpObject>) -> Self {
        Self::Live(obj)
    }
}

use std::sync::Arc;

use crate::error::TypeError;
use crate::operation::Operation;

/// Bookkeeping for one operation hash inside a chain layer: whether the
/// layer holds the operation itself, which of its object slots were
/// deleted later, and by which operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationDeleteInfo {
    pub op: Option<Arc<Operation>>,
    pub create: bool,
    pub deleted_objects: Vec<bool>,
    pub deleted_op_hashes: Vec<String>,
}

impl OperationDeleteInfo {
    /// Info for an operation added to a layer.
    pub fn created(op: Arc<Operation>) -> Self {
        Self {
            op: Some(op),
            create: true,
            ..Self::default()
        }
    }

    /// Info for an operation that lives in an older layer but had an object
    /// deleted here.
    pub fn referenced(op: Arc<Operation>) -> Self {
        Self {
            op: Some(op),
            ..Self::default()
        }
    }

    /// Mark object slot `index` as deleted by operation `by_hash`.
    pub fn mark_deleted(&mut self, index: usize, by_hash: &str) {
        if self.deleted_objects.len() <= index {
            self.deleted_objects.resize(index + 1, false);
        }
        self.deleted_objects[index] = true;
        self.deleted_op_hashes.push(by_hash.to_string());
    }

    /// Undo [`mark_deleted`](Self::mark_deleted).
    pub fn unmark_deleted(&mut self, index: usize, by_hash: &str) {
        if let Some(slot) = self.deleted_objects.get_mut(index) {
            *slot = false;
        }
        self.deleted_op_hashes.retain(|h| h != by_hash);
    }

    pub fn is_deleted(&self, index: usize) -> bool {
        self.deleted_objects.get(index).copied().unwrap_or(false)
    }

    /// Merge a child layer's info over its parent's.
    ///
    /// Creation flags and deleted slots may not overlap: an operation is
    /// created in exactly one layer and a slot is deleted at most once.
    pub fn merge(child: Option<&Self>, parent: Option<&Self>) -> Result<Self, TypeError> {
        let parent_create = parent.is_some_and(|p| p.create);
        let child_create = child.is_some_and(|c| c.create);
        if parent_create && child_create {
            return Err(TypeError::MergeConflict("Operation was created twice".into()));
        }
        let op = parent
            .and_then(|p| p.op.clone())
            .or_else(|| child.and_then(|c| c.op.clone()));
        let psz = parent.map_or(0, |p| p.deleted_objects.len());
        let csz = child.map_or(0, |c| c.deleted_objects.len());
        let mut deleted_objects = vec![false; psz.max(csz)];
        if let Some(p) = parent {
            for (i, d) in p.deleted_objects.iter().enumerate() {
                deleted_objects[i] |= *d;
            }
        }
        if let Some(c) = child {
            for (i, d) in c.deleted_objects.iter().enumerate() {
                if *d {
                    if deleted_objects[i] {
                        return Err(TypeError::MergeConflict("Object was deleted twice".into()));
                    }
                    deleted_objects[i] = true;
                }
            }
        }
        let deleted_op_hashes = parent
            .into_iter()
            .chain(child)
            .flat_map(|i| i.deleted_op_hashes.iter().cloned())
            .collect();
        Ok(Self {
            op,
            create: parent_create || child_create,
            deleted_objects,
            deleted_op_hashes,
        })
    }
}

//! Resolution of the objects an operation touches, and the mutation that
//! links a resolved operation into a layer.
//!
//! [`prepare`] has no side effects on the layer: it fails with the first
//! violated rule. [`apply`] cannot fail; it only runs on a [`Prepared`]
//! operation.

use std::fmt;
use std::sync::Arc;

use odb_rules::error::id_string;
use odb_rules::names::{
    F_OP, F_SUBMITTED_OP_HASH, OP_OPERATION, OP_VOTE, REF_OP, REF_VOTE, STATE_FINAL,
};
use odb_rules::{ChainView, ErrorKind, LocalValidationCtx, OpBlockchainRules};
use odb_store::StoredObject;
use odb_types::json::{json_equals, opt_json_equals, value_to_string};
use odb_types::object::F_STATE;
use odb_types::operation::{F_REF, F_SIGNED_BY};
use odb_types::{CompoundKey, OpObject, Operation};
use serde_json::{Map, Value};

use crate::error::{ChainError, ChainResult};
use crate::lookup::LayerView;
use crate::store::MemoryLayer;

const EDIT_SET: &str = "set";
const EDIT_DELETE: &str = "delete";
const EDIT_APPEND: &str = "append";
const EDIT_INCREMENT: &str = "increment";

/// Object slot of an older operation that gets deleted.
struct DeleteSlot {
    op: Arc<Operation>,
    index: usize,
}

/// An operation that passed validation, with everything [`apply`] writes.
pub(crate) struct Prepared {
    pub op: Arc<Operation>,
    pub ctx: LocalValidationCtx,
    deleted_keys: Vec<CompoundKey>,
    /// Keys of `ctx.new_objs`, in the same order.
    new_keys: Vec<CompoundKey>,
    delete_slots: Vec<DeleteSlot>,
    vote: Option<(CompoundKey, Arc<OpObject>)>,
}

fn fail(rules: &OpBlockchainRules, hash: &str, kind: ErrorKind, args: &[&dyn fmt::Display]) -> ChainError {
    rules.error(hash, kind, args).into()
}

/// Resolve and validate `op` against `view`.
pub(crate) fn prepare(
    view: &LayerView<'_>,
    rules: &OpBlockchainRules,
    op: Arc<Operation>,
    mut ctx: LocalValidationCtx,
) -> ChainResult<Prepared> {
    let hash = op.raw_hash().to_string();
    let op_type = op.op_type().to_string();
    if hash.is_empty() {
        let full = op.hash().unwrap_or("");
        return Err(fail(rules, full, ErrorKind::OpHashIsNotCorrect, &[&full, &""]));
    }
    if view.operation_by_hash(&hash)?.is_some() {
        return Err(fail(
            rules,
            &hash,
            ErrorKind::OpHashIsDuplicated,
            &[&hash, &ctx.block_hash],
        ));
    }

    let mut prepared = Prepared {
        op: op.clone(),
        ctx: LocalValidationCtx::default(),
        deleted_keys: Vec::new(),
        new_keys: Vec::new(),
        delete_slots: Vec::new(),
        vote: None,
    };

    for id in op.deleted() {
        let key = CompoundKey::new(id.clone())?;
        let Some(obj) = view.object_by_name(&op_type, &key)? else {
            return Err(fail(rules, &hash, ErrorKind::DelObjNotFound, &[&hash, &id_string(&id)]));
        };
        if !ctx.touch(&id) {
            return Err(fail(
                rules,
                &hash,
                ErrorKind::ObjModifiedTwiceInSameOperation,
                &[&hash, &id_string(&id)],
            ));
        }
        if let Some(slot) = delete_slot(view, &obj)? {
            prepared.delete_slots.push(slot);
        }
        ctx.deleted_objs.push(obj);
        prepared.deleted_keys.push(key);
    }

    if op.created().len() > rules.config().max_created_objects_per_op {
        return Err(fail(rules, &hash, ErrorKind::LimitOfCreatedObjForOpWasExceeded, &[&hash]));
    }
    for (i, obj) in op.created().iter().enumerate() {
        let mut created = obj.mutable_copy();
        let mut id = obj.id();
        if id.is_empty() {
            id = vec![hash.clone(), i.to_string()];
            created.set_id(&id)?;
        }
        if !ctx.touch(&id) {
            return Err(fail(
                rules,
                &hash,
                ErrorKind::ObjModifiedTwiceInSameOperation,
                &[&hash, &id_string(&id)],
            ));
        }
        let mut created = created.with_parent_op(&op_type, &hash);
        created.make_immutable();
        prepared.new_keys.push(CompoundKey::new(id)?);
        ctx.new_objs.push((Arc::new(created), None));
    }

    for edit in op.edited() {
        let id = edit.id();
        let id_text = id_string(&id);
        if !ctx.touch(&id) {
            return Err(fail(
                rules,
                &hash,
                ErrorKind::ObjModifiedTwiceInSameOperation,
                &[&hash, &id_text],
            ));
        }
        let key = CompoundKey::new(id.clone())?;
        let Some(current) = view.object_by_name(&op_type, &key)? else {
            return Err(fail(rules, &hash, ErrorKind::EditObjNotFound, &[&hash, &id_text]));
        };
        if op_type == OP_VOTE && current.get_str(F_STATE) == Some(STATE_FINAL) {
            return Err(fail(rules, &hash, ErrorKind::VoteVotingObjIsFinal, &[&hash, &id_text]));
        }
        let expected = edit.current_fields();
        for (path, value) in &expected {
            let actual = current.field_by_path(path);
            if !opt_json_equals(Some(value), actual) {
                let actual_text = actual.map_or_else(|| "null".to_string(), value_to_string);
                return Err(fail(
                    rules,
                    &hash,
                    ErrorKind::EditOldFieldValueIncorrect,
                    &[&hash, &id_text, path, &actual_text, &value_to_string(value)],
                ));
            }
        }
        let mut edited = current.mutable_copy();
        for (path, change) in edit.change_fields() {
            let edit_ctx = EditCtx {
                rules,
                hash: &hash,
                id: &id_text,
                current: &current,
                expected: &expected,
            };
            edit_ctx.apply_change(&mut edited, &path, &change)?;
        }
        let mut edited = edited.with_parent_op(&op_type, &hash);
        edited.make_immutable();
        prepared.new_keys.push(key);
        ctx.new_objs.push((Arc::new(edited), Some(current)));
    }

    for (name, target) in op.refs() {
        let found = match target.split_first() {
            Some((ref_type, ref_key)) if !ref_key.is_empty() => {
                let key = CompoundKey::new(ref_key.iter().cloned())?;
                view.object_by_name(ref_type, &key)?
            }
            _ => None,
        };
        let Some(obj) = found else {
            return Err(fail(rules, &hash, ErrorKind::RefObjNotFound, &[&hash, &id_string(&target)]));
        };
        ctx.ref_objs.insert(name, obj);
    }
    if let Some(vote) = ctx.ref_objs.get(REF_VOTE).cloned() {
        let (key, finalized) = finalize_vote(rules, &op, &hash, &vote)?;
        ctx.ref_objs.insert(REF_VOTE.to_string(), finalized.clone());
        prepared.vote = Some((key, finalized));
    }
    if let Some(op_def) = view.object_by_name(OP_OPERATION, &CompoundKey::primary(&op_type, None))? {
        ctx.ref_objs.insert(REF_OP.to_string(), op_def);
    }

    rules.validate_op(view, &op, &ctx)?;
    op.mark_validated(chrono::Utc::now().timestamp_millis());
    prepared.ctx = ctx;
    Ok(prepared)
}

/// Link a prepared operation into the queue of `layer`: tombstones for
/// deleted objects, new versions for created and edited ones, delete
/// bookkeeping on the operations that created the deleted objects.
pub(crate) fn apply(layer: &mut MemoryLayer, prepared: Prepared, version: u64) {
    let Prepared {
        op,
        ctx,
        deleted_keys,
        new_keys,
        delete_slots,
        vote,
    } = prepared;
    let hash = op.raw_hash();
    let op_type = op.op_type();
    for key in deleted_keys {
        layer
            .objects_mut(op_type, version)
            .insert(key, StoredObject::deleted(op_type, hash));
    }
    for slot in delete_slots {
        layer.ops.mark_deleted(&slot.op, slot.index, hash);
    }
    layer.ops.enqueue(op.clone());
    for ((obj, _), key) in ctx.new_objs.into_iter().zip(new_keys) {
        layer
            .objects_mut(op_type, version)
            .insert(key, StoredObject::Live(obj));
    }
    if let Some((key, vote)) = vote {
        if vote.get_str(F_SUBMITTED_OP_HASH) == Some(hash) {
            layer
                .objects_mut(OP_VOTE, version)
                .insert(key, StoredObject::Live(vote));
        }
    }
}

/// Slot of `obj` in the operation that created or last edited it.
/// Created objects come first, then edited ones.
fn delete_slot(view: &LayerView<'_>, obj: &OpObject) -> ChainResult<Option<DeleteSlot>> {
    let Some(parent_hash) = obj.parent_hash() else {
        return Ok(None);
    };
    let Some(op) = view.operation_by_hash(parent_hash)? else {
        return Ok(None);
    };
    let id = obj.id();
    let created = op.created().iter().enumerate().position(|(i, c)| {
        let cid = c.id();
        if cid.is_empty() {
            id.len() == 2 && id[0] == parent_hash && id[1] == i.to_string()
        } else {
            cid == id
        }
    });
    let index = match created {
        Some(i) => Some(i),
        None => op
            .edited()
            .iter()
            .position(|e| e.id() == id)
            .map(|i| i + op.created().len()),
    };
    Ok(index.map(|index| DeleteSlot { op: op.clone(), index }))
}

/// Operation content compared between a vote and its submission.
fn proposal_json(op: &Operation) -> Value {
    let mut v = op.to_value(true);
    if let Value::Object(m) = &mut v {
        m.remove(F_REF);
        m.remove(F_SIGNED_BY);
    }
    v
}

/// Check that `op` is exactly what `vote` proposes and return the vote
/// flipped to final.
fn finalize_vote(
    rules: &OpBlockchainRules,
    op: &Operation,
    hash: &str,
    vote: &OpObject,
) -> ChainResult<(CompoundKey, Arc<OpObject>)> {
    let vote_id = id_string(&vote.id());
    let parent_type = vote.parent_type().unwrap_or("");
    if parent_type != OP_VOTE {
        return Err(fail(
            rules,
            hash,
            ErrorKind::VoteOpSupportOnlySysVoteType,
            &[&hash, &parent_type],
        ));
    }
    if vote.get_str(F_STATE) == Some(STATE_FINAL) {
        return Err(fail(rules, hash, ErrorKind::VoteVotingObjIsFinal, &[&hash, &vote_id]));
    }
    let submitted = proposal_json(op);
    let proposed = vote
        .get(F_OP)
        .and_then(|v| Operation::from_value(v.clone()).ok())
        .map(|p| proposal_json(&p));
    if !proposed.as_ref().is_some_and(|p| json_equals(p, &submitted)) {
        let proposed_text = proposed.map_or_else(|| "null".to_string(), |p| p.to_string());
        return Err(fail(
            rules,
            hash,
            ErrorKind::VoteOpIsNotSame,
            &[&hash, &proposed_text, &submitted],
        ));
    }
    let mut finalized = vote.mutable_copy();
    finalized.put_str(F_STATE, STATE_FINAL)?;
    finalized.put_str(F_SUBMITTED_OP_HASH, hash)?;
    finalized.make_immutable();
    Ok((CompoundKey::new(finalized.id())?, Arc::new(finalized)))
}

struct EditCtx<'a> {
    rules: &'a OpBlockchainRules,
    hash: &'a str,
    id: &'a str,
    current: &'a OpObject,
    expected: &'a Map<String, Value>,
}

impl EditCtx<'_> {
    /// Apply one `change` entry: `"delete"`, `"increment"`, or a single-key
    /// map `{op: value}` with op one of set, delete, append, increment.
    fn apply_change(&self, edited: &mut OpObject, path: &str, change: &Value) -> ChainResult<()> {
        let (op_name, arg) = match change {
            Value::String(s) => (s.as_str(), None),
            Value::Object(m) if m.len() == 1 => match m.iter().next() {
                Some((k, v)) => (k.as_str(), Some(v)),
                None => return Err(self.unsupported(change)),
            },
            other => return Err(self.unsupported(other)),
        };
        let old = edited.field_by_path(path).cloned();
        let (value, check_current) = match op_name {
            EDIT_DELETE => (None, true),
            EDIT_SET => (Some(arg.cloned().unwrap_or(Value::Null)), true),
            EDIT_APPEND => (Some(self.append(path, old, arg.cloned().unwrap_or(Value::Null))?), false),
            EDIT_INCREMENT => (Some(self.increment(path, old)?), false),
            other => {
                return Err(fail(self.rules, self.hash, ErrorKind::EditOpNotSupported, &[&other]));
            }
        };
        if check_current
            && !self.expected.contains_key(path)
            && self.current.field_by_path(path).is_some_and(|v| !v.is_null())
        {
            return Err(fail(
                self.rules,
                self.hash,
                ErrorKind::EditChangeDidNotSpecifyCurrentValue,
                &[&self.hash, &path, &self.id],
            ));
        }
        edited
            .set_field_by_path(path, value)
            .map_err(|_| fail(self.rules, self.hash, ErrorKind::EditObjNotFound, &[&self.hash, &path]))
    }

    fn append(&self, path: &str, old: Option<Value>, value: Value) -> ChainResult<Value> {
        match old {
            None | Some(Value::Null) => Ok(Value::Array(vec![value])),
            Some(Value::Array(mut items)) => {
                items.push(value);
                Ok(Value::Array(items))
            }
            Some(Value::Object(mut map)) => match value {
                Value::Object(add) => {
                    map.extend(add);
                    Ok(Value::Object(map))
                }
                _ => Err(self.append_only(path, &Value::Object(map))),
            },
            Some(other) => Err(self.append_only(path, &other)),
        }
    }

    fn increment(&self, path: &str, old: Option<Value>) -> ChainResult<Value> {
        match old {
            None | Some(Value::Null) => Ok(Value::from(1)),
            // Integers wrap like the long arithmetic of stored counters;
            // fractional values are truncated toward zero first.
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(i.wrapping_add(1)))
                } else if let Some(u) = n.as_u64() {
                    Ok(Value::from(u.wrapping_add(1)))
                } else {
                    let f = n.as_f64().unwrap_or(0.0).trunc();
                    Ok(Value::from((f as i64).wrapping_add(1)))
                }
            }
            Some(other) => Err(fail(
                self.rules,
                self.hash,
                ErrorKind::EditOpIncrementOnlyForNumbers,
                &[&path, &value_to_string(&other)],
            )),
        }
    }

    fn append_only(&self, path: &str, old: &Value) -> ChainError {
        fail(
            self.rules,
            self.hash,
            ErrorKind::EditOpAppendOnlyForListMap,
            &[&path, &value_to_string(old)],
        )
    }

    fn unsupported(&self, change: &Value) -> ChainError {
        fail(
            self.rules,
            self.hash,
            ErrorKind::EditOpNotSupported,
            &[&value_to_string(change)],
        )
    }
}

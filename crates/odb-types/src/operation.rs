//! Signed operations: the unit of change applied to the database.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::TypeError;
use crate::hash::raw_hash;
use crate::json::{self, string_array, string_list};
use crate::object::{OpObject, F_COMMENT, F_EVAL, F_NAME};

pub const F_TYPE: &str = "type";
pub const F_SIGNED_BY: &str = "signed_by";
pub const F_HASH: &str = "hash";
pub const F_SIGNATURE: &str = "signature";
pub const F_REF: &str = "ref";
pub const F_CREATE: &str = "create";
pub const F_DELETE: &str = "delete";
pub const F_EDIT: &str = "edit";

/// A typed, signed change set: objects to create, edit and delete plus
/// named references to existing objects.
///
/// `type`, `create` and `edit` are held separately from the free-form
/// fields. The validation timestamp is recorded the first time the
/// operation passes validation and is not serialized.
#[derive(Clone, Default)]
pub struct Operation {
    op_type: String,
    fields: BTreeMap<String, Value>,
    created: Vec<OpObject>,
    edited: Vec<OpObject>,
    immutable: bool,
    validated_at: OnceLock<i64>,
}

impl Operation {
    pub fn new(op_type: &str) -> Self {
        Self {
            op_type: op_type.to_string(),
            ..Self::default()
        }
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn set_type(&mut self, op_type: &str) -> Result<(), TypeError> {
        self.check_mutable()?;
        self.op_type = op_type.to_string();
        Ok(())
    }

    pub fn hash(&self) -> Option<&str> {
        self.fields.get(F_HASH).and_then(Value::as_str)
    }

    /// Hex part of the hash, or `""` when the operation is not hashed yet.
    pub fn raw_hash(&self) -> &str {
        self.hash().map(raw_hash).unwrap_or("")
    }

    pub fn signed_by(&self) -> Vec<String> {
        string_list(self.fields.get(F_SIGNED_BY))
    }

    pub fn set_signed_by(&mut self, user: &str) -> Result<(), TypeError> {
        self.put(F_SIGNED_BY, Value::String(user.to_string()))
    }

    /// Append a co-signer, turning `signed_by` into a list.
    pub fn add_other_signed_by(&mut self, user: &str) -> Result<(), TypeError> {
        let mut all = self.signed_by();
        all.push(user.to_string());
        self.put(F_SIGNED_BY, string_array(&all))
    }

    pub fn signatures(&self) -> Vec<String> {
        string_list(self.fields.get(F_SIGNATURE))
    }

    /// Named references: `{name: [type, key...]}`.
    pub fn refs(&self) -> BTreeMap<String, Vec<String>> {
        match self.fields.get(F_REF) {
            Some(Value::Object(m)) => m
                .iter()
                .map(|(k, v)| (k.clone(), string_list(Some(v))))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    pub fn set_ref<S: AsRef<str>>(&mut self, name: &str, target: &[S]) -> Result<(), TypeError> {
        self.check_mutable()?;
        let entry = self
            .fields
            .entry(F_REF.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(m) => {
                m.insert(name.to_string(), string_array(target));
                Ok(())
            }
            _ => Err(TypeError::field(F_REF, "expected a map of references")),
        }
    }

    /// Ids of objects deleted by this operation.
    pub fn deleted(&self) -> Vec<Vec<String>> {
        match self.fields.get(F_DELETE) {
            Some(Value::Array(items)) => items.iter().map(|v| string_list(Some(v))).collect(),
            _ => Vec::new(),
        }
    }

    pub fn add_deleted<S: AsRef<str>>(&mut self, id: &[S]) -> Result<(), TypeError> {
        self.check_mutable()?;
        let entry = self
            .fields
            .entry(F_DELETE.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => {
                items.push(string_array(id));
                Ok(())
            }
            _ => Err(TypeError::field(F_DELETE, "expected a list of ids")),
        }
    }

    pub fn created(&self) -> &[OpObject] {
        &self.created
    }

    pub fn edited(&self) -> &[OpObject] {
        &self.edited
    }

    pub fn has_created(&self) -> bool {
        !self.created.is_empty()
    }

    pub fn has_edited(&self) -> bool {
        !self.edited.is_empty()
    }

    pub fn add_created(&mut self, obj: OpObject) -> Result<(), TypeError> {
        self.check_mutable()?;
        self.created.push(obj);
        Ok(())
    }

    pub fn add_edited(&mut self, obj: OpObject) -> Result<(), TypeError> {
        self.check_mutable()?;
        self.edited.push(obj);
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str(F_NAME)
    }

    pub fn comment(&self) -> Option<&str> {
        self.get_str(F_COMMENT)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn put(&mut self, field: &str, value: Value) -> Result<(), TypeError> {
        self.check_mutable()?;
        self.fields.insert(field.to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, field: &str) -> Result<Option<Value>, TypeError> {
        self.check_mutable()?;
        Ok(self.fields.remove(field))
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Freeze the operation and every embedded object.
    pub fn make_immutable(&mut self) {
        self.immutable = true;
        for o in self.created.iter_mut().chain(self.edited.iter_mut()) {
            o.make_immutable();
        }
    }

    /// Mutable deep copy without the validation timestamp.
    pub fn mutable_copy(&self) -> Self {
        Self {
            op_type: self.op_type.clone(),
            fields: self.fields.clone(),
            created: self.created.iter().map(OpObject::mutable_copy).collect(),
            edited: self.edited.iter().map(OpObject::mutable_copy).collect(),
            immutable: false,
            validated_at: OnceLock::new(),
        }
    }

    /// Time (ms since epoch) this operation first passed validation.
    pub fn validated_at(&self) -> Option<i64> {
        self.validated_at.get().copied()
    }

    /// Record the validation time. Later calls keep the first value.
    pub fn mark_validated(&self, millis: i64) -> i64 {
        *self.validated_at.get_or_init(|| millis)
    }

    /// JSON form. With `exclude_hash_and_signature` set this is the exact
    /// input of the operation hash.
    pub fn to_value(&self, exclude_hash_and_signature: bool) -> Value {
        let mut map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if exclude_hash_and_signature {
            map.remove(F_HASH);
            map.remove(F_SIGNATURE);
        }
        map.insert(F_TYPE.to_string(), Value::String(self.op_type.clone()));
        if self.has_created() {
            map.insert(
                F_CREATE.to_string(),
                Value::Array(self.created.iter().map(OpObject::to_value).collect()),
            );
        }
        if self.has_edited() {
            map.insert(
                F_EDIT.to_string(),
                Value::Array(self.edited.iter().map(OpObject::to_value).collect()),
            );
        }
        Value::Object(map)
    }

    pub fn to_json(&self) -> String {
        json::canonical_json(&self.to_value(false))
    }

    pub fn from_value(value: Value) -> Result<Self, TypeError> {
        let mut map = json::into_map(value)
            .ok_or_else(|| TypeError::Serialization("operation must be a JSON map".into()))?;
        let op_type = match map.remove(F_TYPE) {
            Some(Value::String(s)) => s,
            Some(other) => json::value_to_string(&other),
            None => String::new(),
        };
        let created = take_objects(&mut map, F_CREATE)?;
        let edited = take_objects(&mut map, F_EDIT)?;
        map.remove(F_EVAL);
        Ok(Self {
            op_type,
            fields: map.into_iter().collect(),
            created,
            edited,
            immutable: false,
            validated_at: OnceLock::new(),
        })
    }

    pub fn from_json(text: &str) -> Result<Self, TypeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| TypeError::Serialization(e.to_string()))?;
        Self::from_value(value)
    }

    fn check_mutable(&self) -> Result<(), TypeError> {
        if self.immutable {
            Err(TypeError::Immutable)
        } else {
            Ok(())
        }
    }
}

fn take_objects(map: &mut Map<String, Value>, field: &str) -> Result<Vec<OpObject>, TypeError> {
    match map.remove(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.into_iter().map(OpObject::from_value).collect(),
        Some(_) => Err(TypeError::field(field, "expected a list of objects")),
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.op_type == other.op_type
            && self.fields == other.fields
            && self.created == other.created
            && self.edited == other.edited
    }
}

impl Eq for Operation {}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("type", &self.op_type)
            .field("hash", &self.hash())
            .field("created", &self.created.len())
            .field("edited", &self.edited.len())
            .field("deleted", &self.deleted().len())
            .finish()
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value(false).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signup() -> Operation {
        Operation::from_value(json!({
            "type": "sys.signup",
            "signed_by": "alice",
            "hash": "json:sha256:abcd",
            "signature": "ECDSA:base64:xyz",
            "create": [{"id": ["alice"], "algo": "EC"}],
        }))
        .unwrap()
    }

    #[test]
    fn parses_structural_fields() {
        let op = signup();
        assert_eq!(op.op_type(), "sys.signup");
        assert_eq!(op.created().len(), 1);
        assert_eq!(op.created()[0].id(), vec!["alice"]);
        assert_eq!(op.raw_hash(), "abcd");
        assert_eq!(op.signed_by(), vec!["alice"]);
        assert_eq!(op.signatures(), vec!["ECDSA:base64:xyz"]);
    }

    #[test]
    fn hash_input_excludes_hash_and_signature() {
        let v = signup().to_value(true);
        assert!(v.get(F_HASH).is_none());
        assert!(v.get(F_SIGNATURE).is_none());
        assert_eq!(v[F_TYPE], json!("sys.signup"));
        assert!(v.get(F_EDIT).is_none());
    }

    #[test]
    fn refs_and_deletes() {
        let mut op = Operation::new("sys.grant");
        op.set_ref("role", &["sys.role", "admin"]).unwrap();
        op.add_deleted(&["alice"]).unwrap();
        op.add_deleted(&["bob", "web"]).unwrap();
        assert_eq!(op.refs()["role"], vec!["sys.role", "admin"]);
        assert_eq!(op.deleted(), vec![vec!["alice".to_string()], vec!["bob".into(), "web".into()]]);
    }

    #[test]
    fn co_signers_become_a_list() {
        let mut op = Operation::new("x");
        op.set_signed_by("a").unwrap();
        op.add_other_signed_by("b").unwrap();
        assert_eq!(op.get(F_SIGNED_BY), Some(&json!(["a", "b"])));
    }

    #[test]
    fn immutable_freezes_objects() {
        let mut op = signup();
        op.make_immutable();
        assert!(op.created()[0].is_immutable());
        assert_eq!(op.put("x", json!(1)), Err(TypeError::Immutable));
        assert!(op.mutable_copy().put("x", json!(1)).is_ok());
    }

    #[test]
    fn validation_time_is_set_once() {
        let op = signup();
        assert_eq!(op.validated_at(), None);
        assert_eq!(op.mark_validated(10), 10);
        assert_eq!(op.mark_validated(20), 10);
    }

    #[test]
    fn json_text_roundtrip() {
        let op = signup();
        let back = Operation::from_json(&op.to_json()).unwrap();
        assert_eq!(back, op);
    }
}

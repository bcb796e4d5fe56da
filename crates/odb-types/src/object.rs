//! Typed JSON objects stored under a compound key.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::TypeError;
use crate::json::{self, string_array, string_list};

pub const F_ID: &str = "id";
pub const F_COMMENT: &str = "comment";
pub const F_CHANGE: &str = "change";
pub const F_CURRENT: &str = "current";
pub const F_EVAL: &str = "eval";
pub const F_NAME: &str = "name";
pub const F_STATE: &str = "state";

/// A JSON object living in the database.
///
/// The `id` field (a list of up to five strings) determines its
/// [`CompoundKey`](crate::CompoundKey). The parent operation (type and raw
/// hash) is attached when the object is created or edited by an operation
/// and is not part of the serialized form. Equality compares fields only.
#[derive(Clone, Default)]
pub struct OpObject {
    fields: BTreeMap<String, Value>,
    parent_type: Option<String>,
    parent_hash: Option<String>,
    immutable: bool,
}

impl OpObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Object with the given id and no other fields.
    pub fn with_id<S: AsRef<str>>(id: &[S]) -> Self {
        let mut obj = Self::new();
        obj.fields.insert(F_ID.to_string(), string_array(id));
        obj
    }

    /// Build from a JSON object. The transient `eval` field is dropped.
    pub fn from_value(value: Value) -> Result<Self, TypeError> {
        let map = json::into_map(value)
            .ok_or_else(|| TypeError::Serialization("object must be a JSON map".into()))?;
        let mut fields: BTreeMap<String, Value> = map.into_iter().collect();
        fields.remove(F_EVAL);
        Ok(Self {
            fields,
            ..Self::default()
        })
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn id(&self) -> Vec<String> {
        string_list(self.fields.get(F_ID))
    }

    pub fn set_id<S: AsRef<str>>(&mut self, id: &[S]) -> Result<(), TypeError> {
        self.put(F_ID, string_array(id))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn get_string_list(&self, field: &str) -> Vec<String> {
        string_list(self.fields.get(field))
    }

    /// A field holding `{name: [..]}`, read as a map of string lists.
    pub fn get_string_list_map(&self, field: &str) -> BTreeMap<String, Vec<String>> {
        match self.fields.get(field) {
            Some(Value::Object(m)) => m
                .iter()
                .map(|(k, v)| (k.clone(), string_list(Some(v))))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        let v = self.fields.get(field)?;
        v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
    }

    pub fn put(&mut self, field: &str, value: Value) -> Result<(), TypeError> {
        self.check_mutable()?;
        self.fields.insert(field.to_string(), value);
        Ok(())
    }

    pub fn put_str(&mut self, field: &str, value: &str) -> Result<(), TypeError> {
        self.put(field, Value::String(value.to_string()))
    }

    pub fn remove(&mut self, field: &str) -> Result<Option<Value>, TypeError> {
        self.check_mutable()?;
        Ok(self.fields.remove(field))
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub fn make_immutable(&mut self) {
        self.immutable = true;
    }

    /// Mutable copy of this object. Parent operation links are kept.
    pub fn mutable_copy(&self) -> Self {
        Self {
            immutable: false,
            ..self.clone()
        }
    }

    pub fn parent_type(&self) -> Option<&str> {
        self.parent_type.as_deref()
    }

    pub fn parent_hash(&self) -> Option<&str> {
        self.parent_hash.as_deref()
    }

    /// Attach the operation that created or last edited this object.
    pub fn with_parent_op(mut self, op_type: &str, raw_hash: &str) -> Self {
        self.parent_type = Some(op_type.to_string());
        self.parent_hash = Some(raw_hash.to_string());
        self
    }

    /// `change` section of an edit entry.
    pub fn change_fields(&self) -> Map<String, Value> {
        match self.fields.get(F_CHANGE) {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        }
    }

    /// `current` section of an edit entry.
    pub fn current_fields(&self) -> Map<String, Value> {
        match self.fields.get(F_CURRENT) {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        }
    }

    /// Resolve a dotted path such as `tags.v` or `source.osm[0].changeset`.
    ///
    /// Numeric segments index into lists. Missing intermediate values and
    /// out-of-range indexes resolve to `None`.
    pub fn field_by_path(&self, path: &str) -> Option<&Value> {
        let segments = parse_path(path).ok()?;
        let (first, rest) = segments.split_first()?;
        let mut cur = match first {
            PathSeg::Key(k) => self.fields.get(k)?,
            PathSeg::Index(_) => return None,
        };
        for seg in rest {
            cur = match (cur, seg) {
                (Value::Object(m), PathSeg::Key(k)) => m.get(k)?,
                (Value::Array(items), seg) => items.get(seg.as_index()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Set (or with `None`, remove) the value at a dotted path.
    ///
    /// Missing intermediate maps are created when setting. Traversing into a
    /// scalar or past the end of a list is an error.
    pub fn set_field_by_path(&mut self, path: &str, value: Option<Value>) -> Result<(), TypeError> {
        self.check_mutable()?;
        let segments = parse_path(path)?;
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| TypeError::path(path, "empty path"))?;
        let PathSeg::Key(first) = first else {
            return Err(TypeError::path(path, "path must start with a field name"));
        };
        if rest.is_empty() {
            match value {
                Some(v) => self.fields.insert(first.clone(), v),
                None => self.fields.remove(first),
            };
            return Ok(());
        }
        if !self.fields.contains_key(first) {
            if value.is_none() {
                return Ok(());
            }
            self.fields.insert(first.clone(), Value::Object(Map::new()));
        }
        let root = self
            .fields
            .get_mut(first)
            .ok_or_else(|| TypeError::path(path, "missing root field"))?;
        set_in_value(root, rest, value, path)
    }

    fn check_mutable(&self) -> Result<(), TypeError> {
        if self.immutable {
            Err(TypeError::Immutable)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSeg {
    Key(String),
    Index(usize),
}

impl PathSeg {
    fn as_index(&self) -> Option<usize> {
        match self {
            PathSeg::Index(i) => Some(*i),
            PathSeg::Key(k) => k.parse().ok(),
        }
    }
}

fn parse_path(path: &str) -> Result<Vec<PathSeg>, TypeError> {
    let mut out = Vec::new();
    for part in path.split('.') {
        let (name, mut brackets) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !name.is_empty() {
            out.push(PathSeg::Key(name.to_string()));
        } else if brackets.is_empty() {
            return Err(TypeError::path(path, "empty segment"));
        }
        while !brackets.is_empty() {
            let close = brackets
                .find(']')
                .filter(|_| brackets.starts_with('['))
                .ok_or_else(|| TypeError::path(path, "unbalanced brackets"))?;
            let idx = brackets[1..close]
                .parse::<usize>()
                .map_err(|_| TypeError::path(path, "list index is not a number"))?;
            out.push(PathSeg::Index(idx));
            brackets = &brackets[close + 1..];
        }
    }
    Ok(out)
}

fn set_in_value(
    target: &mut Value,
    segments: &[PathSeg],
    value: Option<Value>,
    path: &str,
) -> Result<(), TypeError> {
    let Some((seg, rest)) = segments.split_first() else {
        return Err(TypeError::path(path, "empty path"));
    };
    match target {
        Value::Object(m) => {
            let PathSeg::Key(key) = seg else {
                return Err(TypeError::path(path, "list index applied to a map"));
            };
            if rest.is_empty() {
                match value {
                    Some(v) => m.insert(key.clone(), v),
                    None => m.remove(key),
                };
                return Ok(());
            }
            if !m.contains_key(key) {
                if value.is_none() {
                    return Ok(());
                }
                m.insert(key.clone(), Value::Object(Map::new()));
            }
            match m.get_mut(key) {
                Some(child) => set_in_value(child, rest, value, path),
                None => Err(TypeError::path(path, "missing intermediate field")),
            }
        }
        Value::Array(items) => {
            let idx = seg
                .as_index()
                .ok_or_else(|| TypeError::path(path, "list index is not a number"))?;
            if idx >= items.len() {
                return Err(TypeError::path(
                    path,
                    format!("index {idx} out of bounds for length {}", items.len()),
                ));
            }
            if rest.is_empty() {
                match value {
                    Some(v) => items[idx] = v,
                    None => {
                        items.remove(idx);
                    }
                }
                return Ok(());
            }
            set_in_value(&mut items[idx], rest, value, path)
        }
        _ => Err(TypeError::path(path, "cannot descend into a scalar value")),
    }
}

impl PartialEq for OpObject {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for OpObject {}

impl fmt::Debug for OpObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpObject")
            .field("id", &self.id())
            .field("fields", &self.fields.len())
            .field("parent_hash", &self.parent_hash)
            .finish()
    }
}

impl fmt::Display for OpObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", json::canonical_json(&self.to_value()))
    }
}

impl Serialize for OpObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OpObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

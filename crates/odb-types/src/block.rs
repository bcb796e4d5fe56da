//! Blocks: ordered, hashed and signed batches of operations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::TypeError;
use crate::hash::raw_hash;
use crate::json;
use crate::operation::Operation;

pub const F_HASH: &str = "hash";
pub const F_BLOCK_ID: &str = "block_id";
pub const F_VERSION: &str = "version";
pub const F_DATE: &str = "date";
pub const F_EXTRA: &str = "extra";
pub const F_DETAILS: &str = "details";
pub const F_SIGNED_BY: &str = "signed_by";
pub const F_SIGNATURE: &str = "signature";
pub const F_PREV_BLOCK_HASH: &str = "previous_block_hash";
pub const F_MERKLE_TREE_HASH: &str = "merkle_tree_hash";
pub const F_SIG_MERKLE_TREE_HASH: &str = "sig_merkle_tree_hash";
pub const F_OPERATIONS: &str = "ops";

/// Block date layout, always rendered in UTC (`2019-01-01T00:00:00.000+0000`).
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// Format milliseconds since the epoch in [`DATE_FORMAT`].
pub fn format_date(millis: i64) -> Result<String, TypeError> {
    let dt = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| TypeError::InvalidDate(millis.to_string()))?;
    Ok(dt.format(DATE_FORMAT).to_string())
}

/// Parse a [`DATE_FORMAT`] string into milliseconds since the epoch.
pub fn parse_date(text: &str) -> Result<i64, TypeError> {
    DateTime::parse_from_str(text, DATE_FORMAT)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| TypeError::InvalidDate(text.to_string()))
}

#[derive(Clone, Default)]
pub struct Block {
    fields: BTreeMap<String, Value>,
    operations: Vec<Arc<Operation>>,
    immutable: bool,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the block fields without operations.
    pub fn header(&self) -> Block {
        Block {
            fields: self.fields.clone(),
            operations: Vec::new(),
            immutable: self.immutable,
        }
    }

    pub fn block_id(&self) -> i64 {
        self.get_i64(F_BLOCK_ID).unwrap_or(-1)
    }

    /// `sha256:<hex>`, or `""` when not hashed yet.
    pub fn full_hash(&self) -> &str {
        self.get_str(F_HASH).unwrap_or("")
    }

    pub fn raw_hash(&self) -> &str {
        raw_hash(self.full_hash())
    }

    pub fn prev_block_hash(&self) -> &str {
        self.get_str(F_PREV_BLOCK_HASH).unwrap_or("")
    }

    pub fn signature(&self) -> Option<&str> {
        self.get_str(F_SIGNATURE)
    }

    pub fn signed_by(&self) -> Option<&str> {
        self.get_str(F_SIGNED_BY)
    }

    pub fn merkle_tree_hash(&self) -> &str {
        self.get_str(F_MERKLE_TREE_HASH).unwrap_or("")
    }

    pub fn sig_merkle_tree_hash(&self) -> &str {
        self.get_str(F_SIG_MERKLE_TREE_HASH).unwrap_or("")
    }

    pub fn version(&self) -> i64 {
        self.get_i64(F_VERSION).unwrap_or(0)
    }

    pub fn extra(&self) -> i64 {
        self.get_i64(F_EXTRA).unwrap_or(0)
    }

    pub fn details(&self) -> &str {
        self.get_str(F_DETAILS).unwrap_or("")
    }

    pub fn date_string(&self) -> Option<&str> {
        self.get_str(F_DATE)
    }

    /// Block date in ms. Missing or malformed dates read as 0.
    pub fn date_millis(&self) -> i64 {
        self.date_string()
            .and_then(|d| parse_date(d).ok())
            .unwrap_or(0)
    }

    pub fn set_date(&mut self, millis: i64) -> Result<(), TypeError> {
        let text = format_date(millis)?;
        self.put(F_DATE, Value::String(text))
    }

    pub fn operations(&self) -> &[Arc<Operation>] {
        &self.operations
    }

    pub fn push_operation(&mut self, op: Arc<Operation>) -> Result<(), TypeError> {
        self.check_mutable()?;
        self.operations.push(op);
        Ok(())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
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

    pub fn to_value(&self) -> Value {
        let mut map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert(
            F_OPERATIONS.to_string(),
            Value::Array(self.operations.iter().map(|o| o.to_value(false)).collect()),
        );
        Value::Object(map)
    }

    pub fn from_value(value: Value) -> Result<Self, TypeError> {
        let mut map = json::into_map(value)
            .ok_or_else(|| TypeError::Serialization("block must be a JSON map".into()))?;
        let operations = match map.remove(F_OPERATIONS) {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| {
                    let mut op = Operation::from_value(v)?;
                    op.make_immutable();
                    Ok(Arc::new(op))
                })
                .collect::<Result<Vec<_>, TypeError>>()?,
            _ => Vec::new(),
        };
        Ok(Self {
            fields: map.into_iter().collect(),
            operations,
            immutable: false,
        })
    }

    fn check_mutable(&self) -> Result<(), TypeError> {
        if self.immutable {
            Err(TypeError::Immutable)
        } else {
            Ok(())
        }
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields && self.operations == other.operations
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("block_id", &self.block_id())
            .field("hash", &self.full_hash())
            .field("ops", &self.operations.len())
            .finish()
    }
}

impl Serialize for Block {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Block {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

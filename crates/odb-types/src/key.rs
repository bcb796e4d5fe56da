use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Maximum number of parts an object id may have.
pub const MAX_KEY_ARITY: usize = 5;

/// Tuple of up to five strings derived from an object's `id` list.
///
/// Used as the key of every per-type object map. Ordering is lexicographic
/// over the parts, so a `BTreeMap<CompoundKey, _>` iterates deterministically.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompoundKey(Vec<String>);

impl CompoundKey {
    /// Build a key from id parts, rejecting empty ids and ids longer than
    /// [`MAX_KEY_ARITY`].
    pub fn new<I, S>(parts: I) -> Result<Self, TypeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.is_empty() || parts.len() > MAX_KEY_ARITY {
            return Err(TypeError::InvalidKeyArity {
                max: MAX_KEY_ARITY,
                actual: parts.len(),
            });
        }
        Ok(Self(parts))
    }

    /// Key with a primary and an optional secondary part (`name`, `name:site`).
    pub fn primary(primary: &str, secondary: Option<&str>) -> Self {
        let mut parts = vec![primary.to_string()];
        if let Some(s) = secondary {
            parts.push(s.to_string());
        }
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn first(&self) -> &str {
        &self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_parts(self) -> Vec<String> {
        self.0
    }
}

impl fmt::Debug for CompoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompoundKey({})", self.0.join(","))
    }
}

impl fmt::Display for CompoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl TryFrom<&[String]> for CompoundKey {
    type Error = TypeError;

    fn try_from(parts: &[String]) -> Result<Self, Self::Error> {
        Self::new(parts.iter().cloned())
    }
}

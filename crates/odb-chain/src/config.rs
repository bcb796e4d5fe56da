use serde::{Deserialize, Serialize};

/// Tuning of the chain layers above the rules engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Weight of the child layer's size when deciding whether a layer is
    /// merged into its parent during compaction.
    pub compact_coefficient: f64,
    /// Blocks an in-memory superblock may hold before it is worth
    /// persisting.
    pub superblock_size_to_persist: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            compact_coefficient: 1.0,
            superblock_size_to_persist: 32,
        }
    }
}

impl ChainConfig {
    /// Whether a layer of `size` blocks should be merged into a parent of
    /// `parent_size` blocks, given the size of the layer above it.
    pub fn should_merge(&self, size: usize, prev_size: usize, parent_size: usize) -> bool {
        size as f64 + self.compact_coefficient * prev_size as f64 > parent_size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ChainConfig::default();
        assert_eq!(c.compact_coefficient, 1.0);
        assert_eq!(c.superblock_size_to_persist, 32);
    }

    #[test]
    fn merge_boundary() {
        let c = ChainConfig::default();
        assert!(!c.should_merge(3, 7, 10));
        assert!(c.should_merge(3, 8, 10));
        let doubled = ChainConfig {
            compact_coefficient: 2.0,
            ..ChainConfig::default()
        };
        assert!(doubled.should_merge(3, 4, 10));
        assert!(!ChainConfig::default().should_merge(3, 4, 10));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let c: ChainConfig = serde_json::from_str(r#"{"compact_coefficient": 2.5}"#).unwrap();
        assert_eq!(c.compact_coefficient, 2.5);
        assert_eq!(c.superblock_size_to_persist, 32);
    }
}

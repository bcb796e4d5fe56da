use serde::{Deserialize, Serialize};

use crate::hasher::ContentHasher;

/// Side of a sibling in a merkle proof path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// Binary SHA-256 merkle tree over arbitrary byte leaves.
///
/// Pairs are hashed as `sha256(left || right)`; an odd trailing node is
/// paired with itself. A single leaf is the root as is, without hashing.
/// Blocks use two of these: one over operation hash bytes and one over
/// concatenated signature bytes.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// Level 0 = leaves, last level = root.
    levels: Vec<Vec<Vec<u8>>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: Vec<Vec<u8>>) -> Self {
        if leaves.is_empty() {
            return Self { levels: vec![] };
        }

        let hasher = ContentHasher::SHA256;
        let mut levels = vec![leaves];
        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let next: Vec<Vec<u8>> = current
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).unwrap_or(&pair[0]);
                    hasher.digest_pair(&pair[0], right).to_vec()
                })
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    /// Root bytes, `None` for an empty tree.
    pub fn root(&self) -> Option<&[u8]> {
        self.levels.last().map(|l| l[0].as_slice())
    }

    /// Root as `sha256:hex`, or `""` for an empty tree.
    pub fn root_hash(&self) -> String {
        match self.root() {
            Some(r) => ContentHasher::SHA256.format(r),
            None => String::new(),
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        let leaves = self.levels.first()?;
        let leaf = leaves.get(index)?.clone();

        let mut path = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling_idx, side) = if idx % 2 == 0 {
                (idx + 1, Side::Right)
            } else {
                (idx - 1, Side::Left)
            };
            let sibling = level.get(sibling_idx).unwrap_or(&level[idx]).clone();
            path.push((sibling, side));
            idx /= 2;
        }

        Some(MerkleProof {
            leaf,
            path,
            root: self.root()?.to_vec(),
        })
    }
}

/// Merkle inclusion proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf: Vec<u8>,
    /// (sibling, sibling side) pairs from leaf to root.
    pub path: Vec<(Vec<u8>, Side)>,
    pub root: Vec<u8>,
}

impl MerkleProof {
    /// Recompute the root from the leaf and path.
    pub fn verify(&self) -> bool {
        let hasher = ContentHasher::SHA256;
        let mut current = self.leaf.clone();
        for (sibling, side) in &self.path {
            current = match side {
                Side::Left => hasher.digest_pair(sibling, &current),
                Side::Right => hasher.digest_pair(&current, sibling),
            }
            .to_vec();
        }
        current == self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf(seed: u8) -> Vec<u8> {
        ContentHasher::SHA256.digest(&[seed]).to_vec()
    }

    #[test]
    fn empty_tree_has_empty_root() {
        let tree = MerkleTree::from_leaves(vec![]);
        assert!(tree.root().is_none());
        assert_eq!(tree.root_hash(), "");
        assert_eq!(tree.leaf_count(), 0);
        assert!(tree.proof(0).is_none());
    }

    #[test]
    fn single_leaf_is_root_unhashed() {
        let l = vec![0xab, 0xcd];
        let tree = MerkleTree::from_leaves(vec![l.clone()]);
        assert_eq!(tree.root(), Some(l.as_slice()));
        assert_eq!(tree.root_hash(), "sha256:abcd");
    }

    #[test]
    fn odd_node_pairs_with_itself() {
        let h = ContentHasher::SHA256;
        let tree = MerkleTree::from_leaves(vec![leaf(1), leaf(2), leaf(3)]);
        let left = h.digest_pair(&leaf(1), &leaf(2));
        let right = h.digest_pair(&leaf(3), &leaf(3));
        let root = h.digest_pair(&left, &right);
        assert_eq!(tree.root(), Some(root.as_slice()));
    }

    #[test]
    fn proof_verifies_for_all_leaves() {
        let leaves: Vec<Vec<u8>> = (0..7).map(leaf).collect();
        let tree = MerkleTree::from_leaves(leaves.clone());
        for (i, l) in leaves.iter().enumerate() {
            let proof = tree.proof(i).unwrap();
            assert_eq!(&proof.leaf, l);
            assert!(proof.verify(), "proof for leaf {i} should verify");
        }
        assert!(tree.proof(7).is_none());
    }

    #[test]
    fn power_of_two_proof_length() {
        let tree = MerkleTree::from_leaves((0..8).map(leaf).collect());
        for i in 0..8 {
            assert_eq!(tree.proof(i).unwrap().path.len(), 3);
        }
    }

    #[test]
    fn proof_serde_roundtrip() {
        let tree = MerkleTree::from_leaves((0..4).map(leaf).collect());
        let proof = tree.proof(2).unwrap();
        let json = serde_json::to_string(&proof).unwrap();
        let parsed: MerkleProof = serde_json::from_str(&json).unwrap();
        assert_eq!(proof, parsed);
        assert!(parsed.verify());
    }

    proptest! {
        #[test]
        fn tampered_leaf_fails(n in 2usize..20, pick in 0usize..20, flip in any::<u8>()) {
            let idx = pick % n;
            let tree = MerkleTree::from_leaves((0..n as u8).map(leaf).collect());
            let mut proof = tree.proof(idx).unwrap();
            proof.leaf[0] ^= flip | 1;
            prop_assert!(!proof.verify());
        }
    }
}

//! Merkle proofs of transaction inclusion in a block
//!
//! Commit records carry finalizer transactions without the rest of the block.
//! Each one comes with a proof against `BlockHeader::tx_root`, so a syncing
//! peer can check that the votes and deposits it replays were really mined.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::types::{Hash, ZERO_HASH};

/// Proof that a leaf is included under a root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: u64,
    /// Authentication path, leaf level first
    pub siblings: Vec<Hash>,
    /// true = sibling is on the right
    pub directions: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// leaves first, root last
    levels: Vec<Vec<Hash>>,
    leaf_count: usize,
}

// ============================================================================
// CONSTANTS
// ============================================================================

/// Blocks never carry enough transactions to exceed this depth
pub const MAX_PROOF_DEPTH: usize = 32;

pub const MERKLE_PREFIX: &[u8] = b"ESPERANZA_TX_MERKLE_V1:";

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl MerkleTree {
    pub fn new(leaves: Vec<Hash>) -> Self {
        let leaf_count = leaves.len();
        let mut levels = vec![leaves];

        while levels.last().map_or(0, Vec::len) > 1 {
            let next = levels
                .last()
                .map(|level| Self::build_next_level(level))
                .unwrap_or_default();
            levels.push(next);
        }

        Self { levels, leaf_count }
    }

    /// Tree root; an empty tree gives the zero hash
    pub fn root(&self) -> Hash {
        if self.leaf_count == 0 {
            return ZERO_HASH;
        }
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or(ZERO_HASH)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.leaf_count {
            return None;
        }

        let mut siblings = Vec::new();
        let mut directions = Vec::new();
        let mut index = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if index % 2 == 0 { index + 1 } else { index - 1 };
            // odd node promoted without a sibling
            if sibling < level.len() {
                siblings.push(level[sibling]);
                directions.push(index % 2 == 0);
            }
            index /= 2;
        }

        Some(MerkleProof {
            leaf_index: leaf_index as u64,
            siblings,
            directions,
        })
    }

    pub fn proof_by_hash(&self, leaf: &Hash) -> Option<MerkleProof> {
        let index = self.levels.first()?.iter().position(|h| h == leaf)?;
        self.proof(index)
    }

    fn build_next_level(level: &[Hash]) -> Vec<Hash> {
        level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => *single,
                _ => ZERO_HASH,
            })
            .collect()
    }
}

impl MerkleProof {
    pub fn verify(&self, leaf: Hash, root: Hash) -> bool {
        if self.siblings.len() != self.directions.len() || self.siblings.len() > MAX_PROOF_DEPTH {
            return false;
        }

        let computed = self
            .siblings
            .iter()
            .zip(&self.directions)
            .fold(leaf, |acc, (sibling, &right)| {
                if right {
                    hash_pair(&acc, sibling)
                } else {
                    hash_pair(sibling, &acc)
                }
            });

        computed == root
    }
}

/// Hash of a node pair, smaller hash on the left
fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let (a, b) = if left <= right { (left, right) } else { (right, left) };
    let mut hasher = Sha3_256::new();
    hasher.update(MERKLE_PREFIX);
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

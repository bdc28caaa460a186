//! Fixed-width block Merkle tree.
//!
//! Every file is split into 64 KiB blocks and every block into
//! [`MERKLE_LEAVES`] fragments of [`FRAGMENT_SIZE`] bytes. Leaf `i` is the
//! SHA3-256 of fragment `i` of every block, concatenated in file order, so a
//! challenge on leaf `i` touches one fragment per block instead of the whole
//! file. Interior nodes hash the concatenated hex of their two children; an
//! odd level pairs its last node with itself.

use crate::config::{CHUNK_SIZE, FRAGMENT_SIZE, MERKLE_LEAVES};
use crate::hash::hash_str;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

/// Leaf index a file offset contributes to.
pub fn leaf_index(offset: u64) -> usize {
    (offset % CHUNK_SIZE as u64) as usize / FRAGMENT_SIZE
}

/// Incremental leaf builder. Input may be split at arbitrary boundaries.
#[derive(Clone)]
pub struct LeafHasher {
    leaves: Vec<Sha3_256>,
    offset: u64,
}

impl Default for LeafHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl LeafHasher {
    pub fn new() -> Self {
        Self {
            leaves: vec![Sha3_256::new(); MERKLE_LEAVES],
            offset: 0,
        }
    }

    /// Feed the next bytes of the file.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let within = (self.offset % FRAGMENT_SIZE as u64) as usize;
            let take = (FRAGMENT_SIZE - within).min(data.len());
            self.leaves[leaf_index(self.offset)].update(&data[..take]);
            self.offset += take as u64;
            data = &data[take..];
        }
    }

    /// Bytes consumed so far.
    pub fn len(&self) -> u64 {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    pub fn finalize(self) -> MerkleTree {
        let leaves = self
            .leaves
            .into_iter()
            .map(|h| hex::encode(h.finalize()))
            .collect();
        MerkleTree::from_leaves(leaves)
    }
}

/// A complete tree; `levels[0]` are the leaves, the last level is the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    /// Build a tree over hex leaf hashes.
    pub fn from_leaves(leaves: Vec<String>) -> Self {
        let mut levels = vec![leaves];
        while let Some(level) = levels.last()
            && level.len() > 1
        {
            let next = level
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).unwrap_or(&pair[0]);
                    hash_str(&format!("{}{}", pair[0], right))
                })
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    /// Build the tree of an in-memory byte buffer.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = LeafHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn root(&self) -> String {
        self.levels
            .last()
            .and_then(|level| level.first())
            .cloned()
            .unwrap_or_default()
    }

    pub fn leaves(&self) -> &[String] {
        &self.levels[0]
    }

    /// Sibling path from a leaf to the root. `None` if the index is out of range.
    pub fn path(&self, leaf_index: usize) -> Option<MerklePath> {
        if leaf_index >= self.levels[0].len() {
            return None;
        }

        let mut nodes = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut idx = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if idx % 2 == 0 {
                level.get(idx + 1).unwrap_or(&level[idx])
            } else {
                &level[idx - 1]
            };
            nodes.push(sibling.clone());
            idx /= 2;
        }

        Some(MerklePath { nodes, leaf_index })
    }
}

/// Proof that a leaf belongs to a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerklePath {
    pub nodes: Vec<String>,
    pub leaf_index: usize,
}

impl MerklePath {
    pub fn compute_root(&self, leaf_hash: &str) -> String {
        let mut hash = leaf_hash.to_string();
        let mut idx = self.leaf_index;
        for sibling in &self.nodes {
            hash = if idx % 2 == 0 {
                hash_str(&format!("{}{}", hash, sibling))
            } else {
                hash_str(&format!("{}{}", sibling, hash))
            };
            idx /= 2;
        }
        hash
    }

    pub fn verify(&self, leaf_hash: &str, root: &str) -> bool {
        self.compute_root(leaf_hash) == root
    }
}

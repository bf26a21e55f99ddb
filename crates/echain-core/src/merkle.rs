//! Double SHA-256 Merkle tree for transaction commitment.
//!
//! Leaves are used as given (callers pass [`Transaction::merkle_leaf`]
//! values). Internal nodes are `double_sha256(left || right)`. Odd-length
//! layers pair the last element with itself. Empty trees produce
//! [`Hash256::ZERO`].
//!
//! [`Transaction::merkle_leaf`]: crate::types::Transaction::merkle_leaf

use serde::{Deserialize, Serialize};

use crate::crypto::double_sha256;
use crate::types::Hash256;

/// Internal node hash: `double_sha256(left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    double_sha256(&data)
}

/// Merkle root of `leaves` without keeping the intermediate layers.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }

    let mut current = leaves.to_vec();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    current[0]
}

fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    layer
        .chunks(2)
        .map(|pair| node_hash(&pair[0], pair.get(1).unwrap_or(&pair[0])))
        .collect()
}

/// Full Merkle tree supporting proof generation.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// `layers[0]` = leaves, `layers[last]` = `[root]`.
    layers: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: &[Hash256]) -> Self {
        if leaves.is_empty() {
            return Self { layers: Vec::new() };
        }

        let mut layers = vec![leaves.to_vec()];
        loop {
            let top = &layers[layers.len() - 1];
            if top.len() <= 1 {
                break;
            }
            let next = next_layer(top);
            layers.push(next);
        }
        Self { layers }
    }

    pub fn root(&self) -> Hash256 {
        self.layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(Hash256::ZERO)
    }

    pub fn leaf_count(&self) -> usize {
        self.layers.first().map_or(0, Vec::len)
    }

    /// Inclusion proof for the leaf at `index`, or `None` if out of bounds.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        let leaf = *self.layers.first()?.get(index)?;

        let mut path = Vec::with_capacity(self.layers.len().saturating_sub(1));
        let mut pos = index;
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling = layer.get(pos ^ 1).copied().unwrap_or(layer[pos]);
            let side = if pos % 2 == 0 { Side::Right } else { Side::Left };
            path.push(ProofStep { hash: sibling, side });
            pos /= 2;
        }

        Some(MerkleProof {
            leaf_index: index as u32,
            leaf,
            path,
        })
    }
}

/// Which side a sibling hash is on relative to the current node.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum Side {
    Left,
    Right,
}

/// One sibling on the path from a leaf to the root.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ProofStep {
    pub hash: Hash256,
    pub side: Side,
}

/// Merkle inclusion proof for a single leaf, siblings ordered leaf to root.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct MerkleProof {
    pub leaf_index: u32,
    pub leaf: Hash256,
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    pub fn verify(&self, expected_root: &Hash256) -> bool {
        verify_merkle_proof(&self.leaf, &self.path, expected_root)
    }
}

/// Fold `path` over `leaf` and compare with `expected_root`.
pub fn verify_merkle_proof(leaf: &Hash256, path: &[ProofStep], expected_root: &Hash256) -> bool {
    let computed = path.iter().fold(*leaf, |current, step| match step.side {
        Side::Left => node_hash(&step.hash, &current),
        Side::Right => node_hash(&current, &step.hash),
    });
    computed == *expected_root
}

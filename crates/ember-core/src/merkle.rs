//! Transaction commitment tree.
//!
//! Binary hash tree over transaction IDs using BLAKE3 key derivation for
//! domain separation: leaves and interior nodes are hashed under distinct
//! derivation contexts, so no interior node can be reinterpreted as a
//! leaf (or vice versa). A layer with an odd element count promotes its
//! last node unchanged instead of pairing it with itself; a block whose
//! tail transaction is duplicated therefore commits to a different root
//! than the original, and the classic duplicate-leaf mutation has no
//! second preimage.
//!
//! An empty tree commits to [`Hash256::ZERO`].

use crate::types::Hash256;

/// Derivation context for leaf hashes.
const LEAF_CONTEXT: &str = "ember-core 2025 merkle leaf v1";

/// Derivation context for interior node hashes.
const NODE_CONTEXT: &str = "ember-core 2025 merkle node v1";

/// Hash a leaf value into the tree's leaf domain.
pub fn leaf_hash(leaf: &Hash256) -> Hash256 {
    Hash256(blake3::derive_key(LEAF_CONTEXT, leaf.as_bytes()))
}

/// Hash two child nodes into an interior node.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut material = [0u8; 64];
    material[..32].copy_from_slice(left.as_bytes());
    material[32..].copy_from_slice(right.as_bytes());
    Hash256(blake3::derive_key(NODE_CONTEXT, &material))
}

/// Commit to an ordered list of values (typically transaction IDs).
///
/// Returns [`Hash256::ZERO`] for an empty list.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }

    let mut layer: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => node_hash(left, right),
                // Odd tail: carried up as-is.
                [lone] => *lone,
                _ => unreachable!("chunks(2) yields one or two elements"),
            })
            .collect();
    }
    layer[0]
}

//! Dynamic-memory accounting for pool bookkeeping.
//!
//! These are deliberate estimates, not allocator truth: the pool needs a
//! number that moves in proportion to real usage and is cheap to maintain
//! incrementally. The per-node constants approximate a B-tree set node
//! plus its key.

use ember_core::types::Transaction;

/// Estimated heap cost of one element in a parent/child link set.
pub const LINK_NODE_USAGE: u64 = 32 + 48;

/// Estimated per-entry overhead of the primary map and the three ordered
/// indices (slot, hash, and three score keys).
pub const INDEX_OVERHEAD_PER_ENTRY: u64 = 9 * 8 + 3 * 56;

/// Estimated heap cost of one spend-map element.
pub const NEXT_TX_NODE_USAGE: u64 = 36 + 36 + 48;

/// Estimated heap cost of one prioritisation-map element.
pub const DELTA_NODE_USAGE: u64 = 32 + 16 + 48;

/// Estimated heap usage of a transaction's own allocations.
pub fn tx_usage(tx: &Transaction) -> u64 {
    let mut total = 0u64;
    for input in &tx.inputs {
        total += (std::mem::size_of_val(input)
            + input.signature.capacity()
            + input.public_key.capacity()) as u64;
        for item in &input.witness {
            total += (std::mem::size_of::<Vec<u8>>() + item.capacity()) as u64;
        }
    }
    total += (tx.outputs.len() * std::mem::size_of::<ember_core::types::TxOutput>()) as u64;
    total
}

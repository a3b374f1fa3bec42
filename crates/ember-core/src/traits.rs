//! Traits decoupling the mempool core from chain storage.

use crate::types::{OutPoint, TxOutput};

/// Read-only view of confirmed unspent outputs.
///
/// The mempool resolves transaction inputs against either another pool
/// entry or this view. Implementations are provided by the chain-state
/// layer; tests use a `HashMap`-backed view.
pub trait UtxoView {
    /// Look up an unspent confirmed output. `None` if spent or unknown.
    fn get_output(&self, outpoint: &OutPoint) -> Option<TxOutput>;

    /// Height of the block that created the output, for coinbase-maturity
    /// checks. `None` if unknown.
    fn output_height(&self, outpoint: &OutPoint) -> Option<u64>;

    /// Whether the output was created by a coinbase transaction.
    fn is_coinbase_output(&self, outpoint: &OutPoint) -> bool;
}

//! A mempool record and its package aggregates.

use std::collections::BTreeSet;
use std::sync::Arc;

use ember_core::amount::Amount;
use ember_core::error::TxError;
use ember_core::types::{Transaction, TxId};

use crate::usage;

/// A transaction stored in the mempool, together with aggregate statistics
/// over its in-pool ancestors and descendants (both including the entry
/// itself).
///
/// The descendant aggregates exist so that size limiting can evict whole
/// sub-forests; the ancestor aggregates drive package selection in the
/// block assembler. When the pool cannot afford to recompute descendant
/// state (bounded work during a reorg), the entry is marked *dirty* and
/// its descendant aggregates are pinned to the self-only values, which
/// keeps downstream decisions conservative rather than wrong.
#[derive(Clone, Debug)]
pub struct MempoolEntry {
    tx: Arc<Transaction>,
    txid: TxId,
    fee: Amount,
    /// Accumulated prioritisation fee delta; `modified_fee = fee + fee_delta`.
    fee_delta: Amount,
    time: u64,
    entry_priority: f64,
    height_at_entry: u64,
    sigops_cost: i64,
    tx_size: u64,
    vsize: u64,
    modified_size: u64,
    dynamic_usage: u64,
    had_no_mempool_inputs_at_entry: bool,

    // Aggregates over in-pool descendants, including self.
    count_with_descendants: u64,
    size_with_descendants: u64,
    fees_with_descendants: Amount,
    dirty: bool,

    // Aggregates over in-pool ancestors, including self.
    count_with_ancestors: u64,
    size_with_ancestors: u64,
    mod_fees_with_ancestors: Amount,
    sigops_with_ancestors: i64,

    parents: BTreeSet<TxId>,
    children: BTreeSet<TxId>,
}

impl MempoolEntry {
    /// Build an entry for a validated transaction.
    ///
    /// `had_no_mempool_inputs` records whether the pool contained none of
    /// the transaction's inputs at entry; only such transactions feed the
    /// fee estimator.
    pub fn new(
        tx: Arc<Transaction>,
        fee: Amount,
        time: u64,
        entry_priority: f64,
        height_at_entry: u64,
        had_no_mempool_inputs: bool,
    ) -> Result<Self, TxError> {
        let txid = tx.txid()?;
        let tx_size = tx.total_size()?;
        let vsize = tx.vsize()?;
        let modified_size = tx.modified_size(tx_size);
        let sigops_cost = tx.sigop_cost();
        let dynamic_usage = std::mem::size_of::<Self>() as u64 + usage::tx_usage(&tx);

        Ok(Self {
            tx,
            txid,
            fee,
            fee_delta: 0,
            time,
            entry_priority,
            height_at_entry,
            sigops_cost,
            tx_size,
            vsize,
            modified_size,
            dynamic_usage,
            had_no_mempool_inputs_at_entry: had_no_mempool_inputs,
            count_with_descendants: 1,
            size_with_descendants: tx_size,
            fees_with_descendants: fee,
            dirty: false,
            count_with_ancestors: 1,
            size_with_ancestors: tx_size,
            mod_fees_with_ancestors: fee,
            sigops_with_ancestors: sigops_cost,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
        })
    }

    pub fn tx(&self) -> &Arc<Transaction> {
        &self.tx
    }

    pub fn txid(&self) -> TxId {
        self.txid
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    /// Fee plus any accumulated prioritisation delta. This is the fee the
    /// ancestor scoring and the block assembler see.
    pub fn modified_fee(&self) -> Amount {
        self.fee.saturating_add(self.fee_delta)
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn height_at_entry(&self) -> u64 {
        self.height_at_entry
    }

    pub fn sigops_cost(&self) -> i64 {
        self.sigops_cost
    }

    pub fn tx_size(&self) -> u64 {
        self.tx_size
    }

    pub fn vsize(&self) -> u64 {
        self.vsize
    }

    pub fn dynamic_usage(&self) -> u64 {
        self.dynamic_usage
    }

    pub fn had_no_mempool_inputs_at_entry(&self) -> bool {
        self.had_no_mempool_inputs_at_entry
    }

    /// Coin-age priority at the given height: the entry priority plus the
    /// value-weighted aging since entry, normalised by modified size.
    pub fn priority(&self, current_height: u64) -> f64 {
        let value_in = (self.tx.value_out().saturating_add(self.fee)) as f64;
        let aged = current_height.saturating_sub(self.height_at_entry) as f64;
        self.entry_priority + aged * value_in / self.modified_size as f64
    }

    pub fn count_with_descendants(&self) -> u64 {
        self.count_with_descendants
    }

    pub fn size_with_descendants(&self) -> u64 {
        self.size_with_descendants
    }

    pub fn fees_with_descendants(&self) -> Amount {
        self.fees_with_descendants
    }

    /// Whether the descendant aggregates are stale. While dirty they are
    /// defined to equal the self-only values.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn count_with_ancestors(&self) -> u64 {
        self.count_with_ancestors
    }

    pub fn size_with_ancestors(&self) -> u64 {
        self.size_with_ancestors
    }

    pub fn mod_fees_with_ancestors(&self) -> Amount {
        self.mod_fees_with_ancestors
    }

    pub fn sigops_with_ancestors(&self) -> i64 {
        self.sigops_with_ancestors
    }

    pub fn parents(&self) -> &BTreeSet<TxId> {
        &self.parents
    }

    pub fn children(&self) -> &BTreeSet<TxId> {
        &self.children
    }

    // ------------------------------------------------------------------
    // Crate-internal mutators. The pool re-ranks index keys around every
    // call; nothing outside the pool may mutate aggregates directly.
    // ------------------------------------------------------------------

    pub(crate) fn update_descendant_state(&mut self, dsize: i64, dfee: Amount, dcount: i64) {
        if self.dirty {
            return;
        }
        self.size_with_descendants = add_signed(self.size_with_descendants, dsize);
        self.fees_with_descendants = self.fees_with_descendants.saturating_add(dfee);
        self.count_with_descendants = add_signed(self.count_with_descendants, dcount);
    }

    pub(crate) fn update_ancestor_state(
        &mut self,
        dsize: i64,
        dfee: Amount,
        dsigops: i64,
        dcount: i64,
    ) {
        self.size_with_ancestors = add_signed(self.size_with_ancestors, dsize);
        self.mod_fees_with_ancestors = self.mod_fees_with_ancestors.saturating_add(dfee);
        self.sigops_with_ancestors += dsigops;
        self.count_with_ancestors = add_signed(self.count_with_ancestors, dcount);
    }

    /// Pin descendant aggregates to self-only values until a full
    /// recomputation clears the flag.
    pub(crate) fn set_dirty(&mut self) {
        self.dirty = true;
        self.count_with_descendants = 1;
        self.size_with_descendants = self.tx_size;
        self.fees_with_descendants = self.fee;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Apply a prioritisation delta to the cached modified fee. The caller
    /// propagates the same delta into descendant ancestor-aggregates.
    pub(crate) fn bump_fee_delta(&mut self, delta: Amount) {
        self.fee_delta = self.fee_delta.saturating_add(delta);
        self.mod_fees_with_ancestors = self.mod_fees_with_ancestors.saturating_add(delta);
    }

    /// Add or remove a parent link. Returns the usage delta applied.
    pub(crate) fn update_parent(&mut self, add: bool, txid: TxId) -> i64 {
        let changed = if add {
            self.parents.insert(txid)
        } else {
            self.parents.remove(&txid)
        };
        if !changed {
            return 0;
        }
        if add {
            self.dynamic_usage += usage::LINK_NODE_USAGE;
            usage::LINK_NODE_USAGE as i64
        } else {
            self.dynamic_usage -= usage::LINK_NODE_USAGE;
            -(usage::LINK_NODE_USAGE as i64)
        }
    }

    /// Add or remove a child link. Returns the usage delta applied.
    pub(crate) fn update_child(&mut self, add: bool, txid: TxId) -> i64 {
        let changed = if add {
            self.children.insert(txid)
        } else {
            self.children.remove(&txid)
        };
        if !changed {
            return 0;
        }
        if add {
            self.dynamic_usage += usage::LINK_NODE_USAGE;
            usage::LINK_NODE_USAGE as i64
        } else {
            self.dynamic_usage -= usage::LINK_NODE_USAGE;
            -(usage::LINK_NODE_USAGE as i64)
        }
    }
}

fn add_signed(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::constants::COIN;
    use ember_core::types::{Hash256, OutPoint, TxInput, TxOutput};

    fn sample_entry(fee: Amount) -> MempoolEntry {
        let tx = Arc::new(Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: Hash256([1; 32]), index: 0 },
                signature: vec![0; 64],
                public_key: vec![0; 32],
                witness: Vec::new(),
            }],
            outputs: vec![TxOutput { value: 50 * COIN, pubkey_hash: Hash256::ZERO }],
            lock_time: 0,
        });
        MempoolEntry::new(tx, fee, 1_000, 0.0, 100, true).unwrap()
    }

    #[test]
    fn new_entry_aggregates_are_self_only() {
        let entry = sample_entry(1_000);
        assert_eq!(entry.count_with_descendants(), 1);
        assert_eq!(entry.size_with_descendants(), entry.tx_size());
        assert_eq!(entry.fees_with_descendants(), 1_000);
        assert_eq!(entry.count_with_ancestors(), 1);
        assert_eq!(entry.size_with_ancestors(), entry.tx_size());
        assert_eq!(entry.mod_fees_with_ancestors(), 1_000);
        assert_eq!(entry.sigops_with_ancestors(), entry.sigops_cost());
        assert!(!entry.is_dirty());
    }

    #[test]
    fn descendant_state_updates() {
        let mut entry = sample_entry(1_000);
        entry.update_descendant_state(250, 2_000, 1);
        assert_eq!(entry.size_with_descendants(), entry.tx_size() + 250);
        assert_eq!(entry.fees_with_descendants(), 3_000);
        assert_eq!(entry.count_with_descendants(), 2);

        entry.update_descendant_state(-250, -2_000, -1);
        assert_eq!(entry.count_with_descendants(), 1);
        assert_eq!(entry.fees_with_descendants(), 1_000);
    }

    #[test]
    fn dirty_pins_descendant_state() {
        let mut entry = sample_entry(1_000);
        entry.update_descendant_state(250, 2_000, 1);
        entry.set_dirty();
        assert!(entry.is_dirty());
        assert_eq!(entry.count_with_descendants(), 1);
        assert_eq!(entry.fees_with_descendants(), 1_000);

        // Updates are ignored while dirty.
        entry.update_descendant_state(500, 500, 1);
        assert_eq!(entry.size_with_descendants(), entry.tx_size());
    }

    #[test]
    fn fee_delta_feeds_modified_fee() {
        let mut entry = sample_entry(1_000);
        entry.bump_fee_delta(500);
        assert_eq!(entry.fee(), 1_000);
        assert_eq!(entry.modified_fee(), 1_500);
        assert_eq!(entry.mod_fees_with_ancestors(), 1_500);

        entry.bump_fee_delta(-1_500);
        assert_eq!(entry.modified_fee(), 0);
    }

    #[test]
    fn link_updates_track_usage() {
        let mut entry = sample_entry(1_000);
        let base = entry.dynamic_usage();

        let delta = entry.update_parent(true, Hash256([2; 32]));
        assert_eq!(delta, usage::LINK_NODE_USAGE as i64);
        assert_eq!(entry.dynamic_usage(), base + usage::LINK_NODE_USAGE);

        // Duplicate insert is a no-op.
        assert_eq!(entry.update_parent(true, Hash256([2; 32])), 0);

        let delta = entry.update_parent(false, Hash256([2; 32]));
        assert_eq!(delta, -(usage::LINK_NODE_USAGE as i64));
        assert_eq!(entry.dynamic_usage(), base);

        // Removing an absent child is a no-op.
        assert_eq!(entry.update_child(false, Hash256([3; 32])), 0);
    }

    #[test]
    fn priority_ages_with_height() {
        let entry = sample_entry(1_000);
        let now = entry.priority(100);
        let later = entry.priority(200);
        assert!(later > now);
    }
}

//! The multi-key indexed transaction pool.
//!
//! Primary storage is a `HashMap` keyed by txid; three ordered secondary
//! indices hold score keys that embed the exact `(fees, size)` pairs they
//! rank by, compared with 128-bit cross multiplication so ordering is
//! exact. Any mutation of an entry's aggregates goes through
//! [`Mempool::modify_entry`], which removes the affected keys, applies the
//! change, and reinserts them.
//!
//! Not thread-safe on its own: the node wraps the pool in its `pool_lock`
//! and acquires `chain_lock` first whenever both are needed. Notification
//! callbacks are enqueued, never invoked, while the pool is borrowed.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use ember_core::amount::{cmp_feerate, Amount, FeeRate};
use ember_core::constants::{
    COINBASE_MATURITY, DEFAULT_MAX_MEMPOOL_USAGE, DEFAULT_MEMPOOL_EXPIRY_SECS, MEMPOOL_HEIGHT,
};
use ember_core::error::MempoolError;
use ember_core::traits::UtxoView;
use ember_core::types::{OutPoint, Transaction, TxId, TxOutput};
use ember_events::{Notification, NotificationQueue, RemovalReason, ShutdownFlag};

use crate::entry::MempoolEntry;
use crate::estimator::FeeEstimator;
use crate::usage;

/// Limits applied while walking a candidate's in-pool ancestry.
#[derive(Clone, Copy, Debug)]
pub struct AncestorLimits {
    /// Maximum ancestors, counting the candidate itself.
    pub max_ancestors: u64,
    /// Maximum total serialized size of the candidate plus ancestors.
    pub max_ancestor_size: u64,
    /// Maximum descendants any ancestor may end up with.
    pub max_descendants: u64,
    /// Maximum descendant size any ancestor may end up with.
    pub max_descendant_size: u64,
}

impl AncestorLimits {
    /// No limits; used by removal bookkeeping and the block assembler.
    pub const NONE: Self = Self {
        max_ancestors: u64::MAX,
        max_ancestor_size: u64::MAX,
        max_descendants: u64::MAX,
        max_descendant_size: u64::MAX,
    };
}

impl Default for AncestorLimits {
    fn default() -> Self {
        Self {
            max_ancestors: 25,
            max_ancestor_size: 101_000,
            max_descendants: 25,
            max_descendant_size: 101_000,
        }
    }
}

/// Pool configuration.
#[derive(Clone, Debug)]
pub struct MempoolOptions {
    /// Relay floor; the eviction benchmark scales off this.
    pub min_relay_rate: FeeRate,
    /// Memory budget in bytes for [`Mempool::dynamic_memory_usage`].
    pub max_usage: u64,
    /// Entries older than this many seconds are expired.
    pub expiry_secs: u64,
    /// Seed for the eviction sampling throttle. Tests inject one for
    /// determinism; production leaves it unset.
    pub trim_seed: Option<u64>,
}

impl Default for MempoolOptions {
    fn default() -> Self {
        Self {
            min_relay_rate: FeeRate::per_kb(1_000),
            max_usage: DEFAULT_MAX_MEMPOOL_USAGE,
            expiry_secs: DEFAULT_MEMPOOL_EXPIRY_SECS,
            trim_seed: None,
        }
    }
}

/// Key for the descendant-score index.
///
/// Ranks by `max(fee/size, fees_with_descendants/size_with_descendants)`,
/// best first; ties go to the older entry, then the lower txid. The
/// `(fees, size)` pair of whichever rate won is embedded so removal can
/// reconstruct the exact key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DescendantScoreKey {
    fees: Amount,
    size: u64,
    time: u64,
    txid: TxId,
}

impl Ord for DescendantScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_feerate(other.fees, other.size, self.fees, self.size)
            .then_with(|| self.time.cmp(&other.time))
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for DescendantScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Key for the ancestor-score index.
///
/// Ranks by `min(modified_fee/size, mod_fees_with_ancestors/
/// size_with_ancestors)`, best first; ties go to the lower txid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AncestorScoreKey {
    fees: Amount,
    size: u64,
    txid: TxId,
}

impl Ord for AncestorScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_feerate(other.fees, other.size, self.fees, self.size)
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for AncestorScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn descendant_score_key(entry: &MempoolEntry) -> DescendantScoreKey {
    let use_descendants = cmp_feerate(
        entry.fees_with_descendants(),
        entry.size_with_descendants(),
        entry.fee(),
        entry.tx_size(),
    ) == Ordering::Greater;
    let (fees, size) = if use_descendants {
        (entry.fees_with_descendants(), entry.size_with_descendants())
    } else {
        (entry.fee(), entry.tx_size())
    };
    DescendantScoreKey { fees, size, time: entry.time(), txid: entry.txid() }
}

fn ancestor_score_key(entry: &MempoolEntry) -> AncestorScoreKey {
    let use_ancestors = cmp_feerate(
        entry.mod_fees_with_ancestors(),
        entry.size_with_ancestors(),
        entry.modified_fee(),
        entry.tx_size(),
    ) == Ordering::Less;
    let (fees, size) = if use_ancestors {
        (entry.mod_fees_with_ancestors(), entry.size_with_ancestors())
    } else {
        (entry.modified_fee(), entry.tx_size())
    };
    AncestorScoreKey { fees, size, txid: entry.txid() }
}

/// In-memory pool of unconfirmed transactions.
pub struct Mempool {
    entries: HashMap<TxId, MempoolEntry>,
    /// Spent outpoint -> (spending txid, input index). At most one pool
    /// transaction spends any outpoint.
    next_tx: HashMap<OutPoint, (TxId, u32)>,
    /// Prioritisation deltas; survive entry removal and re-apply on re-add.
    deltas: HashMap<TxId, (f64, Amount)>,
    by_entry_time: BTreeSet<(u64, TxId)>,
    by_descendant_score: BTreeSet<DescendantScoreKey>,
    by_ancestor_score: BTreeSet<AncestorScoreKey>,
    total_tx_size: u64,
    cached_inner_usage: u64,
    transactions_updated: u64,
    options: MempoolOptions,
    estimator: FeeEstimator,
    events: Arc<NotificationQueue>,
    shutdown: ShutdownFlag,
    pub(crate) trim_rng: StdRng,
}

impl Mempool {
    /// Create a pool. Events produced by pool mutations are enqueued on
    /// `events` and dispatched by its background worker.
    pub fn new(options: MempoolOptions, events: Arc<NotificationQueue>) -> Self {
        let trim_rng = match options.trim_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            entries: HashMap::new(),
            next_tx: HashMap::new(),
            deltas: HashMap::new(),
            by_entry_time: BTreeSet::new(),
            by_descendant_score: BTreeSet::new(),
            by_ancestor_score: BTreeSet::new(),
            total_tx_size: 0,
            cached_inner_usage: 0,
            transactions_updated: 0,
            options,
            estimator: FeeEstimator::new(),
            events,
            shutdown: ShutdownFlag::new(),
            trim_rng,
        }
    }

    /// Install the shutdown flag polled by long-running loops.
    pub fn set_shutdown_flag(&mut self, flag: ShutdownFlag) {
        self.shutdown = flag;
    }

    pub fn options(&self) -> &MempoolOptions {
        &self.options
    }

    pub fn min_relay_rate(&self) -> FeeRate {
        self.options.min_relay_rate
    }

    // ------------------------------------------------------------------
    // Index plumbing
    // ------------------------------------------------------------------

    /// Mutate an entry while keeping the score indices consistent: the
    /// affected keys are removed before the closure runs and reinserted
    /// from the updated state afterwards.
    fn modify_entry<R>(&mut self, txid: &TxId, f: impl FnOnce(&mut MempoolEntry) -> R) -> R {
        let entry = self.entries.get_mut(txid).expect("modify_entry: unknown txid");
        let old_desc = descendant_score_key(entry);
        let old_anc = ancestor_score_key(entry);
        let result = f(entry);
        let new_desc = descendant_score_key(entry);
        let new_anc = ancestor_score_key(entry);
        if new_desc != old_desc {
            self.by_descendant_score.remove(&old_desc);
            self.by_descendant_score.insert(new_desc);
        }
        if new_anc != old_anc {
            self.by_ancestor_score.remove(&old_anc);
            self.by_ancestor_score.insert(new_anc);
        }
        result
    }

    fn insert_index_keys(&mut self, txid: &TxId) {
        let entry = &self.entries[txid];
        self.by_entry_time.insert((entry.time(), *txid));
        self.by_descendant_score.insert(descendant_score_key(entry));
        self.by_ancestor_score.insert(ancestor_score_key(entry));
    }

    fn remove_index_keys(&mut self, txid: &TxId) {
        let entry = &self.entries[txid];
        self.by_entry_time.remove(&(entry.time(), *txid));
        self.by_descendant_score.remove(&descendant_score_key(entry));
        self.by_ancestor_score.remove(&ancestor_score_key(entry));
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Insert a validated entry, computing its in-pool ancestors without
    /// limits. See [`add_unchecked_with_ancestors`](Self::add_unchecked_with_ancestors).
    pub fn add_unchecked(&mut self, entry: MempoolEntry) {
        let ancestors = self
            .calculate_ancestors(&entry, &AncestorLimits::NONE)
            .expect("unlimited ancestor walk cannot fail");
        self.add_unchecked_with_ancestors(entry, ancestors);
    }

    /// Insert a validated entry whose exact in-pool ancestor set the
    /// caller has already computed.
    ///
    /// Preconditions (all enforced by external validation; violating them
    /// here is a programming error and panics): the tx is not in the pool,
    /// none of its inputs are spent by a pool entry, and `ancestors` is
    /// exactly the set [`calculate_ancestors`](Self::calculate_ancestors)
    /// would return.
    pub fn add_unchecked_with_ancestors(
        &mut self,
        mut entry: MempoolEntry,
        ancestors: BTreeSet<TxId>,
    ) {
        let txid = entry.txid();
        assert!(
            !self.entries.contains_key(&txid),
            "add_unchecked: {txid} already in pool"
        );

        // Re-apply any prioritisation recorded before (re-)admission.
        if let Some((_, fee_delta)) = self.deltas.get(&txid) {
            entry.bump_fee_delta(*fee_delta);
        }

        // Register inputs in the spend map and collect direct parents.
        let mut parents: BTreeSet<TxId> = BTreeSet::new();
        for (index, input) in entry.tx().inputs.iter().enumerate() {
            let prev = self.next_tx.insert(input.previous_output, (txid, index as u32));
            assert!(
                prev.is_none(),
                "add_unchecked: input {} already spent",
                input.previous_output
            );
            if self.entries.contains_key(&input.previous_output.txid) {
                parents.insert(input.previous_output.txid);
            }
        }

        // Sum ancestor contributions before the entry is linked in.
        let mut anc_size = 0i64;
        let mut anc_fees = 0 as Amount;
        let mut anc_sigops = 0i64;
        let mut anc_count = 0i64;
        for ancestor in &ancestors {
            let a = self.entries.get(ancestor).expect("ancestor not in pool");
            anc_size += a.tx_size() as i64;
            anc_fees = anc_fees.saturating_add(a.modified_fee());
            anc_sigops += a.sigops_cost();
            anc_count += 1;
        }
        entry.update_ancestor_state(anc_size, anc_fees, anc_sigops, anc_count);

        for parent in &parents {
            entry.update_parent(true, *parent);
        }

        let entry_size = entry.tx_size();
        let entry_fee = entry.fee();
        let entry_usage = entry.dynamic_usage();
        let event = Notification::TransactionAdded {
            tx: Arc::clone(entry.tx()),
            fee: entry_fee,
            vsize: entry.vsize(),
            valid_for_estimation: entry.had_no_mempool_inputs_at_entry(),
        };
        self.estimator.processed_transaction(&entry, true);

        self.entries.insert(txid, entry);
        self.insert_index_keys(&txid);
        self.total_tx_size += entry_size;
        self.cached_inner_usage += entry_usage;

        // Mirror the link on each parent and credit every ancestor's
        // descendant aggregates with this entry's self values.
        for parent in parents {
            let delta = self.modify_entry(&parent, |p| p.update_child(true, txid));
            self.adjust_inner_usage(delta);
        }
        for ancestor in ancestors {
            self.modify_entry(&ancestor, |a| {
                a.update_descendant_state(entry_size as i64, entry_fee, 1)
            });
        }

        self.transactions_updated += 1;
        self.events.enqueue(event);
    }

    fn adjust_inner_usage(&mut self, delta: i64) {
        if delta >= 0 {
            self.cached_inner_usage += delta as u64;
        } else {
            self.cached_inner_usage -= delta.unsigned_abs();
        }
    }

    /// Walk the in-pool ancestry of `entry` breadth-first, failing early
    /// when a limit would be exceeded.
    ///
    /// The entry itself may or may not already be in the pool: direct
    /// parents are resolved by scanning its inputs against the primary
    /// index, so the same walk serves admission and removal bookkeeping.
    pub fn calculate_ancestors(
        &self,
        entry: &MempoolEntry,
        limits: &AncestorLimits,
    ) -> Result<BTreeSet<TxId>, MempoolError> {
        let mut parent_hashes: BTreeSet<TxId> = BTreeSet::new();
        for input in &entry.tx().inputs {
            if self.entries.contains_key(&input.previous_output.txid) {
                parent_hashes.insert(input.previous_output.txid);
                if parent_hashes.len() as u64 + 1 > limits.max_ancestors {
                    return Err(MempoolError::TooManyAncestors { limit: limits.max_ancestors });
                }
            }
        }

        let mut ancestors: BTreeSet<TxId> = BTreeSet::new();
        let mut total_size = entry.tx_size();

        while !parent_hashes.is_empty() {
            ancestors.extend(parent_hashes.iter().copied());
            let mut stage_parents: BTreeSet<TxId> = BTreeSet::new();
            for stage_txid in &parent_hashes {
                let stage_entry = self
                    .entries
                    .get(stage_txid)
                    .expect("ancestor walk: parent not in pool");

                total_size += stage_entry.tx_size();
                if stage_entry.size_with_descendants() + entry.tx_size()
                    > limits.max_descendant_size
                {
                    return Err(MempoolError::ExceedsDescendantSize {
                        txid: stage_txid.to_string(),
                        limit: limits.max_descendant_size,
                    });
                } else if stage_entry.count_with_descendants() + 1 > limits.max_descendants {
                    return Err(MempoolError::TooManyDescendants {
                        txid: stage_txid.to_string(),
                        limit: limits.max_descendants,
                    });
                } else if total_size > limits.max_ancestor_size {
                    return Err(MempoolError::ExceedsAncestorSize {
                        limit: limits.max_ancestor_size,
                    });
                }

                for parent in stage_entry.parents() {
                    if !ancestors.contains(parent) {
                        stage_parents.insert(*parent);
                    }
                    if stage_parents.len() as u64 + ancestors.len() as u64 + 1
                        > limits.max_ancestors
                    {
                        return Err(MempoolError::TooManyAncestors {
                            limit: limits.max_ancestors,
                        });
                    }
                }
            }
            parent_hashes = stage_parents;
        }

        Ok(ancestors)
    }

    /// In-pool ancestors of an existing entry, excluding the entry itself.
    /// Walks the parent links, so it is only meaningful when the graph is
    /// consistent.
    pub fn ancestors_of(&self, txid: &TxId) -> BTreeSet<TxId> {
        let mut ancestors = BTreeSet::new();
        let mut stage: BTreeSet<TxId> = match self.entries.get(txid) {
            Some(entry) => entry.parents().clone(),
            None => return ancestors,
        };
        while !stage.is_empty() {
            let mut next = BTreeSet::new();
            for hash in stage {
                if ancestors.insert(hash) {
                    for parent in self.entries[&hash].parents() {
                        if !ancestors.contains(parent) {
                            next.insert(*parent);
                        }
                    }
                }
            }
            stage = next;
        }
        ancestors
    }

    /// The descendant closure of an in-pool entry, including the entry
    /// itself. Empty if the txid is unknown.
    pub fn descendants_of(&self, txid: &TxId) -> BTreeSet<TxId> {
        let mut descendants = BTreeSet::new();
        if !self.entries.contains_key(txid) {
            return descendants;
        }
        let mut stage: BTreeSet<TxId> = BTreeSet::new();
        stage.insert(*txid);
        while !stage.is_empty() {
            let mut next = BTreeSet::new();
            for hash in stage {
                if descendants.insert(hash) {
                    for child in self.entries[&hash].children() {
                        if !descendants.contains(child) {
                            next.insert(*child);
                        }
                    }
                }
            }
            stage = next;
        }
        descendants
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Remove an entry and its whole descendant closure.
    ///
    /// Returns the removed transactions. Unknown txids are a no-op.
    pub fn remove_recursive(&mut self, txid: &TxId, reason: RemovalReason) -> Vec<Arc<Transaction>> {
        let stage = self.descendants_of(txid);
        if stage.is_empty() {
            return Vec::new();
        }
        self.remove_staged(&stage, Some(reason))
    }

    /// Remove every pool transaction that spends an input of `tx`
    /// (other than `tx` itself), recursively.
    pub fn remove_conflicts(&mut self, tx: &Transaction) -> Vec<Arc<Transaction>> {
        self.remove_conflicts_inner(tx, Some(RemovalReason::Conflict))
    }

    fn remove_conflicts_inner(
        &mut self,
        tx: &Transaction,
        reason: Option<RemovalReason>,
    ) -> Vec<Arc<Transaction>> {
        let own_txid = tx.txid().ok();
        let mut removed = Vec::new();
        for input in &tx.inputs {
            if let Some((spender, _)) = self.next_tx.get(&input.previous_output).copied() {
                if Some(spender) != own_txid {
                    let stage = self.descendants_of(&spender);
                    removed.extend(self.remove_staged(&stage, reason));
                }
            }
        }
        removed
    }

    /// Remove a staged set atomically, keeping every aggregate and index
    /// consistent. The stage must be closed under descendants.
    ///
    /// With `reason` set, a removal event is emitted per transaction; with
    /// `None` the removals travel in a bulk block-connect event instead.
    pub fn remove_staged(
        &mut self,
        stage: &BTreeSet<TxId>,
        reason: Option<RemovalReason>,
    ) -> Vec<Arc<Transaction>> {
        // Phase 1: debit every surviving ancestor's descendant aggregates
        // and every surviving descendant's ancestor aggregates. Links are
        // still intact, so the walks see the full graph.
        for txid in stage {
            let Some(entry) = self.entries.get(txid) else { continue };
            let (size, fee, mod_fee, sigops) = (
                entry.tx_size() as i64,
                entry.fee(),
                entry.modified_fee(),
                entry.sigops_cost(),
            );

            for ancestor in self.ancestors_of(txid) {
                if !stage.contains(&ancestor) {
                    self.modify_entry(&ancestor, |a| {
                        a.update_descendant_state(-size, -fee, -1)
                    });
                }
            }
            for descendant in self.descendants_of(txid) {
                if descendant != *txid && !stage.contains(&descendant) {
                    self.modify_entry(&descendant, |d| {
                        d.update_ancestor_state(-size, -mod_fee, -sigops, -1)
                    });
                }
            }
        }

        // Phase 2: sever links crossing the stage boundary.
        for txid in stage {
            let Some(entry) = self.entries.get(txid) else { continue };
            let parents: Vec<TxId> = entry
                .parents()
                .iter()
                .filter(|p| !stage.contains(*p))
                .copied()
                .collect();
            let children: Vec<TxId> = entry
                .children()
                .iter()
                .filter(|c| !stage.contains(*c))
                .copied()
                .collect();
            for parent in parents {
                let delta = self.modify_entry(&parent, |p| p.update_child(false, *txid));
                self.adjust_inner_usage(delta);
            }
            for child in children {
                let delta = self.modify_entry(&child, |c| c.update_parent(false, *txid));
                self.adjust_inner_usage(delta);
            }
        }

        // Phase 3: erase.
        let mut removed = Vec::with_capacity(stage.len());
        for txid in stage {
            if !self.entries.contains_key(txid) {
                continue;
            }
            self.remove_index_keys(txid);
            let entry = self.entries.remove(txid).expect("staged entry present");
            for input in &entry.tx().inputs {
                self.next_tx.remove(&input.previous_output);
            }
            self.total_tx_size -= entry.tx_size();
            self.cached_inner_usage -= entry.dynamic_usage();
            self.transactions_updated += 1;
            self.estimator.removed_tx(txid);

            let tx = Arc::clone(entry.tx());
            if let Some(reason) = reason {
                self.events.enqueue(Notification::TransactionRemoved {
                    tx: Arc::clone(&tx),
                    reason,
                });
            }
            removed.push(tx);
        }
        removed
    }

    /// Remove everything a connected block confirms or conflicts with.
    ///
    /// Returns `(removed_in_block, conflicts)` and enqueues the combined
    /// mempool-update event; the caller enqueues the matching
    /// block-connected event *after* this returns, which yields the
    /// documented interleaving for dual listeners.
    pub fn remove_for_block(
        &mut self,
        block_txs: &[Transaction],
        height: u64,
    ) -> Result<(Vec<Arc<Transaction>>, Vec<Arc<Transaction>>), MempoolError> {
        // Snapshot confirmed entries and feed the estimator while they
        // are still registered with it; removal unregisters them.
        let mut confirmed = Vec::new();
        for tx in block_txs {
            let txid = tx.txid().map_err(|e| MempoolError::Serialization(e.to_string()))?;
            if let Some(entry) = self.entries.get(&txid) {
                confirmed.push(entry.clone());
            }
        }
        self.estimator.processed_block(height, &confirmed, true);

        let mut removed_in_block = Vec::new();
        let mut conflicts = Vec::new();
        for tx in block_txs {
            let txid = tx.txid().map_err(|e| MempoolError::Serialization(e.to_string()))?;
            if self.entries.contains_key(&txid) {
                let mut single = BTreeSet::new();
                single.insert(txid);
                removed_in_block.extend(self.remove_staged(&single, None));
            }
            conflicts.extend(self.remove_conflicts_inner(tx, None));
            self.clear_prioritisation(&txid);
        }

        self.events.enqueue(Notification::MempoolUpdatedForBlockConnect {
            removed_in_block: removed_in_block.clone(),
            removed_conflicted: conflicts.clone(),
        });
        Ok((removed_in_block, conflicts))
    }

    /// Remove entries spending coinbase outputs that are no longer mature
    /// at `pool_height`, or whose confirmed inputs vanished entirely.
    /// Runs after a chain disconnect.
    pub fn remove_premature_coinbase_spends(&mut self, view: &dyn UtxoView, pool_height: u64) {
        let mut to_remove = Vec::new();
        'outer: for entry in self.entries.values() {
            for input in &entry.tx().inputs {
                if self.entries.contains_key(&input.previous_output.txid) {
                    continue;
                }
                let available = view.get_output(&input.previous_output).is_some();
                let immature = view.is_coinbase_output(&input.previous_output)
                    && view
                        .output_height(&input.previous_output)
                        .is_some_and(|h| pool_height.saturating_sub(h) < COINBASE_MATURITY);
                if !available || immature {
                    to_remove.push(entry.txid());
                    continue 'outer;
                }
            }
        }
        for txid in to_remove {
            self.remove_recursive(&txid, RemovalReason::Reorg);
        }
    }

    /// Expire with the configured retention window: everything older than
    /// `now - expiry_secs` goes.
    pub fn expire_with_configured_window(&mut self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.options.expiry_secs);
        self.expire(cutoff)
    }

    /// Expire entries older than `time_cutoff`, together with their
    /// descendants. Returns the number of removed transactions.
    pub fn expire(&mut self, time_cutoff: u64) -> usize {
        let mut stage: BTreeSet<TxId> = BTreeSet::new();
        for (time, txid) in self.by_entry_time.iter() {
            if *time >= time_cutoff || self.shutdown.is_requested() {
                break;
            }
            stage.extend(self.descendants_of(txid));
        }
        if stage.is_empty() {
            return 0;
        }
        let removed = self.remove_staged(&stage, Some(RemovalReason::Expiry)).len();
        info!(removed, cutoff = time_cutoff, "expired mempool transactions");
        removed
    }

    /// Drop everything, resetting accounting.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_tx.clear();
        self.by_entry_time.clear();
        self.by_descendant_score.clear();
        self.by_ancestor_score.clear();
        self.total_tx_size = 0;
        self.cached_inner_usage = 0;
        self.transactions_updated += 1;
    }

    // ------------------------------------------------------------------
    // Reorg repair
    // ------------------------------------------------------------------

    /// After a block disconnect re-adds `reinserted` to the pool, rebuild
    /// parent/child links against pre-existing entries and refresh
    /// descendant state for each, visiting at most a bounded number of
    /// descendants per entry. On budget exhaustion the entry is marked
    /// dirty instead of left wrong.
    pub fn update_from_block_disconnect(&mut self, reinserted: &[TxId]) {
        const MAX_DESCENDANTS_TO_VISIT: usize = 100;

        let already: HashSet<TxId> = reinserted.iter().copied().collect();
        let mut cached_descendants: HashMap<TxId, BTreeSet<TxId>> = HashMap::new();

        // Reverse order: children first, so by the time an entry is
        // processed its own child links are already rebuilt.
        for txid in reinserted.iter().rev() {
            if !self.entries.contains_key(txid) {
                continue;
            }

            // Rebuild child links from the spend map.
            let outputs_len = self.entries[txid].tx().outputs.len() as u32;
            let mut seen_children: BTreeSet<TxId> = BTreeSet::new();
            for index in 0..outputs_len {
                let outpoint = OutPoint { txid: *txid, index };
                if let Some((child, _)) = self.next_tx.get(&outpoint).copied() {
                    if seen_children.insert(child) && !already.contains(&child) {
                        let delta = self.modify_entry(txid, |e| e.update_child(true, child));
                        self.adjust_inner_usage(delta);
                        let delta = self.modify_entry(&child, |c| c.update_parent(true, *txid));
                        self.adjust_inner_usage(delta);
                    }
                }
            }

            if !self.update_for_descendants(
                txid,
                MAX_DESCENDANTS_TO_VISIT,
                &mut cached_descendants,
                &already,
            ) {
                warn!(%txid, "descendant walk over budget, marking entry dirty");
                self.modify_entry(txid, |e| e.set_dirty());
            }
        }
    }

    /// Refresh one re-added entry's descendant aggregates (and its
    /// descendants' ancestor aggregates) by walking its children. Returns
    /// false when the walk would exceed `max_to_visit` entries outside
    /// `exclude`, or runs into a dirty descendant.
    fn update_for_descendants(
        &mut self,
        txid: &TxId,
        max_to_visit: usize,
        cached_descendants: &mut HashMap<TxId, BTreeSet<TxId>>,
        exclude: &HashSet<TxId>,
    ) -> bool {
        let mut to_visit = 0usize;
        let mut all_descendants: BTreeSet<TxId> = BTreeSet::new();
        let mut stage = self.entries[txid].children().clone();

        while !stage.is_empty() {
            all_descendants.extend(stage.iter().copied());
            let mut to_add: BTreeSet<TxId> = BTreeSet::new();
            for child in &stage {
                let child_entry = &self.entries[child];
                if child_entry.is_dirty() {
                    // A dirty descendant poisons any total we could compute.
                    return false;
                }
                let grandchildren = child_entry.children().clone();
                for next in grandchildren {
                    if let Some(cached) = cached_descendants.get(&next) {
                        for cached_hash in cached.clone() {
                            if all_descendants.insert(cached_hash)
                                && !exclude.contains(&cached_hash)
                                && !to_add.contains(&cached_hash)
                            {
                                to_visit += 1;
                            }
                        }
                        all_descendants.insert(next);
                    } else if !all_descendants.contains(&next) {
                        if to_add.insert(next) && !exclude.contains(&next) {
                            to_visit += 1;
                        }
                    }
                    if to_visit > max_to_visit {
                        return false;
                    }
                }
            }
            stage = to_add;
        }

        let (self_size, self_fee, self_mod_fee, self_sigops) = {
            let entry = &self.entries[txid];
            (entry.tx_size() as i64, entry.fee(), entry.modified_fee(), entry.sigops_cost())
        };

        let mut dsize = 0i64;
        let mut dfee = 0 as Amount;
        let mut dcount = 0i64;
        for descendant in &all_descendants {
            if exclude.contains(descendant) {
                continue;
            }
            let d = &self.entries[descendant];
            dsize += d.tx_size() as i64;
            dfee = dfee.saturating_add(d.fee());
            dcount += 1;
            cached_descendants.entry(*txid).or_default().insert(*descendant);
        }
        // Make the refreshed state visible both ways: this entry learns
        // its descendants, each descendant learns this ancestor.
        for descendant in &all_descendants {
            if exclude.contains(descendant) {
                continue;
            }
            self.modify_entry(descendant, |d| {
                d.update_ancestor_state(self_size, self_mod_fee, self_sigops, 1)
            });
        }
        self.modify_entry(txid, |e| {
            e.clear_dirty();
            e.update_descendant_state(dsize, dfee, dcount);
        });
        true
    }

    // ------------------------------------------------------------------
    // Prioritisation
    // ------------------------------------------------------------------

    /// Accumulate a prioritisation delta for a transaction. Applies to the
    /// live entry (and its descendants' package fees) immediately when the
    /// tx is in the pool, and persists for later re-admission either way.
    pub fn prioritise(&mut self, txid: &TxId, priority_delta: f64, fee_delta: Amount) {
        {
            let deltas = self.deltas.entry(*txid).or_insert((0.0, 0));
            deltas.0 += priority_delta;
            deltas.1 = deltas.1.saturating_add(fee_delta);
        }
        if self.entries.contains_key(txid) && fee_delta != 0 {
            self.modify_entry(txid, |e| e.bump_fee_delta(fee_delta));
            for descendant in self.descendants_of(txid) {
                if descendant != *txid {
                    self.modify_entry(&descendant, |d| {
                        d.update_ancestor_state(0, fee_delta, 0, 0)
                    });
                }
            }
        }
        info!(%txid, priority_delta, fee_delta, "prioritised transaction");
    }

    /// Fold any recorded deltas for `txid` into the provided accumulators.
    pub fn apply_deltas(&self, txid: &TxId, priority: &mut f64, fee: &mut Amount) {
        if let Some((dpriority, dfee)) = self.deltas.get(txid) {
            *priority += dpriority;
            *fee = fee.saturating_add(*dfee);
        }
    }

    /// Forget recorded deltas, typically once the tx has confirmed.
    pub fn clear_prioritisation(&mut self, txid: &TxId) {
        self.deltas.remove(txid);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn lookup(&self, txid: &TxId) -> Option<Arc<Transaction>> {
        self.entries.get(txid).map(|e| Arc::clone(e.tx()))
    }

    pub fn entry(&self, txid: &TxId) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn exists(&self, txid: &TxId) -> bool {
        self.entries.contains_key(txid)
    }

    /// Snapshot of every txid in the pool, in no particular order.
    pub fn query_hashes(&self) -> Vec<TxId> {
        self.entries.keys().copied().collect()
    }

    /// Whether none of the tx's inputs are provided by pool entries.
    pub fn has_no_inputs_of(&self, tx: &Transaction) -> bool {
        tx.inputs
            .iter()
            .all(|input| !self.entries.contains_key(&input.previous_output.txid))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_tx_size(&self) -> u64 {
        self.total_tx_size
    }

    pub fn transactions_updated(&self) -> u64 {
        self.transactions_updated
    }

    pub fn add_transactions_updated(&mut self, n: u64) {
        self.transactions_updated += n;
    }

    /// Estimated bytes of memory the pool is responsible for.
    pub fn dynamic_memory_usage(&self) -> u64 {
        self.cached_inner_usage
            + self.entries.len() as u64 * usage::INDEX_OVERHEAD_PER_ENTRY
            + self.next_tx.len() as u64 * usage::NEXT_TX_NODE_USAGE
            + self.deltas.len() as u64 * usage::DELTA_NODE_USAGE
    }

    pub(crate) fn cached_inner_usage(&self) -> u64 {
        self.cached_inner_usage
    }

    /// Iterate over all entries (arbitrary order).
    pub fn iter(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    /// Entries ordered by descendant score, best first.
    pub fn descendant_score_iter(&self) -> impl Iterator<Item = &MempoolEntry> + '_ {
        self.by_descendant_score
            .iter()
            .map(move |key| &self.entries[&key.txid])
    }

    /// Entries ordered by ancestor score, best first. This is the block
    /// assembler's base cursor.
    pub fn ancestor_score_iter(&self) -> impl Iterator<Item = &MempoolEntry> + '_ {
        self.by_ancestor_score
            .iter()
            .map(move |key| &self.entries[&key.txid])
    }

    /// Entries ordered by entry time, oldest first.
    pub fn entry_time_iter(&self) -> impl Iterator<Item = &MempoolEntry> + '_ {
        self.by_entry_time
            .iter()
            .map(move |(_, txid)| &self.entries[txid])
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    pub(crate) fn worst_descendant_score_txids(&self) -> Vec<TxId> {
        self.by_descendant_score.iter().rev().map(|k| k.txid).collect()
    }

    // ------------------------------------------------------------------
    // Fee estimation passthrough
    // ------------------------------------------------------------------

    /// Fee rate estimated to confirm within `target_blocks`.
    pub fn estimate_fee(&self, target_blocks: usize) -> FeeRate {
        self.estimator.estimate_fee(target_blocks)
    }

    /// Serialize fee-estimator state with its version framing.
    pub fn write_fee_estimates(&self) -> Result<Vec<u8>, MempoolError> {
        self.estimator
            .write()
            .map_err(|e| MempoolError::Serialization(e.to_string()))
    }

    /// Load fee-estimator state. Read failures are non-fatal: the error is
    /// logged and the current state kept.
    pub fn read_fee_estimates(&mut self, data: &[u8]) -> bool {
        match self.estimator.read(data) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "unable to read fee estimate data (non-fatal)");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Sanity checking
    // ------------------------------------------------------------------

    /// Full invariant reconciliation. Expensive; called from tests and
    /// behind a debug flag by the node. Panics on any inconsistency.
    ///
    /// Verifies the link graph against the spend map and raw inputs, the
    /// resolvability of every input, the aggregate sums, topological
    /// admissibility of the whole pool, and the accounting totals.
    pub fn check(&self, view: &dyn UtxoView) {
        let mut total_size_check = 0u64;
        let mut inner_usage_check = 0u64;
        let mut waiting: Vec<&MempoolEntry> = Vec::new();
        let mut available: HashSet<TxId> = HashSet::new();

        for entry in self.entries.values() {
            total_size_check += entry.tx_size();
            inner_usage_check += entry.dynamic_usage();

            let mut depends_on_pool = false;
            let mut parent_check: BTreeSet<TxId> = BTreeSet::new();
            for (index, input) in entry.tx().inputs.iter().enumerate() {
                if let Some(parent) = self.entries.get(&input.previous_output.txid) {
                    assert!(
                        (input.previous_output.index as usize) < parent.tx().outputs.len(),
                        "input references missing output"
                    );
                    depends_on_pool = true;
                    parent_check.insert(parent.txid());
                } else {
                    assert!(
                        view.get_output(&input.previous_output).is_some(),
                        "input {} resolves to neither pool nor view",
                        input.previous_output
                    );
                }
                let spend = self.next_tx.get(&input.previous_output);
                assert_eq!(
                    spend,
                    Some(&(entry.txid(), index as u32)),
                    "spend map missing input"
                );
            }
            assert_eq!(&parent_check, entry.parents(), "stored parents diverge");

            // Children must be exactly the spenders of our outputs.
            let mut child_check: BTreeSet<TxId> = BTreeSet::new();
            for index in 0..entry.tx().outputs.len() as u32 {
                let outpoint = OutPoint { txid: entry.txid(), index };
                if let Some((child, _)) = self.next_tx.get(&outpoint) {
                    child_check.insert(*child);
                }
            }
            assert_eq!(&child_check, entry.children(), "stored children diverge");

            // Aggregate soundness over the full closures.
            let descendants = self.descendants_of(&entry.txid());
            if entry.is_dirty() {
                assert_eq!(entry.count_with_descendants(), 1);
                assert_eq!(entry.size_with_descendants(), entry.tx_size());
                assert_eq!(entry.fees_with_descendants(), entry.fee());
            } else {
                let mut size = 0u64;
                let mut fees: Amount = 0;
                for d in &descendants {
                    size += self.entries[d].tx_size();
                    fees += self.entries[d].fee();
                }
                assert_eq!(entry.count_with_descendants(), descendants.len() as u64);
                assert_eq!(entry.size_with_descendants(), size);
                assert_eq!(entry.fees_with_descendants(), fees);
            }

            let ancestors = self.ancestors_of(&entry.txid());
            let mut anc_size = entry.tx_size();
            let mut anc_fees = entry.modified_fee();
            let mut anc_sigops = entry.sigops_cost();
            for a in &ancestors {
                anc_size += self.entries[a].tx_size();
                anc_fees += self.entries[a].modified_fee();
                anc_sigops += self.entries[a].sigops_cost();
            }
            assert_eq!(entry.count_with_ancestors(), ancestors.len() as u64 + 1);
            assert_eq!(entry.size_with_ancestors(), anc_size);
            assert_eq!(entry.mod_fees_with_ancestors(), anc_fees);
            assert_eq!(entry.sigops_with_ancestors(), anc_sigops);

            if depends_on_pool {
                waiting.push(entry);
            } else {
                available.insert(entry.txid());
            }
        }

        // Topological re-admission: every pending entry must eventually
        // have all its pool inputs available. The step counter bounds the
        // loop by the pigeonhole principle.
        let mut steps_since_admit = 0usize;
        let mut queue: std::collections::VecDeque<&MempoolEntry> = waiting.into();
        while let Some(entry) = queue.pop_front() {
            let ready = entry.tx().inputs.iter().all(|input| {
                !self.entries.contains_key(&input.previous_output.txid)
                    || available.contains(&input.previous_output.txid)
            });
            if ready {
                available.insert(entry.txid());
                steps_since_admit = 0;
            } else {
                queue.push_back(entry);
                steps_since_admit += 1;
                assert!(steps_since_admit <= queue.len(), "pool is not topologically sound");
            }
        }

        // Spend map bijection with (entry, input) pairs.
        let input_count: usize = self.entries.values().map(|e| e.tx().inputs.len()).sum();
        assert_eq!(self.next_tx.len(), input_count, "spend map size mismatch");
        for (outpoint, (txid, index)) in &self.next_tx {
            let entry = self.entries.get(txid).expect("spend map references ghost");
            assert_eq!(
                entry.tx().inputs[*index as usize].previous_output,
                *outpoint,
                "spend map points at wrong input"
            );
        }

        assert_eq!(self.total_tx_size, total_size_check, "total size diverges");
        assert_eq!(self.cached_inner_usage, inner_usage_check, "inner usage diverges");
    }
}

/// A [`UtxoView`] that layers unconfirmed pool outputs over a backing
/// view, so validation can spend outputs of other pool transactions.
pub struct MempoolUtxoView<'a, V: UtxoView> {
    base: &'a V,
    pool: &'a Mempool,
}

impl<'a, V: UtxoView> MempoolUtxoView<'a, V> {
    pub fn new(base: &'a V, pool: &'a Mempool) -> Self {
        Self { base, pool }
    }
}

impl<V: UtxoView> UtxoView for MempoolUtxoView<'_, V> {
    fn get_output(&self, outpoint: &OutPoint) -> Option<TxOutput> {
        if let Some(entry) = self.pool.entry(&outpoint.txid) {
            return entry.tx().outputs.get(outpoint.index as usize).cloned();
        }
        self.base.get_output(outpoint)
    }

    fn output_height(&self, outpoint: &OutPoint) -> Option<u64> {
        if self.pool.exists(&outpoint.txid) {
            return Some(MEMPOOL_HEIGHT);
        }
        self.base.output_height(outpoint)
    }

    fn is_coinbase_output(&self, outpoint: &OutPoint) -> bool {
        if self.pool.exists(&outpoint.txid) {
            return false;
        }
        self.base.is_coinbase_output(outpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::constants::COIN;
    use ember_core::types::{Hash256, TxInput};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Backing view seeded with confirmed outputs for funding outpoints.
    #[derive(Default)]
    struct TestView {
        outputs: HashMap<OutPoint, TxOutput>,
    }

    impl TestView {
        fn with_outpoints(outpoints: &[OutPoint]) -> Self {
            let mut outputs = HashMap::new();
            for op in outpoints {
                outputs.insert(*op, TxOutput { value: 50 * COIN, pubkey_hash: Hash256::ZERO });
            }
            Self { outputs }
        }
    }

    impl UtxoView for TestView {
        fn get_output(&self, outpoint: &OutPoint) -> Option<TxOutput> {
            self.outputs.get(outpoint).cloned()
        }
        fn output_height(&self, outpoint: &OutPoint) -> Option<u64> {
            self.outputs.get(outpoint).map(|_| 1)
        }
        fn is_coinbase_output(&self, _outpoint: &OutPoint) -> bool {
            false
        }
    }

    fn outpoint(seed: u8, index: u32) -> OutPoint {
        OutPoint { txid: Hash256([seed; 32]), index }
    }

    fn make_tx(outpoints: &[OutPoint], outputs: u32, lock_time: u64) -> Arc<Transaction> {
        Arc::new(Transaction {
            version: 1,
            inputs: outpoints
                .iter()
                .map(|op| TxInput {
                    previous_output: *op,
                    signature: vec![0; 64],
                    public_key: vec![0; 32],
                    witness: Vec::new(),
                })
                .collect(),
            outputs: (0..outputs)
                .map(|i| TxOutput {
                    value: COIN,
                    pubkey_hash: Hash256([i as u8 + 1; 32]),
                })
                .collect(),
            lock_time,
        })
    }

    fn make_pool() -> Mempool {
        let options = MempoolOptions { trim_seed: Some(7), ..Default::default() };
        Mempool::new(options, NotificationQueue::new())
    }

    /// Build and insert an entry, computing ancestors without limits.
    fn add(pool: &mut Mempool, tx: &Arc<Transaction>, fee: Amount, time: u64) -> TxId {
        let no_inputs = pool.has_no_inputs_of(tx);
        let entry = MempoolEntry::new(Arc::clone(tx), fee, time, 0.0, 100, no_inputs).unwrap();
        let txid = entry.txid();
        pool.add_unchecked(entry);
        txid
    }

    // ------------------------------------------------------------------
    // Chain admission (aggregate bookkeeping)
    // ------------------------------------------------------------------

    #[test]
    fn chain_admission_updates_both_aggregates() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 2, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);

        let txid_a = tx_a.txid().unwrap();
        let tx_b = make_tx(&[OutPoint { txid: txid_a, index: 0 }], 1, 0);
        let b = add(&mut pool, &tx_b, 2_000, 20);

        let size_a = pool.entry(&a).unwrap().tx_size();
        let size_b = pool.entry(&b).unwrap().tx_size();

        let entry_a = pool.entry(&a).unwrap();
        assert_eq!(entry_a.count_with_descendants(), 2);
        assert_eq!(entry_a.fees_with_descendants(), 3_000);
        assert_eq!(entry_a.size_with_descendants(), size_a + size_b);
        assert_eq!(entry_a.children().len(), 1);

        let entry_b = pool.entry(&b).unwrap();
        assert_eq!(entry_b.count_with_ancestors(), 2);
        assert_eq!(entry_b.size_with_ancestors(), size_a + size_b);
        assert_eq!(entry_b.mod_fees_with_ancestors(), 3_000);
        assert_eq!(entry_b.parents().iter().copied().collect::<Vec<_>>(), vec![a]);

        pool.check(&TestView::with_outpoints(&[outpoint(1, 0)]));
    }

    #[test]
    fn grandchild_counts_toward_grandparent() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);
        let tx_b = make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0);
        let b = add(&mut pool, &tx_b, 1_000, 20);
        let tx_c = make_tx(&[OutPoint { txid: b, index: 0 }], 1, 0);
        let c = add(&mut pool, &tx_c, 1_000, 30);

        assert_eq!(pool.entry(&a).unwrap().count_with_descendants(), 3);
        assert_eq!(pool.entry(&c).unwrap().count_with_ancestors(), 3);
        assert_eq!(pool.ancestors_of(&c).len(), 2);
        assert_eq!(pool.descendants_of(&a).len(), 3);
        pool.check(&TestView::with_outpoints(&[outpoint(1, 0)]));
    }

    #[test]
    #[should_panic(expected = "already spent")]
    fn conflicting_add_is_a_programming_error() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        add(&mut pool, &tx_a, 1_000, 10);
        // Different tx spending the same outpoint: the caller was supposed
        // to reject this before add_unchecked.
        let tx_c = make_tx(&[outpoint(1, 0)], 1, 99);
        add(&mut pool, &tx_c, 2_000, 20);
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    #[test]
    fn recursive_removal_restores_state() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 2, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);

        let len_before = pool.len();
        let size_before = pool.total_tx_size();
        let usage_before = pool.dynamic_memory_usage();

        let tx_b = make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0);
        let b = add(&mut pool, &tx_b, 2_000, 20);
        let removed = pool.remove_recursive(&b, RemovalReason::Replaced);
        assert_eq!(removed.len(), 1);

        assert_eq!(pool.len(), len_before);
        assert_eq!(pool.total_tx_size(), size_before);
        assert_eq!(pool.dynamic_memory_usage(), usage_before);
        let entry_a = pool.entry(&a).unwrap();
        assert_eq!(entry_a.count_with_descendants(), 1);
        assert_eq!(entry_a.fees_with_descendants(), 1_000);
        assert!(entry_a.children().is_empty());
        pool.check(&TestView::with_outpoints(&[outpoint(1, 0)]));
    }

    #[test]
    fn recursive_removal_takes_descendants() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);
        let tx_b = make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0);
        add(&mut pool, &tx_b, 1_000, 20);

        let removed = pool.remove_recursive(&a, RemovalReason::Replaced);
        assert_eq!(removed.len(), 2);
        assert!(pool.is_empty());
        assert_eq!(pool.total_tx_size(), 0);
        pool.check(&TestView::default());
    }

    #[test]
    fn block_removal_keeps_child_with_fresh_ancestors() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 2, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);
        let tx_b = make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0);
        let b = add(&mut pool, &tx_b, 2_000, 20);

        let (removed, conflicts) = pool.remove_for_block(&[(*tx_a).clone()], 101).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(conflicts.is_empty());

        assert!(!pool.exists(&a));
        let entry_b = pool.entry(&b).unwrap();
        assert!(entry_b.parents().is_empty());
        assert_eq!(entry_b.count_with_ancestors(), 1);
        assert_eq!(entry_b.size_with_ancestors(), entry_b.tx_size());
        assert_eq!(entry_b.mod_fees_with_ancestors(), 2_000);
        pool.check(&TestView::with_outpoints(&[OutPoint { txid: a, index: 0 }]));
    }

    #[test]
    fn block_removal_evicts_conflicts() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);

        // The block confirms a different spend of the same outpoint.
        let block_tx = (*make_tx(&[outpoint(1, 0)], 1, 99)).clone();
        let (removed, conflicts) = pool.remove_for_block(&[block_tx], 101).unwrap();
        assert!(removed.is_empty());
        assert_eq!(conflicts.len(), 1);
        assert!(!pool.exists(&a));
        assert!(pool.is_empty());
    }

    #[test]
    fn conflict_removal_empties_pool() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        add(&mut pool, &tx_a, 1_000, 10);

        let tx_c = make_tx(&[outpoint(1, 0)], 1, 99);
        let removed = pool.remove_conflicts(&tx_c);
        assert_eq!(removed.len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn conflict_removal_is_recursive() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);
        let tx_b = make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0);
        add(&mut pool, &tx_b, 1_000, 20);

        let tx_c = make_tx(&[outpoint(1, 0)], 1, 99);
        let removed = pool.remove_conflicts(&tx_c);
        assert_eq!(removed.len(), 2);
        assert!(pool.is_empty());
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    #[test]
    fn expire_boundaries() {
        let mut pool = make_pool();
        let now = 1_000_000u64;
        add(&mut pool, &make_tx(&[outpoint(1, 0)], 1, 0), 1_000, now - 100);
        add(&mut pool, &make_tx(&[outpoint(2, 0)], 1, 0), 1_000, now);

        // Cutoff zero: nothing is older.
        assert_eq!(pool.expire(0), 0);
        assert_eq!(pool.len(), 2);

        // Cutoff past now: pool drains entirely.
        assert_eq!(pool.expire(now + 1), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn expire_with_configured_window_uses_options() {
        let options = MempoolOptions {
            expiry_secs: 1_000,
            trim_seed: Some(7),
            ..Default::default()
        };
        let mut pool = Mempool::new(options, NotificationQueue::new());
        add(&mut pool, &make_tx(&[outpoint(1, 0)], 1, 0), 1_000, 5_000);
        add(&mut pool, &make_tx(&[outpoint(2, 0)], 1, 0), 1_000, 9_500);

        // Window of 1000s at now=10_000 cuts at 9_000.
        assert_eq!(pool.expire_with_configured_window(10_000), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn expire_drags_newer_descendants() {
        let mut pool = make_pool();
        let now = 1_000_000u64;
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        let a = add(&mut pool, &tx_a, 1_000, now - 100);
        let tx_b = make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0);
        add(&mut pool, &tx_b, 1_000, now + 50);

        // Only A is past the cutoff, but B rides along.
        assert_eq!(pool.expire(now), 2);
        assert!(pool.is_empty());
    }

    // ------------------------------------------------------------------
    // Prioritisation
    // ------------------------------------------------------------------

    #[test]
    fn prioritise_updates_package_fees() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 2, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);
        let tx_b = make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0);
        let b = add(&mut pool, &tx_b, 2_000, 20);

        pool.prioritise(&a, 0.0, 500);

        assert_eq!(pool.entry(&a).unwrap().modified_fee(), 1_500);
        assert_eq!(pool.entry(&a).unwrap().fee(), 1_000);
        // The child's package fee sees the parent's delta.
        assert_eq!(pool.entry(&b).unwrap().mod_fees_with_ancestors(), 3_500);
        // The raw descendant aggregates do not.
        assert_eq!(pool.entry(&a).unwrap().fees_with_descendants(), 3_000);
        pool.check(&TestView::with_outpoints(&[outpoint(1, 0)]));
    }

    #[test]
    fn deltas_survive_removal_and_reapply() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);

        pool.prioritise(&a, 1.5, 700);
        pool.remove_recursive(&a, RemovalReason::Replaced);

        let mut priority = 0.0;
        let mut fee = 0;
        pool.apply_deltas(&a, &mut priority, &mut fee);
        assert_eq!(fee, 700);
        assert!((priority - 1.5).abs() < f64::EPSILON);

        // Re-adding applies the recorded fee delta.
        let a2 = add(&mut pool, &tx_a, 1_000, 30);
        assert_eq!(a2, a);
        assert_eq!(pool.entry(&a).unwrap().modified_fee(), 1_700);
    }

    #[test]
    fn clear_prioritisation_forgets() {
        let mut pool = make_pool();
        let txid = Hash256([9; 32]);
        pool.prioritise(&txid, 0.0, 700);
        pool.clear_prioritisation(&txid);
        let mut priority = 0.0;
        let mut fee = 0;
        pool.apply_deltas(&txid, &mut priority, &mut fee);
        assert_eq!(fee, 0);
    }

    // ------------------------------------------------------------------
    // Ancestor limits
    // ------------------------------------------------------------------

    #[test]
    fn ancestor_count_limit() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);
        let tx_b = make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0);
        let b = add(&mut pool, &tx_b, 1_000, 20);

        let tx_c = make_tx(&[OutPoint { txid: b, index: 0 }], 1, 0);
        let candidate = MempoolEntry::new(tx_c, 1_000, 30, 0.0, 100, false).unwrap();

        let limits = AncestorLimits { max_ancestors: 2, ..AncestorLimits::NONE };
        assert!(matches!(
            pool.calculate_ancestors(&candidate, &limits),
            Err(MempoolError::TooManyAncestors { limit: 2 })
        ));
        assert_eq!(
            pool.calculate_ancestors(&candidate, &AncestorLimits::NONE).unwrap().len(),
            2
        );
    }

    #[test]
    fn descendant_count_limit_guards_ancestors() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 3, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);
        add(&mut pool, &make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0), 1_000, 20);

        // A already has two entries in its descendant set (itself + child);
        // admitting another child would make three.
        let tx_c = make_tx(&[OutPoint { txid: a, index: 1 }], 1, 0);
        let candidate = MempoolEntry::new(tx_c, 1_000, 30, 0.0, 100, false).unwrap();
        let limits = AncestorLimits { max_descendants: 2, ..AncestorLimits::NONE };
        assert!(matches!(
            pool.calculate_ancestors(&candidate, &limits),
            Err(MempoolError::TooManyDescendants { .. })
        ));
    }

    #[test]
    fn ancestor_size_limit() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);
        let size_a = pool.entry(&a).unwrap().tx_size();

        let tx_b = make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0);
        let candidate = MempoolEntry::new(tx_b, 1_000, 20, 0.0, 100, false).unwrap();
        let limits = AncestorLimits {
            max_ancestor_size: size_a, // candidate pushes past this
            ..AncestorLimits::NONE
        };
        assert!(matches!(
            pool.calculate_ancestors(&candidate, &limits),
            Err(MempoolError::ExceedsAncestorSize { .. })
        ));
    }

    // ------------------------------------------------------------------
    // Index ordering
    // ------------------------------------------------------------------

    #[test]
    fn descendant_score_orders_best_first() {
        let mut pool = make_pool();
        add(&mut pool, &make_tx(&[outpoint(1, 0)], 1, 0), 1_000, 10);
        add(&mut pool, &make_tx(&[outpoint(2, 0)], 1, 0), 9_000, 20);
        add(&mut pool, &make_tx(&[outpoint(3, 0)], 1, 0), 5_000, 30);

        let fees: Vec<Amount> = pool.descendant_score_iter().map(|e| e.fee()).collect();
        assert_eq!(fees, vec![9_000, 5_000, 1_000]);
    }

    #[test]
    fn descendant_score_ties_prefer_older() {
        let mut pool = make_pool();
        add(&mut pool, &make_tx(&[outpoint(1, 0)], 1, 0), 1_000, 50);
        add(&mut pool, &make_tx(&[outpoint(2, 0)], 1, 0), 1_000, 10);

        let times: Vec<u64> = pool.descendant_score_iter().map(|e| e.time()).collect();
        assert_eq!(times, vec![10, 50]);
    }

    #[test]
    fn ancestor_score_is_package_aware() {
        let mut pool = make_pool();
        // Low-fee parent, high-fee child: the child's package rate is
        // dragged down by the parent.
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        let a = add(&mut pool, &tx_a, 100, 10);
        let tx_b = make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0);
        let b = add(&mut pool, &tx_b, 8_000, 20);
        // A standalone tx whose clean rate beats B's package rate.
        let c = add(&mut pool, &make_tx(&[outpoint(2, 0)], 1, 0), 5_000, 30);

        let order: Vec<TxId> = pool.ancestor_score_iter().map(|e| e.txid()).collect();
        // B's package includes A, so C's clean rate wins.
        assert_eq!(order[0], c);
        // B's effective package rate still beats A alone.
        let pos_a = order.iter().position(|t| *t == a).unwrap();
        let pos_b = order.iter().position(|t| *t == b).unwrap();
        assert!(pos_b < pos_a);

        // Ordered iteration yields non-increasing effective rates.
        let keys: Vec<(Amount, u64)> = pool
            .ancestor_score_iter()
            .map(|e| {
                if cmp_feerate(
                    e.mod_fees_with_ancestors(),
                    e.size_with_ancestors(),
                    e.modified_fee(),
                    e.tx_size(),
                ) == Ordering::Less
                {
                    (e.mod_fees_with_ancestors(), e.size_with_ancestors())
                } else {
                    (e.modified_fee(), e.tx_size())
                }
            })
            .collect();
        for pair in keys.windows(2) {
            assert_ne!(
                cmp_feerate(pair[0].0, pair[0].1, pair[1].0, pair[1].1),
                Ordering::Less
            );
        }
    }

    #[test]
    fn entry_time_orders_oldest_first() {
        let mut pool = make_pool();
        add(&mut pool, &make_tx(&[outpoint(1, 0)], 1, 0), 1_000, 30);
        add(&mut pool, &make_tx(&[outpoint(2, 0)], 1, 0), 1_000, 10);
        let times: Vec<u64> = pool.entry_time_iter().map(|e| e.time()).collect();
        assert_eq!(times, vec![10, 30]);
    }

    // ------------------------------------------------------------------
    // Reorg repair
    // ------------------------------------------------------------------

    #[test]
    fn block_disconnect_relinks_children() {
        let mut pool = make_pool();
        // C spends the (previously confirmed) output of P.
        let tx_p = make_tx(&[outpoint(1, 0)], 1, 0);
        let p = tx_p.txid().unwrap();
        let tx_c = make_tx(&[OutPoint { txid: p, index: 0 }], 1, 0);
        let c = add(&mut pool, &tx_c, 2_000, 20);

        // The block containing P is disconnected; P re-enters the pool.
        let p2 = add(&mut pool, &tx_p, 1_000, 30);
        assert_eq!(p2, p);
        // Links are not yet rebuilt.
        assert!(pool.entry(&p).unwrap().children().is_empty());

        pool.update_from_block_disconnect(&[p]);

        let entry_p = pool.entry(&p).unwrap();
        assert!(entry_p.children().contains(&c));
        assert_eq!(entry_p.count_with_descendants(), 2);
        assert_eq!(entry_p.fees_with_descendants(), 3_000);
        assert!(!entry_p.is_dirty());

        let entry_c = pool.entry(&c).unwrap();
        assert!(entry_c.parents().contains(&p));
        assert_eq!(entry_c.count_with_ancestors(), 2);
        assert_eq!(entry_c.mod_fees_with_ancestors(), 3_000);
        pool.check(&TestView::with_outpoints(&[outpoint(1, 0)]));
    }

    #[test]
    fn over_budget_disconnect_marks_dirty() {
        let mut pool = make_pool();
        // A long chain of descendants, all spending in sequence.
        let tx_p = make_tx(&[outpoint(1, 0)], 1, 0);
        let p = tx_p.txid().unwrap();
        let mut prev = p;
        for i in 0..110u64 {
            let tx = make_tx(&[OutPoint { txid: prev, index: 0 }], 1, 0);
            prev = add(&mut pool, &tx, 1_000, 20 + i);
        }

        let p2 = add(&mut pool, &tx_p, 1_000, 10);
        assert_eq!(p2, p);
        pool.update_from_block_disconnect(&[p]);

        // More than 100 descendants to visit: the entry goes dirty and its
        // aggregates read as self-only.
        let entry_p = pool.entry(&p).unwrap();
        assert!(entry_p.is_dirty());
        assert_eq!(entry_p.count_with_descendants(), 1);
        assert_eq!(entry_p.fees_with_descendants(), 1_000);
    }

    // ------------------------------------------------------------------
    // Coinbase maturity sweep
    // ------------------------------------------------------------------

    #[test]
    fn premature_coinbase_spends_are_swept() {
        let mut pool = make_pool();
        let coinbase_out = outpoint(1, 0);
        let spend = make_tx(&[coinbase_out], 1, 0);
        let s = add(&mut pool, &spend, 1_000, 10);
        let survivor = add(&mut pool, &make_tx(&[outpoint(2, 0)], 1, 0), 1_000, 20);

        struct CoinbaseView;
        impl UtxoView for CoinbaseView {
            fn get_output(&self, op: &OutPoint) -> Option<TxOutput> {
                Some(TxOutput {
                    value: 50 * COIN,
                    pubkey_hash: Hash256::ZERO,
                })
                .filter(|_| op.index == 0)
            }
            fn output_height(&self, _op: &OutPoint) -> Option<u64> {
                Some(100)
            }
            fn is_coinbase_output(&self, op: &OutPoint) -> bool {
                op.txid == Hash256([1; 32])
            }
        }

        // Height 150: the coinbase at height 100 is 50 deep, not mature.
        pool.remove_premature_coinbase_spends(&CoinbaseView, 150);
        assert!(!pool.exists(&s));
        assert!(pool.exists(&survivor));

        // Re-add and sweep at a mature height: nothing happens.
        let s2 = add(&mut pool, &spend, 1_000, 30);
        pool.remove_premature_coinbase_spends(&CoinbaseView, 300);
        assert!(pool.exists(&s2));
    }

    // ------------------------------------------------------------------
    // Queries and accounting
    // ------------------------------------------------------------------

    #[test]
    fn query_surface() {
        let mut pool = make_pool();
        assert!(pool.is_empty());
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);

        assert!(pool.exists(&a));
        assert!(pool.lookup(&a).is_some());
        assert!(pool.lookup(&Hash256::ZERO).is_none());
        assert_eq!(pool.query_hashes(), vec![a]);
        assert_eq!(pool.len(), 1);
        assert!(pool.total_tx_size() > 0);
        assert!(pool.dynamic_memory_usage() > 0);

        assert!(!pool.has_no_inputs_of(&make_tx(&[OutPoint { txid: a, index: 0 }], 1, 0)));
        assert!(pool.has_no_inputs_of(&make_tx(&[outpoint(9, 0)], 1, 0)));
    }

    #[test]
    fn transactions_updated_counts_mutations() {
        let mut pool = make_pool();
        assert_eq!(pool.transactions_updated(), 0);
        let a = add(&mut pool, &make_tx(&[outpoint(1, 0)], 1, 0), 1_000, 10);
        assert_eq!(pool.transactions_updated(), 1);
        pool.remove_recursive(&a, RemovalReason::Replaced);
        assert_eq!(pool.transactions_updated(), 2);
        pool.add_transactions_updated(5);
        assert_eq!(pool.transactions_updated(), 7);
    }

    #[test]
    fn clear_resets_accounting() {
        let mut pool = make_pool();
        add(&mut pool, &make_tx(&[outpoint(1, 0)], 1, 0), 1_000, 10);
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.total_tx_size(), 0);
        assert_eq!(pool.cached_inner_usage(), 0);
    }

    #[test]
    fn mempool_view_layers_pool_outputs() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 2, 0);
        let a = add(&mut pool, &tx_a, 1_000, 10);

        let base = TestView::with_outpoints(&[outpoint(7, 3)]);
        let view = MempoolUtxoView::new(&base, &pool);

        // Pool output resolves, at the in-pool sentinel height.
        let pool_op = OutPoint { txid: a, index: 1 };
        assert!(view.get_output(&pool_op).is_some());
        assert_eq!(view.output_height(&pool_op), Some(MEMPOOL_HEIGHT));
        assert!(!view.is_coinbase_output(&pool_op));
        // Out-of-range pool index does not.
        assert!(view.get_output(&OutPoint { txid: a, index: 5 }).is_none());
        // Base outputs still resolve.
        assert!(view.get_output(&outpoint(7, 3)).is_some());
        assert!(view.get_output(&outpoint(8, 0)).is_none());
    }

    #[test]
    fn fee_estimate_surface_round_trips() {
        let mut pool = make_pool();
        let tx_a = make_tx(&[outpoint(1, 0)], 1, 0);
        add(&mut pool, &tx_a, 100_000, 10);
        pool.remove_for_block(&[(*tx_a).clone()], 101).unwrap();

        let bytes = pool.write_fee_estimates().unwrap();
        let mut other = make_pool();
        assert!(other.read_fee_estimates(&bytes));
        assert!(!other.read_fee_estimates(&[0xFF; 3]));
    }
}

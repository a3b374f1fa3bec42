//! Size-limit eviction: staging whole sub-forests from the worst end.
//!
//! Candidates come off the descendant-score index in ascending order, so
//! the cheapest packages go first. A sampling throttle skips nine of ten
//! candidates to bound the work any single invocation performs; skipped
//! candidates get reconsidered on later calls. Every staged candidate
//! brings its entire descendant closure, keeping the staged set removable
//! without orphaning anything.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use rand::Rng;
use tracing::info;

use ember_core::amount::{cmp_feerate, Amount, FeeRate};
use ember_core::error::MempoolError;
use ember_core::types::{Transaction, TxId};
use ember_events::RemovalReason;

use crate::entry::MempoolEntry;
use crate::pool::Mempool;

/// Baseline BFS iteration allowance; each failed candidate widens the
/// budget by ten.
const TRIM_ITER_EXTRA: u64 = 50;

/// Give up after this many failed candidates.
const MAX_TRIM_FAILURES: u64 = 10;

/// Outcome of a staging pass.
#[derive(Clone, Debug)]
pub struct TrimResult {
    /// Whether the staged set frees at least the requested usage.
    pub reached_target: bool,
    /// Entries to evict; closed under descendants.
    pub stage: BTreeSet<TxId>,
    /// Total fees of the staged entries.
    pub fees_removed: Amount,
}

impl Mempool {
    /// Stage evictions to make room for `incoming` under `target_usage`
    /// bytes of pool memory.
    ///
    /// No ancestor of the incoming transaction is ever staged: its in-pool
    /// parents form the protect set, and any closure touching a protected
    /// entry is abandoned, which transitively shields the rest of its
    /// ancestry. The staged fees may not exceed what the incoming
    /// transaction pays (minus `fees_reserved`), so relay bandwidth is
    /// never free.
    pub fn stage_trim_to_size(
        &mut self,
        target_usage: u64,
        incoming: &MempoolEntry,
        fees_reserved: Amount,
    ) -> TrimResult {
        let projected = self.dynamic_memory_usage() + incoming.dynamic_usage();
        let size_to_trim = projected.saturating_sub(target_usage);
        if size_to_trim == 0 {
            return TrimResult {
                reached_target: true,
                stage: BTreeSet::new(),
                fees_removed: 0,
            };
        }

        let protect: HashSet<TxId> = incoming
            .tx()
            .inputs
            .iter()
            .map(|input| input.previous_output.txid)
            .filter(|txid| self.exists(txid))
            .collect();

        self.trim_worst(
            size_to_trim,
            &protect,
            fees_reserved,
            incoming.tx_size(),
            incoming.modified_fee(),
            true,
            TRIM_ITER_EXTRA,
        )
    }

    /// Admission-time trim against the configured memory budget.
    pub fn trim_to_configured_size(
        &mut self,
        incoming: &MempoolEntry,
        fees_reserved: Amount,
    ) -> Result<(Vec<Arc<Transaction>>, Amount), MempoolError> {
        let target = self.options().max_usage;
        self.trim_to_size(target, incoming, fees_reserved)
    }

    /// Stage and apply evictions for `incoming`; the whole operation is
    /// rejected (nothing evicted) when the target cannot be met.
    pub fn trim_to_size(
        &mut self,
        target_usage: u64,
        incoming: &MempoolEntry,
        fees_reserved: Amount,
    ) -> Result<(Vec<Arc<Transaction>>, Amount), MempoolError> {
        let result = self.stage_trim_to_size(target_usage, incoming, fees_reserved);
        if !result.reached_target {
            return Err(MempoolError::TrimFailed);
        }
        let removed = self.remove_staged(&result.stage, Some(RemovalReason::SizeLimit));
        Ok((removed, result.fees_removed))
    }

    /// Periodic trim with no admission pressure: clears unmineable tails
    /// whose fee rate falls below `multiplier` times the relay floor.
    /// Best effort; partial progress is applied.
    pub fn surplus_trim(
        &mut self,
        multiplier: i64,
        min_relay_rate: FeeRate,
        usage_to_trim: u64,
    ) -> usize {
        let fee_to_use = min_relay_rate.fee_for(usage_to_trim).saturating_mul(multiplier);
        let result = self.trim_worst(
            usage_to_trim,
            &HashSet::new(),
            0,
            usage_to_trim,
            fee_to_use,
            false,
            TRIM_ITER_EXTRA,
        );
        let removed = self
            .remove_staged(&result.stage, Some(RemovalReason::SizeLimit))
            .len();
        if removed > 0 {
            info!(removed, fees = result.fees_removed, "surplus-trimmed mempool tail");
        }
        removed
    }

    /// Core staging loop shared by admission trims and surplus trims.
    ///
    /// Walks candidates worst-first, skipping each independently with
    /// probability 9/10, and stops as soon as a candidate's score reaches
    /// the `fee_to_use / size_to_use` benchmark: later candidates only
    /// score better, so none of them may be evicted either.
    fn trim_worst(
        &mut self,
        size_to_trim: u64,
        protect: &HashSet<TxId>,
        fees_reserved: Amount,
        size_to_use: u64,
        fee_to_use: Amount,
        must_trim_all: bool,
        iter_extra: u64,
    ) -> TrimResult {
        let mut stage: BTreeSet<TxId> = BTreeSet::new();
        let mut fees_removed: Amount = 0;
        let mut usage_removed: u64 = 0;
        let mut fails: u64 = 0;
        let mut iters: u64 = 0;

        let candidates = self.worst_descendant_score_txids();
        for txid in candidates {
            if usage_removed >= size_to_trim || self.shutdown_requested() {
                break;
            }
            if stage.contains(&txid) {
                continue;
            }
            if self.trim_rng.gen_range(0..10) != 0 {
                continue;
            }
            let candidate = match self.entry(&txid) {
                Some(entry) => entry,
                None => continue,
            };

            // Candidate score is its effective descendant score; once it
            // reaches the benchmark rate, nothing further is evictable.
            let (cand_fees, cand_size) = descendant_score_pair(candidate);
            if cmp_feerate(cand_fees, cand_size, fee_to_use, size_to_use) != Ordering::Less {
                break;
            }

            // Breadth-first walk of the candidate's descendant closure,
            // aborting on any protected member, fee-budget overrun, or
            // iteration overrun.
            let mut good = true;
            let mut closure: Vec<TxId> = Vec::new();
            let mut seen: BTreeSet<TxId> = BTreeSet::new();
            let mut pending: VecDeque<TxId> = VecDeque::new();
            pending.push_back(txid);
            seen.insert(txid);
            let mut sub_fee: Amount = 0;
            let mut sub_size: u64 = 0;
            let mut sub_usage: u64 = 0;

            while let Some(hash) = pending.pop_front() {
                iters += 1;
                if iters > iter_extra + 10 * (fails + 1) {
                    good = false;
                    break;
                }
                if protect.contains(&hash) {
                    good = false;
                    break;
                }
                let entry = self.entry(&hash).expect("closure member in pool");
                sub_fee = sub_fee.saturating_add(entry.fee());
                sub_size += entry.tx_size();
                sub_usage += entry.dynamic_usage();
                closure.push(hash);

                if fees_removed
                    .saturating_add(fees_reserved)
                    .saturating_add(sub_fee)
                    > fee_to_use
                {
                    good = false;
                    break;
                }

                for child in entry.children().clone() {
                    if seen.insert(child) && !stage.contains(&child) {
                        pending.push_back(child);
                    }
                }
            }

            // The staged sub-forest must itself score below the benchmark.
            if good && cmp_feerate(sub_fee, sub_size, fee_to_use, size_to_use) == Ordering::Greater
            {
                good = false;
            }

            if good {
                stage.extend(closure);
                fees_removed = fees_removed.saturating_add(sub_fee);
                usage_removed += sub_usage;
            } else {
                fails += 1;
                if fails > MAX_TRIM_FAILURES {
                    break;
                }
            }
        }

        let reached_target = usage_removed >= size_to_trim;
        if must_trim_all && !reached_target {
            info!(
                staged = stage.len(),
                usage_removed, size_to_trim, "trim could not reach target"
            );
        }
        TrimResult { reached_target, stage, fees_removed }
    }
}

/// The `(fees, size)` pair behind an entry's descendant score:
/// whichever of the self rate and the with-descendants rate is higher.
fn descendant_score_pair(entry: &MempoolEntry) -> (Amount, u64) {
    if cmp_feerate(
        entry.fees_with_descendants(),
        entry.size_with_descendants(),
        entry.fee(),
        entry.tx_size(),
    ) == Ordering::Greater
    {
        (entry.fees_with_descendants(), entry.size_with_descendants())
    } else {
        (entry.fee(), entry.tx_size())
    }
}

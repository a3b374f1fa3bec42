//! Ancestor-package block template construction.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use ember_core::amount::{cmp_feerate, Amount};
use ember_core::block_check::{check_block, witness_commitment};
use ember_core::constants::{
    MAX_BLOCK_SERIALIZED_SIZE, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT, MAX_COINBASE_DATA,
    COINBASE_FLAGS, WITNESS_SCALE_FACTOR,
};
use ember_core::error::MinerError;
use ember_core::merkle;
use ember_core::reward::block_subsidy;
use ember_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxId, TxInput, TxOutput};
use ember_events::ShutdownFlag;
use ember_mempool::{Mempool, MempoolEntry};

use crate::options::AssemblerOptions;

/// Recently received means younger than this many seconds.
const RECENT_TX_THRESHOLD: u64 = 10;

/// Stop trying once this many packages failed in a row near a full block.
const MAX_CONSECUTIVE_FAILURES: u64 = 1_000;

/// Weight reserved up front for the coinbase transaction.
const COINBASE_RESERVED_WEIGHT: u64 = 4_000;

/// Serialized bytes reserved up front for the coinbase transaction.
const COINBASE_RESERVED_SIZE: u64 = 1_000;

/// Sig-op cost reserved up front for the coinbase transaction.
const COINBASE_RESERVED_SIGOPS: i64 = 400;

/// Chain-tip context the assembler builds against. The caller holds the
/// chain lock while producing this and keeps both locks for the whole
/// assembly call.
#[derive(Clone, Copy, Debug)]
pub struct TipInfo {
    /// Height of the current tip; the template is for `height + 1`.
    pub height: u64,
    /// Hash of the current tip header.
    pub hash: Hash256,
    /// Median time past of the tip, the lock-time cutoff.
    pub median_time_past: u64,
    /// Adjusted current time.
    pub time: u64,
    /// Difficulty target for the next block.
    pub next_bits: u32,
    /// Consensus-computed header version for the next block.
    pub default_version: u32,
}

/// A finished block template.
#[derive(Clone, Debug)]
pub struct BlockTemplate {
    pub block: Block,
    /// Per-transaction fees; slot 0 holds minus the total collected fees,
    /// since the coinbase consumes them.
    pub fees: Vec<Amount>,
    /// Per-transaction sig-op costs.
    pub sigops: Vec<i64>,
    /// Height this template is valid at.
    pub height: u64,
}

/// An entry whose effective ancestor aggregates shrank because some of
/// its ancestors are already in the block under construction.
#[derive(Clone, Copy, Debug)]
struct ModifiedEntry {
    size_with_ancestors: u64,
    mod_fees_with_ancestors: Amount,
    sigops_with_ancestors: i64,
}

/// Ancestor-score key over the *effective* aggregates; best first, ties
/// to the lower txid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ScoreKey {
    fees: Amount,
    size: u64,
    txid: TxId,
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_feerate(other.fees, other.size, self.fees, self.size)
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The min-of-self-and-package rule behind ancestor scoring.
fn score_key(entry: &MempoolEntry, size: u64, fees: Amount) -> ScoreKey {
    let use_package =
        cmp_feerate(fees, size, entry.modified_fee(), entry.tx_size()) == Ordering::Less;
    let (fees, size) = if use_package {
        (fees, size)
    } else {
        (entry.modified_fee(), entry.tx_size())
    };
    ScoreKey { fees, size, txid: entry.txid() }
}

/// Running totals for the block under construction.
struct WorkingState {
    txs: Vec<Arc<Transaction>>,
    fees: Vec<Amount>,
    sigops: Vec<i64>,
    in_block: HashSet<TxId>,
    block_weight: u64,
    block_size: u64,
    block_sigops: i64,
    total_fees: Amount,
}

/// Assembles fee-optimal block templates from a mempool snapshot.
pub struct BlockAssembler {
    options: AssemblerOptions,
    need_size_accounting: bool,
    shutdown: ShutdownFlag,
}

impl BlockAssembler {
    /// Build an assembler, clamping the configured resource targets to
    /// sane bounds.
    pub fn new(mut options: AssemblerOptions) -> Self {
        options.max_weight = options.max_weight.clamp(4_000, MAX_BLOCK_WEIGHT - 4_000);
        options.max_size = options.max_size.clamp(1_000, MAX_BLOCK_SERIALIZED_SIZE - 1_000);
        let need_size_accounting = options.max_size < MAX_BLOCK_SERIALIZED_SIZE - 1_000;
        Self {
            options,
            need_size_accounting,
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn set_shutdown_flag(&mut self, flag: ShutdownFlag) {
        self.shutdown = flag;
    }

    pub fn options(&self) -> &AssemblerOptions {
        &self.options
    }

    /// Produce a template on top of `tip`, paying collected fees and the
    /// height subsidy to `coinbase_pubkey_hash`.
    ///
    /// The returned template has already passed the structural validity
    /// predicate; a failure there means the selection logic violated its
    /// own limits and surfaces as [`MinerError::TemplateInvalid`].
    pub fn create_block_template(
        &self,
        tip: &TipInfo,
        pool: &Mempool,
        coinbase_pubkey_hash: Hash256,
        include_witness: bool,
    ) -> Result<BlockTemplate, MinerError> {
        let height = tip.height + 1;
        let locktime_cutoff = tip.median_time_past;

        let mut state = WorkingState {
            txs: Vec::new(),
            fees: Vec::new(),
            sigops: Vec::new(),
            in_block: HashSet::new(),
            block_weight: COINBASE_RESERVED_WEIGHT,
            block_size: COINBASE_RESERVED_SIZE,
            block_sigops: COINBASE_RESERVED_SIGOPS,
            total_fees: 0,
        };

        let (packages_selected, descendants_updated) =
            self.add_package_txs(&mut state, pool, height, locktime_cutoff, tip.time, include_witness);

        // Coinbase: one null-prevout input carrying height, extra nonce
        // zero, and the miner tag; one output collecting subsidy and fees.
        let mut coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                signature: coinbase_data(height, 0)?,
                public_key: Vec::new(),
                witness: Vec::new(),
            }],
            outputs: vec![TxOutput {
                value: block_subsidy(height) + state.total_fees,
                pubkey_hash: coinbase_pubkey_hash,
            }],
            lock_time: 0,
        };

        let mut transactions: Vec<Transaction> = Vec::with_capacity(state.txs.len() + 1);
        transactions.push(coinbase.clone());
        transactions.extend(state.txs.iter().map(|tx| (**tx).clone()));

        // Commit to witness data when any selected transaction carries it.
        if transactions[1..].iter().any(Transaction::has_witness) {
            let probe = Block {
                header: null_header(),
                transactions: transactions.clone(),
            };
            let commitment = witness_commitment(&probe)
                .map_err(|e| MinerError::Serialization(e.to_string()))?;
            coinbase.outputs.push(TxOutput { value: 0, pubkey_hash: commitment });
            transactions[0] = coinbase;
        }

        let txids = collect_txids(&transactions)?;
        let version = match (self.options.block_version, self.options.network.mine_blocks_on_demand()) {
            (Some(version), true) => version,
            _ => tip.default_version,
        };
        let header = BlockHeader {
            version,
            prev_hash: tip.hash,
            merkle_root: merkle::merkle_root(&txids),
            timestamp: tip.time.max(tip.median_time_past + 1) as u32,
            bits: tip.next_bits,
            nonce: 0,
        };
        let block = Block { header, transactions };

        let mut fees = Vec::with_capacity(state.fees.len() + 1);
        fees.push(-state.total_fees);
        fees.extend(state.fees);
        let mut sigops = Vec::with_capacity(state.sigops.len() + 1);
        sigops.push(block.transactions[0].sigop_cost());
        sigops.extend(state.sigops);

        let serialized_size = block
            .serialized_size()
            .map_err(|e| MinerError::Serialization(e.to_string()))?;
        let block_weight = block
            .weight()
            .map_err(|e| MinerError::Serialization(e.to_string()))?;
        info!(
            size = serialized_size,
            weight = block_weight,
            txs = block.transactions.len() - 1,
            fees = state.total_fees,
            sigops = state.block_sigops,
            packages_selected,
            descendants_updated,
            "assembled block template"
        );

        // The selection limits make an invalid template unreachable; if
        // this fires, the assembler itself is broken.
        check_block(&block).map_err(MinerError::TemplateInvalid)?;

        Ok(BlockTemplate { block, fees, sigops, height })
    }

    /// The package-selection loop: repeatedly take the best of the next
    /// base-index entry and the best modified entry, and place its whole
    /// remaining ancestor package.
    #[allow(clippy::too_many_arguments)]
    fn add_package_txs(
        &self,
        state: &mut WorkingState,
        pool: &Mempool,
        height: u64,
        locktime_cutoff: u64,
        now: u64,
        include_witness: bool,
    ) -> (u64, u64) {
        let base_order: Vec<TxId> = pool.ancestor_score_iter().map(|e| e.txid()).collect();
        let mut base_cursor = 0usize;

        let mut modified_info: HashMap<TxId, ModifiedEntry> = HashMap::new();
        let mut modified_order: BTreeSet<ScoreKey> = BTreeSet::new();
        let mut failed: HashSet<TxId> = HashSet::new();

        let mut consecutive_failed = 0u64;
        let mut packages_selected = 0u64;
        let mut descendants_updated = 0u64;

        while base_cursor < base_order.len() || !modified_order.is_empty() {
            if self.shutdown.is_requested() {
                break;
            }

            // Advance past base entries that are stale or excluded.
            if base_cursor < base_order.len() {
                let txid = base_order[base_cursor];
                let skip = state.in_block.contains(&txid)
                    || modified_info.contains_key(&txid)
                    || failed.contains(&txid)
                    || (self.options.only_older_transactions
                        && pool
                            .entry(&txid)
                            .is_some_and(|e| e.time() > now.saturating_sub(RECENT_TX_THRESHOLD)));
                if skip {
                    base_cursor += 1;
                    continue;
                }
            }

            // Pick the better of the base cursor and the modified top.
            let modified_top = modified_order.iter().next().copied();
            let (txid, using_modified) = if base_cursor >= base_order.len() {
                match modified_top {
                    Some(key) => (key.txid, true),
                    None => break,
                }
            } else {
                let base_txid = base_order[base_cursor];
                let base_entry = match pool.entry(&base_txid) {
                    Some(entry) => entry,
                    None => {
                        base_cursor += 1;
                        continue;
                    }
                };
                let base_key = score_key(
                    base_entry,
                    base_entry.size_with_ancestors(),
                    base_entry.mod_fees_with_ancestors(),
                );
                match modified_top {
                    Some(mod_key) if mod_key < base_key => (mod_key.txid, true),
                    _ => {
                        base_cursor += 1;
                        (base_txid, false)
                    }
                }
            };

            let entry = match pool.entry(&txid) {
                Some(entry) => entry,
                None => continue,
            };
            let (package_size, package_fees, package_sigops) = if using_modified {
                let info = modified_info[&txid];
                (info.size_with_ancestors, info.mod_fees_with_ancestors, info.sigops_with_ancestors)
            } else {
                (
                    entry.size_with_ancestors(),
                    entry.mod_fees_with_ancestors(),
                    entry.sigops_with_ancestors(),
                )
            };

            if package_fees < self.options.min_fee_rate.fee_for(package_size) {
                // Everything still to come scores lower; nothing can pay.
                break;
            }

            if !self.test_package(state, package_size, package_sigops) {
                if using_modified {
                    remove_modified(&mut modified_info, &mut modified_order, pool, &txid);
                    failed.insert(txid);
                }
                consecutive_failed += 1;
                if consecutive_failed > MAX_CONSECUTIVE_FAILURES
                    && state.block_weight > self.options.max_weight - 4_000
                {
                    break;
                }
                continue;
            }

            // Expand to the not-yet-included ancestor package.
            let mut package: BTreeSet<TxId> = pool
                .ancestors_of(&txid)
                .into_iter()
                .filter(|a| !state.in_block.contains(a))
                .collect();
            package.insert(txid);

            if !self.test_package_transactions(
                state,
                pool,
                &package,
                height,
                locktime_cutoff,
                include_witness,
            ) {
                if using_modified {
                    remove_modified(&mut modified_info, &mut modified_order, pool, &txid);
                    failed.insert(txid);
                }
                continue;
            }

            consecutive_failed = 0;

            // Ancestor count ascending is a valid topological order.
            let mut sorted: Vec<&MempoolEntry> = package
                .iter()
                .map(|t| pool.entry(t).expect("package member in pool"))
                .collect();
            sorted.sort_by_key(|e| (e.count_with_ancestors(), e.txid()));

            for member in sorted {
                self.add_to_block(state, member);
                remove_modified(&mut modified_info, &mut modified_order, pool, &member.txid());
            }
            packages_selected += 1;

            descendants_updated += update_packages_for_added(
                pool,
                &package,
                &state.in_block,
                &mut modified_info,
                &mut modified_order,
            );
        }

        (packages_selected, descendants_updated)
    }

    fn test_package(&self, state: &WorkingState, package_size: u64, package_sigops: i64) -> bool {
        if state.block_weight + WITNESS_SCALE_FACTOR * package_size >= self.options.max_weight {
            return false;
        }
        if state.block_sigops + package_sigops >= MAX_BLOCK_SIGOPS_COST {
            return false;
        }
        true
    }

    /// Transaction-level gates: finality at the new height, witness
    /// policy, and serialized-size headroom when size accounting is on.
    fn test_package_transactions(
        &self,
        state: &WorkingState,
        pool: &Mempool,
        package: &BTreeSet<TxId>,
        height: u64,
        locktime_cutoff: u64,
        include_witness: bool,
    ) -> bool {
        let mut potential_size = state.block_size;
        for txid in package {
            let Some(entry) = pool.entry(txid) else { return false };
            if !entry.tx().is_final(height, locktime_cutoff) {
                return false;
            }
            if !include_witness && entry.tx().has_witness() {
                return false;
            }
            if self.need_size_accounting {
                if potential_size + entry.tx_size() >= self.options.max_size {
                    return false;
                }
                potential_size += entry.tx_size();
            }
        }
        true
    }

    fn add_to_block(&self, state: &mut WorkingState, entry: &MempoolEntry) {
        state.txs.push(Arc::clone(entry.tx()));
        state.fees.push(entry.fee());
        state.sigops.push(entry.sigops_cost());
        if self.need_size_accounting {
            state.block_size += entry.tx_size();
        }
        state.block_weight += WITNESS_SCALE_FACTOR * entry.tx_size();
        state.block_sigops += entry.sigops_cost();
        state.total_fees += entry.fee();
        state.in_block.insert(entry.txid());

        if self.options.print_priority {
            debug!(
                fee_rate = %ember_core::amount::FeeRate::from_fee(entry.modified_fee(), entry.tx_size()),
                txid = %entry.txid(),
                "placed transaction"
            );
        }
    }
}

/// For every in-pool descendant of a newly placed package, record reduced
/// effective ancestor aggregates in the modified view. Returns how many
/// descendant records were created or updated.
fn update_packages_for_added(
    pool: &Mempool,
    added: &BTreeSet<TxId>,
    in_block: &HashSet<TxId>,
    modified_info: &mut HashMap<TxId, ModifiedEntry>,
    modified_order: &mut BTreeSet<ScoreKey>,
) -> u64 {
    let mut updated = 0u64;
    for txid in added {
        for descendant in pool.descendants_of(txid) {
            if added.contains(&descendant) || in_block.contains(&descendant) {
                continue;
            }
            let Some(added_entry) = pool.entry(txid) else { continue };
            let Some(desc_entry) = pool.entry(&descendant) else { continue };
            updated += 1;

            let current = modified_info.get(&descendant).copied().unwrap_or(ModifiedEntry {
                size_with_ancestors: desc_entry.size_with_ancestors(),
                mod_fees_with_ancestors: desc_entry.mod_fees_with_ancestors(),
                sigops_with_ancestors: desc_entry.sigops_with_ancestors(),
            });
            if modified_info.contains_key(&descendant) {
                modified_order.remove(&score_key(
                    desc_entry,
                    current.size_with_ancestors,
                    current.mod_fees_with_ancestors,
                ));
            }
            let next = ModifiedEntry {
                size_with_ancestors: current.size_with_ancestors - added_entry.tx_size(),
                mod_fees_with_ancestors: current.mod_fees_with_ancestors
                    - added_entry.modified_fee(),
                sigops_with_ancestors: current.sigops_with_ancestors - added_entry.sigops_cost(),
            };
            modified_order.insert(score_key(
                desc_entry,
                next.size_with_ancestors,
                next.mod_fees_with_ancestors,
            ));
            modified_info.insert(descendant, next);
        }
    }
    updated
}

fn remove_modified(
    modified_info: &mut HashMap<TxId, ModifiedEntry>,
    modified_order: &mut BTreeSet<ScoreKey>,
    pool: &Mempool,
    txid: &TxId,
) {
    if let Some(info) = modified_info.remove(txid) {
        if let Some(entry) = pool.entry(txid) {
            modified_order.remove(&score_key(
                entry,
                info.size_with_ancestors,
                info.mod_fees_with_ancestors,
            ));
        }
    }
}

fn collect_txids(transactions: &[Transaction]) -> Result<Vec<TxId>, MinerError> {
    transactions
        .iter()
        .map(|tx| tx.txid().map_err(|e| MinerError::Serialization(e.to_string())))
        .collect()
}

fn null_header() -> BlockHeader {
    BlockHeader {
        version: 0,
        prev_hash: Hash256::ZERO,
        merkle_root: Hash256::ZERO,
        timestamp: 0,
        bits: 0,
        nonce: 0,
    }
}

/// Miner data placed in the coinbase input: height, extra nonce, tag.
fn coinbase_data(height: u64, extra_nonce: u64) -> Result<Vec<u8>, MinerError> {
    let mut data = Vec::with_capacity(16 + COINBASE_FLAGS.len());
    data.extend_from_slice(&height.to_le_bytes());
    data.extend_from_slice(&extra_nonce.to_le_bytes());
    data.extend_from_slice(COINBASE_FLAGS);
    if data.len() > MAX_COINBASE_DATA {
        return Err(MinerError::CoinbaseDataTooLarge { size: data.len(), max: MAX_COINBASE_DATA });
    }
    Ok(data)
}

/// Extra-nonce bookkeeping across mining attempts: resets when the tip
/// changes, increments between attempts on the same tip.
#[derive(Debug, Default)]
pub struct ExtraNonce {
    last_prev_hash: Hash256,
    counter: u64,
}

impl ExtraNonce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite the block's coinbase data with the next extra nonce and
    /// refresh the merkle root. Returns the nonce used.
    pub fn increment(&mut self, block: &mut Block, height: u64) -> Result<u64, MinerError> {
        if self.last_prev_hash != block.header.prev_hash {
            self.counter = 0;
            self.last_prev_hash = block.header.prev_hash;
        }
        self.counter += 1;

        let coinbase = block
            .transactions
            .first_mut()
            .ok_or_else(|| MinerError::MissingPoolEntry("empty block".into()))?;
        coinbase.inputs[0].signature = coinbase_data(height, self.counter)?;

        let txids = collect_txids(&block.transactions)?;
        block.header.merkle_root = merkle::merkle_root(&txids);
        Ok(self.counter)
    }
}

/// Rebuild a template without entries received after `time_cutoff`, or
/// descending from one, reconciling fees, sig-ops, the coinbase value,
/// and the merkle root.
///
/// Used for two-pass assembly: build greedily, then shave off recent
/// arrivals whose propagation is still uncertain.
pub fn remove_recent_transactions(
    template: &mut BlockTemplate,
    pool: &Mempool,
    time_cutoff: u64,
) -> Result<usize, MinerError> {
    let mut kept_txs: Vec<Transaction> = Vec::with_capacity(template.block.transactions.len());
    let mut kept_fees: Vec<Amount> = Vec::with_capacity(template.fees.len());
    let mut kept_sigops: Vec<i64> = Vec::with_capacity(template.sigops.len());
    let mut dropped_descendants: HashSet<TxId> = HashSet::new();
    let mut dropped = 0usize;
    let mut new_total_fees: Amount = 0;

    kept_txs.push(template.block.transactions[0].clone());
    kept_fees.push(0); // rewritten below
    kept_sigops.push(template.sigops[0]);

    for (index, tx) in template.block.transactions.iter().enumerate().skip(1) {
        let txid = tx.txid().map_err(|e| MinerError::Serialization(e.to_string()))?;
        let entry = pool
            .entry(&txid)
            .ok_or_else(|| MinerError::MissingPoolEntry(txid.to_string()))?;
        if entry.time() < time_cutoff && !dropped_descendants.contains(&txid) {
            kept_txs.push(tx.clone());
            kept_fees.push(template.fees[index]);
            kept_sigops.push(template.sigops[index]);
            new_total_fees += template.fees[index];
        } else {
            dropped += 1;
            dropped_descendants.extend(pool.descendants_of(&txid));
        }
    }

    let old_total_fees = -template.fees[0];
    kept_txs[0].outputs[0].value -= old_total_fees - new_total_fees;
    kept_fees[0] = -new_total_fees;

    let txids = collect_txids(&kept_txs)?;
    template.block.header.merkle_root = merkle::merkle_root(&txids);
    template.block.transactions = kept_txs;
    template.fees = kept_fees;
    template.sigops = kept_sigops;
    Ok(dropped)
}

//! Confirmation-tracking fee estimator.
//!
//! Tracks transactions that entered the pool with no in-pool inputs (their
//! fee rate is meaningful on its own) and records, when a block confirms
//! them, how many blocks they waited at what fee rate. Estimates are
//! medians over the recorded samples for a confirmation target.
//!
//! State serializes with a two-version header so old nodes refuse data
//! written by incompatible future versions; read failures are non-fatal
//! to the caller.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use ember_core::amount::{Amount, FeeRate};
use ember_core::constants::CLIENT_VERSION;
use ember_core::error::EstimatorError;
use ember_core::types::TxId;

use crate::entry::MempoolEntry;

/// Oldest client version able to read the current serialization.
const VERSION_REQUIRED: u32 = 10_100;

/// Highest confirmation target tracked; deeper confirmations fold into
/// the last bucket.
const MAX_CONFIRM_TARGET: usize = 25;

/// Samples kept per bucket; older samples age out first.
const MAX_SAMPLES_PER_BUCKET: usize = 128;

/// Fewest samples a bucket needs before it produces estimates.
const MIN_SAMPLES_FOR_ESTIMATE: usize = 8;

#[derive(Clone, Copy, Debug)]
struct TrackedTx {
    height_added: u64,
    fee_rate_per_kb: Amount,
}

/// Serialized estimator state.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct EstimatorState {
    buckets: Vec<Vec<Amount>>,
    best_height: u64,
}

/// See the module docs.
pub struct FeeEstimator {
    tracked: HashMap<TxId, TrackedTx>,
    /// `buckets[t - 1]` holds per-kB fee rates of txs that confirmed
    /// within `t` blocks.
    buckets: Vec<Vec<Amount>>,
    best_height: u64,
}

impl Default for FeeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl FeeEstimator {
    pub fn new() -> Self {
        Self {
            tracked: HashMap::new(),
            buckets: vec![Vec::new(); MAX_CONFIRM_TARGET],
            best_height: 0,
        }
    }

    /// Observe a transaction entering the pool.
    ///
    /// Only current-chain additions of transactions with no in-pool
    /// inputs are tracked; a package child's fee rate says nothing about
    /// confirmation on its own.
    pub fn processed_transaction(&mut self, entry: &MempoolEntry, is_current_estimate: bool) {
        if !is_current_estimate || !entry.had_no_mempool_inputs_at_entry() {
            return;
        }
        self.tracked.insert(
            entry.txid(),
            TrackedTx {
                height_added: entry.height_at_entry(),
                fee_rate_per_kb: FeeRate::from_fee(entry.fee(), entry.tx_size()).per_kb_value(),
            },
        );
    }

    /// Observe a connected block confirming `confirmed` pool entries.
    pub fn processed_block(
        &mut self,
        height: u64,
        confirmed: &[MempoolEntry],
        is_current_estimate: bool,
    ) {
        if !is_current_estimate {
            return;
        }
        self.best_height = height;
        for entry in confirmed {
            let Some(tracked) = self.tracked.remove(&entry.txid()) else { continue };
            let blocks_to_confirm = height.saturating_sub(tracked.height_added) as usize;
            if blocks_to_confirm < 1 {
                continue;
            }
            let bucket = &mut self.buckets[blocks_to_confirm.min(MAX_CONFIRM_TARGET) - 1];
            if bucket.len() == MAX_SAMPLES_PER_BUCKET {
                bucket.remove(0);
            }
            bucket.push(tracked.fee_rate_per_kb);
        }
    }

    /// Forget a transaction that left the pool unconfirmed.
    pub fn removed_tx(&mut self, txid: &TxId) {
        self.tracked.remove(txid);
    }

    /// Median fee rate of transactions that confirmed within
    /// `target_blocks`. Zero when there is not enough data.
    pub fn estimate_fee(&self, target_blocks: usize) -> FeeRate {
        if target_blocks == 0 || target_blocks > MAX_CONFIRM_TARGET {
            return FeeRate::ZERO;
        }
        // Pool samples from every bucket at or under the target.
        let mut samples: Vec<Amount> = self.buckets[..target_blocks]
            .iter()
            .flatten()
            .copied()
            .collect();
        if samples.len() < MIN_SAMPLES_FOR_ESTIMATE {
            return FeeRate::ZERO;
        }
        samples.sort_unstable();
        FeeRate::per_kb(samples[samples.len() / 2])
    }

    /// Serialize as `version_required || version_that_wrote || body`.
    pub fn write(&self) -> Result<Vec<u8>, EstimatorError> {
        let state = EstimatorState {
            buckets: self.buckets.clone(),
            best_height: self.best_height,
        };
        let mut out = Vec::new();
        out.extend_from_slice(&VERSION_REQUIRED.to_le_bytes());
        out.extend_from_slice(&CLIENT_VERSION.to_le_bytes());
        let body = bincode::encode_to_vec(&state, bincode::config::standard())
            .map_err(|e| EstimatorError::Corrupt(e.to_string()))?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Load previously written state, rejecting up-version data.
    pub fn read(&mut self, data: &[u8]) -> Result<(), EstimatorError> {
        if data.len() < 8 {
            return Err(EstimatorError::Corrupt("truncated header".into()));
        }
        let required = u32::from_le_bytes(data[0..4].try_into().expect("fixed slice"));
        if required > CLIENT_VERSION {
            return Err(EstimatorError::UpVersion { required, ours: CLIENT_VERSION });
        }
        let (state, _): (EstimatorState, usize) =
            bincode::decode_from_slice(&data[8..], bincode::config::standard())
                .map_err(|e| EstimatorError::Corrupt(e.to_string()))?;
        if state.buckets.len() != MAX_CONFIRM_TARGET {
            return Err(EstimatorError::Corrupt(format!(
                "unexpected bucket count {}",
                state.buckets.len()
            )));
        }
        self.buckets = state.buckets;
        self.best_height = state.best_height;
        Ok(())
    }
}

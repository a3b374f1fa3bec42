//! Rebuilding a full block from a compact summary and the local mempool.

use std::collections::HashMap;

use tracing::debug;

use ember_core::block_check::check_block;
use ember_core::constants::{MAX_BLOCK_SERIALIZED_SIZE, MIN_TX_WIRE_SIZE};
use ember_core::error::ReadError;
use ember_core::types::{Block, BlockHeader, Transaction};
use ember_mempool::Mempool;

use crate::compact::{short_id, CompactBlock};

/// No hash bucket may hold more than this many short IDs: a well-formed
/// message has a near-uniform distribution, so a heavier bucket means the
/// sender engineered it.
const MAX_BUCKET_SIZE: usize = 12;

/// A partially reconstructed block: every slot is either already resolved
/// (prefilled or matched from the mempool) or waiting for an explicit
/// transaction request.
#[derive(Debug)]
pub struct BlockReconstructor {
    header: BlockHeader,
    txn_available: Vec<Option<Transaction>>,
    prefilled_count: usize,
    mempool_count: usize,
}

impl BlockReconstructor {
    /// Resolve a compact block against the local mempool.
    ///
    /// `Invalid` marks a malformed message (misbehaving peer); `Failed`
    /// marks a distribution accident or attack the caller recovers from
    /// by requesting the full block.
    pub fn init_from_compact(cmpct: &CompactBlock, pool: &Mempool) -> Result<Self, ReadError> {
        if cmpct.header.is_null() || (cmpct.short_ids.is_empty() && cmpct.prefilled.is_empty()) {
            return Err(ReadError::Invalid);
        }
        if cmpct.slot_count() as u64 > MAX_BLOCK_SERIALIZED_SIZE / MIN_TX_WIRE_SIZE {
            return Err(ReadError::Invalid);
        }

        let mut txn_available: Vec<Option<Transaction>> = vec![None; cmpct.slot_count()];

        // Place prefilled transactions at their skip-encoded indices.
        let mut last_index: i64 = -1;
        for (i, prefilled) in cmpct.prefilled.iter().enumerate() {
            last_index += prefilled.index_skip as i64 + 1;
            if last_index > u16::MAX as i64 {
                return Err(ReadError::Invalid);
            }
            let index = last_index as usize;
            if index > cmpct.short_ids.len() + i {
                // A slot with neither a prefilled tx nor a short ID.
                return Err(ReadError::Invalid);
            }
            txn_available[index] = Some(prefilled.tx.clone());
        }
        let prefilled_count = cmpct.prefilled.len();

        // Index short IDs by their block slot, skipping prefilled slots.
        let bucket_count = cmpct.short_ids.len().next_power_of_two().max(16);
        let mut bucket_sizes: HashMap<usize, usize> = HashMap::new();
        let mut id_to_slot: HashMap<u64, usize> = HashMap::with_capacity(cmpct.short_ids.len());
        let mut index_offset = 0usize;
        for (i, sid) in cmpct.short_ids.iter().enumerate() {
            while txn_available[i + index_offset].is_some() {
                index_offset += 1;
            }
            id_to_slot.insert(*sid, i + index_offset);
            let bucket = bucket_sizes.entry(*sid as usize & (bucket_count - 1)).or_insert(0);
            *bucket += 1;
            if *bucket > MAX_BUCKET_SIZE {
                return Err(ReadError::Failed);
            }
        }
        if id_to_slot.len() != cmpct.short_ids.len() {
            // Two distinct slots share a short ID; request the full block.
            return Err(ReadError::Failed);
        }

        // Scan the pool for matches. A second pool hit on the same short
        // ID clears the slot so the transaction gets requested explicitly
        // instead of risking a wrong pick.
        let (k0, k1) = cmpct.keys();
        let mut have_txn = vec![false; txn_available.len()];
        let mut mempool_count = 0usize;
        for entry in pool.iter() {
            let sid = short_id(k0, k1, &entry.txid());
            if let Some(&slot) = id_to_slot.get(&sid) {
                if !have_txn[slot] {
                    txn_available[slot] = Some((**entry.tx()).clone());
                    have_txn[slot] = true;
                    mempool_count += 1;
                } else if txn_available[slot].is_some() {
                    txn_available[slot] = None;
                    mempool_count -= 1;
                }
            }
            if mempool_count == cmpct.short_ids.len() {
                break;
            }
        }

        debug!(
            block = %cmpct.header.hash(),
            slots = cmpct.slot_count(),
            prefilled = prefilled_count,
            from_mempool = mempool_count,
            "initialized compact-block reconstruction"
        );

        Ok(Self {
            header: cmpct.header,
            txn_available,
            prefilled_count,
            mempool_count,
        })
    }

    /// Whether the slot at `index` is already resolved.
    pub fn is_tx_available(&self, index: usize) -> bool {
        matches!(self.txn_available.get(index), Some(Some(_)))
    }

    /// Block indices still needing an explicit transaction request.
    pub fn missing_indices(&self) -> Vec<usize> {
        self.txn_available
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.is_none().then_some(i))
            .collect()
    }

    /// Slots resolved from the local mempool.
    pub fn mempool_count(&self) -> usize {
        self.mempool_count
    }

    /// Slots resolved from prefilled transactions.
    pub fn prefilled_count(&self) -> usize {
        self.prefilled_count
    }

    /// Splice `missing` into the unresolved slots, in order, and validate
    /// the result.
    ///
    /// A merkle mismatch reads as a possible short-ID collision and maps
    /// to `Failed` (the caller re-requests the full block); every other
    /// defect is `Invalid`.
    pub fn fill_block(self, missing: Vec<Transaction>) -> Result<Block, ReadError> {
        let mut missing_iter = missing.into_iter();
        let mut transactions = Vec::with_capacity(self.txn_available.len());
        for slot in self.txn_available {
            match slot {
                Some(tx) => transactions.push(tx),
                None => transactions.push(missing_iter.next().ok_or(ReadError::Invalid)?),
            }
        }
        if missing_iter.next().is_some() {
            return Err(ReadError::Invalid);
        }

        let block = Block { header: self.header, transactions };
        match check_block(&block) {
            Ok(()) => {
                debug!(
                    block = %block.header.hash(),
                    txs = block.transactions.len(),
                    "reconstructed block"
                );
                Ok(block)
            }
            Err(e) if e.corruption_possible() => Err(ReadError::Failed),
            Err(_) => Err(ReadError::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ember_core::merkle;
    use ember_core::types::{Hash256, OutPoint, TxInput, TxOutput};
    use ember_events::NotificationQueue;
    use ember_mempool::{MempoolEntry, MempoolOptions};

    use crate::compact::PrefilledTransaction;

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                signature: vec![1, 2, 3],
                public_key: vec![],
                witness: Vec::new(),
            }],
            outputs: vec![TxOutput { value: 50, pubkey_hash: Hash256::ZERO }],
            lock_time: 0,
        }
    }

    fn spend(seed: u8) -> Arc<Transaction> {
        Arc::new(Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: Hash256([seed; 32]), index: 0 },
                signature: vec![0; 64],
                public_key: vec![0; 32],
                witness: Vec::new(),
            }],
            outputs: vec![TxOutput { value: 1, pubkey_hash: Hash256([seed; 32]) }],
            lock_time: 0,
        })
    }

    fn make_pool() -> Mempool {
        Mempool::new(MempoolOptions::default(), NotificationQueue::new())
    }

    fn add(pool: &mut Mempool, tx: &Arc<Transaction>) {
        let entry = MempoolEntry::new(Arc::clone(tx), 1_000, 0, 0.0, 100, true).unwrap();
        pool.add_unchecked(entry);
    }

    fn block_of(txs: Vec<Transaction>) -> Block {
        let txids: Vec<Hash256> = txs.iter().map(|t| t.txid().unwrap()).collect();
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256([0x44; 32]),
                merkle_root: merkle::merkle_root(&txids),
                timestamp: 1_700_000_000,
                bits: 0x1d00_ffff,
                nonce: 9,
            },
            transactions: txs,
        }
    }

    /// Nine pool transactions, all referenced by short ID; the coinbase
    /// rides prefilled.
    fn happy_fixture() -> (Block, CompactBlock, Mempool) {
        let mut pool = make_pool();
        let mut txs = vec![coinbase()];
        for seed in 1..=9u8 {
            let tx = spend(seed);
            add(&mut pool, &tx);
            txs.push((*tx).clone());
        }
        let block = block_of(txs);
        let cmpct = CompactBlock::from_block(&block, 0xFEED).unwrap();
        (block, cmpct, pool)
    }

    // --- happy path (round trip against the pool) ---

    #[test]
    fn reconstructs_bit_exactly_from_mempool() {
        let (block, cmpct, pool) = happy_fixture();
        let reconstructor = BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap();
        assert_eq!(reconstructor.mempool_count(), 9);
        assert_eq!(reconstructor.prefilled_count(), 1);
        assert!(reconstructor.missing_indices().is_empty());
        for i in 0..10 {
            assert!(reconstructor.is_tx_available(i));
        }

        let rebuilt = reconstructor.fill_block(Vec::new()).unwrap();
        assert_eq!(rebuilt, block);
        assert_eq!(
            rebuilt.transactions[0].encode().unwrap(),
            block.transactions[0].encode().unwrap()
        );
    }

    #[test]
    fn missing_transactions_are_requested_and_spliced() {
        let (block, cmpct, mut pool) = happy_fixture();
        // Forget two of the nine.
        let gone: Vec<Transaction> = vec![
            block.transactions[3].clone(),
            block.transactions[7].clone(),
        ];
        for tx in &gone {
            let txid = tx.txid().unwrap();
            pool.remove_recursive(&txid, ember_events::RemovalReason::Replaced);
        }

        let reconstructor = BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap();
        assert_eq!(reconstructor.mempool_count(), 7);
        assert_eq!(reconstructor.missing_indices(), vec![3, 7]);
        assert!(!reconstructor.is_tx_available(3));

        let rebuilt = reconstructor.fill_block(gone).unwrap();
        assert_eq!(rebuilt, block);
    }

    #[test]
    fn wrong_missing_count_is_invalid() {
        let (block, cmpct, mut pool) = happy_fixture();
        let victim = block.transactions[2].txid().unwrap();
        pool.remove_recursive(&victim, ember_events::RemovalReason::Replaced);

        // Too few.
        let reconstructor = BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap();
        assert_eq!(reconstructor.fill_block(Vec::new()), Err(ReadError::Invalid));

        // Too many.
        let reconstructor = BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap();
        let extra = vec![block.transactions[2].clone(), block.transactions[4].clone()];
        assert_eq!(reconstructor.fill_block(extra), Err(ReadError::Invalid));
    }

    // --- structural rejections ---

    #[test]
    fn null_header_is_invalid() {
        let (_, mut cmpct, pool) = happy_fixture();
        cmpct.header.bits = 0;
        assert_eq!(
            BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap_err(),
            ReadError::Invalid
        );
    }

    #[test]
    fn empty_message_is_invalid() {
        let (_, mut cmpct, pool) = happy_fixture();
        cmpct.short_ids.clear();
        cmpct.prefilled.clear();
        assert_eq!(
            BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap_err(),
            ReadError::Invalid
        );
    }

    #[test]
    fn oversized_slot_claim_is_invalid() {
        let (_, mut cmpct, pool) = happy_fixture();
        let limit = (MAX_BLOCK_SERIALIZED_SIZE / MIN_TX_WIRE_SIZE) as usize;
        cmpct.short_ids = vec![1; limit + 1];
        assert_eq!(
            BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap_err(),
            ReadError::Invalid
        );
    }

    #[test]
    fn prefilled_index_overrun_is_invalid() {
        let (_, mut cmpct, pool) = happy_fixture();
        // Skip far past the advertised short-ID slots.
        cmpct.prefilled[0].index_skip = 100;
        assert_eq!(
            BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap_err(),
            ReadError::Invalid
        );
    }

    #[test]
    fn prefilled_index_past_u16_is_invalid() {
        let (_, mut cmpct, pool) = happy_fixture();
        // Enough short-ID slots that the first prefilled index is legal;
        // the second one arithmetically exceeds the u16 index space.
        cmpct.short_ids = (0..65_600u64).collect();
        cmpct.prefilled = vec![
            PrefilledTransaction { index_skip: u16::MAX, tx: coinbase() },
            PrefilledTransaction { index_skip: 0, tx: (*spend(99)).clone() },
        ];
        assert_eq!(
            BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap_err(),
            ReadError::Invalid
        );
    }

    // --- anti-DoS and collision fallbacks ---

    #[test]
    fn duplicate_short_ids_fail_over_to_full_request() {
        let (_, mut cmpct, pool) = happy_fixture();
        cmpct.short_ids[1] = cmpct.short_ids[0];
        assert_eq!(
            BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap_err(),
            ReadError::Failed
        );
    }

    #[test]
    fn bucket_overflow_fails_over_to_full_request() {
        let (_, mut cmpct, pool) = happy_fixture();
        // Thirteen distinct IDs engineered into one hash bucket.
        let bucket_count = 13usize.next_power_of_two().max(16) as u64;
        cmpct.short_ids = (0..13u64).map(|i| i * bucket_count + 5).collect();
        assert_eq!(
            BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap_err(),
            ReadError::Failed
        );
    }

    #[test]
    fn corrupted_slot_reads_as_failed_not_invalid() {
        let (block, cmpct, mut pool) = happy_fixture();
        // The pool lost one tx; the peer answers the request with a
        // different transaction, corrupting the merkle commitment.
        let victim = block.transactions[5].txid().unwrap();
        pool.remove_recursive(&victim, ember_events::RemovalReason::Replaced);

        let reconstructor = BlockReconstructor::init_from_compact(&cmpct, &pool).unwrap();
        let wrong = (*spend(200)).clone();
        assert_eq!(reconstructor.fill_block(vec![wrong]), Err(ReadError::Failed));
    }
}

//! Builders shared by the E2E and adversarial tests.

use std::sync::Arc;

use ember_core::amount::Amount;
use ember_core::merkle;
use ember_core::types::*;
use ember_events::NotificationQueue;
use ember_mempool::{Mempool, MempoolEntry, MempoolOptions};

/// Simple pubkey hash from a seed byte.
pub fn pkh(seed: u8) -> Hash256 {
    Hash256([seed; 32])
}

/// An outpoint with a txid derived from `seed`.
pub fn outpoint(seed: u8, index: u32) -> OutPoint {
    OutPoint { txid: Hash256([seed; 32]), index }
}

/// Create a coinbase transaction with a height marker, so each height
/// produces a distinct txid.
pub fn make_coinbase(value: Amount, pubkey_hash: Hash256, height: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: height.to_le_bytes().to_vec(),
            public_key: vec![],
            witness: Vec::new(),
        }],
        outputs: vec![TxOutput { value, pubkey_hash }],
        lock_time: 0,
    }
}

/// Create a simple spending transaction (unsigned).
pub fn make_tx(inputs: Vec<OutPoint>, outputs: Vec<(Amount, Hash256)>) -> Arc<Transaction> {
    Arc::new(Transaction {
        version: 1,
        inputs: inputs
            .into_iter()
            .map(|op| TxInput {
                previous_output: op,
                signature: vec![0; 64],
                public_key: vec![0; 32],
                witness: Vec::new(),
            })
            .collect(),
        outputs: outputs
            .into_iter()
            .map(|(value, pubkey_hash)| TxOutput { value, pubkey_hash })
            .collect(),
        lock_time: 0,
    })
}

/// Create a block with a correct merkle root.
pub fn make_block(prev_hash: Hash256, timestamp: u32, txs: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid().unwrap()).collect();
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: merkle::merkle_root(&txids),
            timestamp,
            bits: 0x1d00_ffff,
            nonce: 0,
        },
        transactions: txs,
    }
}

/// A pool with a fixed eviction seed for reproducible sampling.
pub fn make_pool() -> Mempool {
    let options = MempoolOptions { trim_seed: Some(99), ..Default::default() };
    Mempool::new(options, NotificationQueue::new())
}

/// Build and insert an entry, computing ancestors without limits.
/// Returns the txid.
pub fn add_tx(pool: &mut Mempool, tx: &Arc<Transaction>, fee: Amount, time: u64) -> TxId {
    let no_inputs = pool.has_no_inputs_of(tx);
    let entry = MempoolEntry::new(Arc::clone(tx), fee, time, 0.0, 100, no_inputs).unwrap();
    let txid = entry.txid();
    pool.add_unchecked(entry);
    txid
}

//! Context-free structural block validity.
//!
//! These are the checks a freshly assembled or reconstructed block must
//! pass before any chain context is consulted. The merkle commitment is
//! checked first: a mismatch there is the signature of corrupted
//! reconstruction input, and callers distinguish it from outright
//! invalidity via [`BlockError::corruption_possible`].

use std::collections::HashSet;

use crate::constants::{MAX_BLOCK_SERIALIZED_SIZE, MAX_BLOCK_WEIGHT};
use crate::error::{BlockError, TxError};
use crate::merkle;
use crate::types::{Block, Hash256};

/// Witness commitment for a block: merkle root over witness transaction
/// IDs, with the coinbase slot pinned to zero (its witness ID is not
/// covered by its own commitment).
pub fn witness_commitment(block: &Block) -> Result<Hash256, TxError> {
    let mut wtxids = Vec::with_capacity(block.transactions.len());
    for (i, tx) in block.transactions.iter().enumerate() {
        if i == 0 {
            wtxids.push(Hash256::ZERO);
        } else {
            wtxids.push(tx.wtxid()?);
        }
    }
    Ok(merkle::merkle_root(&wtxids))
}

/// Locate the commitment carried by the coinbase: the last zero-value
/// output, whose `pubkey_hash` holds the commitment hash.
fn coinbase_commitment(block: &Block) -> Option<Hash256> {
    block
        .coinbase()?
        .outputs
        .iter()
        .rev()
        .find(|out| out.value == 0)
        .map(|out| out.pubkey_hash)
}

/// Check structural block validity.
///
/// Verifies, in order: non-emptiness, the merkle commitment, coinbase
/// placement, transaction-ID uniqueness, intra-block double spends,
/// size and weight bounds, and the witness commitment when any
/// transaction carries a witness.
pub fn check_block(block: &Block) -> Result<(), BlockError> {
    if block.transactions.is_empty() {
        return Err(BlockError::Empty);
    }

    let mut txids = Vec::with_capacity(block.transactions.len());
    for (index, tx) in block.transactions.iter().enumerate() {
        let txid = tx
            .txid()
            .map_err(|source| BlockError::Transaction { index, source })?;
        txids.push(txid);
    }
    if merkle::merkle_root(&txids) != block.header.merkle_root {
        return Err(BlockError::InvalidMerkleRoot);
    }

    if !block.transactions[0].is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(BlockError::MultipleCoinbase);
    }

    let mut seen_txids = HashSet::with_capacity(txids.len());
    for txid in &txids {
        if !seen_txids.insert(txid) {
            return Err(BlockError::DuplicateTxid(txid.to_string()));
        }
    }

    let mut spent = HashSet::new();
    for tx in &block.transactions[1..] {
        for input in &tx.inputs {
            if !spent.insert(input.previous_output) {
                return Err(BlockError::DoubleSpend(input.previous_output.to_string()));
            }
        }
    }

    let size = block
        .serialized_size()
        .map_err(|source| BlockError::Transaction { index: 0, source })?;
    if size > MAX_BLOCK_SERIALIZED_SIZE {
        return Err(BlockError::OversizedBlock { size, max: MAX_BLOCK_SERIALIZED_SIZE });
    }
    let weight = block
        .weight()
        .map_err(|source| BlockError::Transaction { index: 0, source })?;
    if weight > MAX_BLOCK_WEIGHT {
        return Err(BlockError::OverweightBlock { weight, max: MAX_BLOCK_WEIGHT });
    }

    if block.transactions[1..].iter().any(|tx| tx.has_witness()) {
        let expected = witness_commitment(block)
            .map_err(|source| BlockError::Transaction { index: 0, source })?;
        match coinbase_commitment(block) {
            None => return Err(BlockError::MissingWitnessCommitment),
            Some(found) if found != expected => {
                return Err(BlockError::WitnessCommitmentMismatch)
            }
            Some(_) => {}
        }
    }

    Ok(())
}

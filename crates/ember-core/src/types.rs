//! Core protocol types: transactions, blocks, unspent outputs.
//!
//! All monetary values are in embers (1 EMBER = 10^8 embers). Transaction
//! IDs commit to the witness-stripped encoding; witness IDs commit to the
//! full encoding. Canonical serialization is bincode with the standard
//! config.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::amount::{tx_weight, vsize_from_weight, Amount};
use crate::constants::{LOCKTIME_THRESHOLD, MAX_MONEY, WITNESS_SCALE_FACTOR};
use crate::error::TxError;

/// A 32-byte hash value.
///
/// Used for transaction IDs and merkle roots (BLAKE3) and block header
/// hashes (double SHA-256).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used for coinbase previous outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A transaction ID: hash of the witness-stripped canonical encoding.
pub type TxId = Hash256;

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: TxId,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Ed25519 signature (64 bytes), or arbitrary miner data for coinbase.
    pub signature: Vec<u8>,
    /// Ed25519 public key (32 bytes). Empty for coinbase inputs.
    pub public_key: Vec<u8>,
    /// Witness stack. Empty for legacy spends; witness bytes weigh less.
    pub witness: Vec<Vec<u8>>,
}

/// A transaction output, creating a new UTXO.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in embers.
    pub value: Amount,
    /// BLAKE3 hash of the recipient's Ed25519 public key.
    pub pubkey_hash: Hash256,
}

/// A transaction transferring value between addresses.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u32,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height or unix time before which this tx is not final.
    pub lock_time: u64,
}

impl Transaction {
    /// Canonical encoding of this transaction.
    pub fn encode(&self) -> Result<Vec<u8>, TxError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TxError::Serialization(e.to_string()))
    }

    /// A copy with all witness stacks removed.
    fn stripped(&self) -> Transaction {
        Transaction {
            version: self.version,
            inputs: self
                .inputs
                .iter()
                .map(|input| TxInput {
                    previous_output: input.previous_output,
                    signature: input.signature.clone(),
                    public_key: input.public_key.clone(),
                    witness: Vec::new(),
                })
                .collect(),
            outputs: self.outputs.clone(),
            lock_time: self.lock_time,
        }
    }

    /// Transaction ID: BLAKE3 of the witness-stripped canonical encoding.
    ///
    /// Stripping the witness keeps the ID stable under witness malleation.
    pub fn txid(&self) -> Result<TxId, TxError> {
        let encoded = if self.has_witness() {
            self.stripped().encode()?
        } else {
            self.encode()?
        };
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Witness transaction ID: BLAKE3 of the full canonical encoding.
    pub fn wtxid(&self) -> Result<Hash256, TxError> {
        let encoded = self.encode()?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Whether any input carries a witness stack.
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Check if this is a coinbase transaction (single input, null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Serialized size without witness data.
    pub fn base_size(&self) -> Result<u64, TxError> {
        if self.has_witness() {
            Ok(self.stripped().encode()?.len() as u64)
        } else {
            self.total_size()
        }
    }

    /// Full serialized size including witness data.
    pub fn total_size(&self) -> Result<u64, TxError> {
        Ok(self.encode()?.len() as u64)
    }

    /// Block weight: base bytes count four, witness bytes one.
    pub fn weight(&self) -> Result<u64, TxError> {
        Ok(tx_weight(self.base_size()?, self.total_size()?))
    }

    /// Virtual size: `ceil(weight / 4)`.
    pub fn vsize(&self) -> Result<u64, TxError> {
        Ok(vsize_from_weight(self.weight()?))
    }

    /// Signature-operation cost, scaled so witness verification is cheap:
    /// nothing for data-only inputs (coinbase), one per witness spend,
    /// the full scale factor per legacy spend.
    pub fn sigop_cost(&self) -> i64 {
        self.inputs
            .iter()
            .map(|input| {
                if input.signature.is_empty() && input.witness.is_empty() {
                    0
                } else if !input.witness.is_empty() {
                    1
                } else {
                    WITNESS_SCALE_FACTOR as i64
                }
            })
            .sum()
    }

    /// Size with the constant per-input proof overhead removed, used for
    /// priority arithmetic so large-but-simple spends are not penalised.
    pub fn modified_size(&self, total_size: u64) -> u64 {
        let mut size = total_size;
        for input in &self.inputs {
            let proof_bytes = input.signature.len()
                + input.public_key.len()
                + input.witness.iter().map(Vec::len).sum::<usize>();
            let offset = 41 + proof_bytes.min(110) as u64;
            size = size.saturating_sub(offset);
        }
        size.max(1)
    }

    /// Sum of all output values, saturating at [`MAX_MONEY`].
    pub fn value_out(&self) -> Amount {
        let mut total: Amount = 0;
        for out in &self.outputs {
            total = total.saturating_add(out.value).min(MAX_MONEY);
        }
        total
    }

    /// Whether this transaction is final at the given height and time.
    ///
    /// Lock times below [`LOCKTIME_THRESHOLD`] are block heights, at or
    /// above are unix times; a lock time of zero is always final.
    pub fn is_final(&self, height: u64, time_cutoff: u64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if self.lock_time < LOCKTIME_THRESHOLD {
            height
        } else {
            time_cutoff
        };
        self.lock_time < cutoff
    }
}

/// Block header with the proof-of-work puzzle.
///
/// The canonical layout is exactly [`BlockHeader::SIZE`] bytes,
/// little-endian: `version || prev_hash || merkle_root || timestamp ||
/// bits || nonce`. The header hash is double SHA-256 over that layout.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u32,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// BLAKE3 merkle root of the block's transaction IDs.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Canonical header size in bytes.
    pub const SIZE: usize = 4 + 32 + 32 + 4 + 4 + 4;

    /// Serialize to the fixed canonical layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[0..4].copy_from_slice(&self.version.to_le_bytes());
        data[4..36].copy_from_slice(self.prev_hash.as_bytes());
        data[36..68].copy_from_slice(self.merkle_root.as_bytes());
        data[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        data[72..76].copy_from_slice(&self.bits.to_le_bytes());
        data[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        data
    }

    /// Deserialize from the fixed canonical layout.
    pub fn from_bytes(data: &[u8; Self::SIZE]) -> Self {
        let mut prev_hash = [0u8; 32];
        let mut merkle_root = [0u8; 32];
        prev_hash.copy_from_slice(&data[4..36]);
        merkle_root.copy_from_slice(&data[36..68]);
        Self {
            version: u32::from_le_bytes(data[0..4].try_into().expect("fixed slice")),
            prev_hash: Hash256(prev_hash),
            merkle_root: Hash256(merkle_root),
            timestamp: u32::from_le_bytes(data[68..72].try_into().expect("fixed slice")),
            bits: u32::from_le_bytes(data[72..76].try_into().expect("fixed slice")),
            nonce: u32::from_le_bytes(data[76..80].try_into().expect("fixed slice")),
        }
    }

    /// Compute the block header hash (double SHA-256 of the canonical layout).
    pub fn hash(&self) -> Hash256 {
        let first = Sha256::digest(self.to_bytes());
        Hash256(Sha256::digest(first).into())
    }

    /// A header that carries no difficulty target is not a real header.
    pub fn is_null(&self) -> bool {
        self.bits == 0
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    /// Block header with proof-of-work.
    pub header: BlockHeader,
    /// Ordered list of transactions. First transaction must be coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Get the coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Serialized size of the whole block.
    pub fn serialized_size(&self) -> Result<u64, TxError> {
        let mut total = BlockHeader::SIZE as u64;
        for tx in &self.transactions {
            total += tx.total_size()?;
        }
        Ok(total)
    }

    /// Total block weight.
    pub fn weight(&self) -> Result<u64, TxError> {
        let mut total = (BlockHeader::SIZE as u64) * WITNESS_SCALE_FACTOR;
        for tx in &self.transactions {
            total += tx.weight()?;
        }
        Ok(total)
    }

    /// Transaction IDs in block order.
    pub fn txids(&self) -> Result<Vec<TxId>, TxError> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}

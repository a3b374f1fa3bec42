//! Compact-block message and its byte-exact wire codec.
//!
//! Wire layout, little-endian throughout:
//!
//! ```text
//! header          : 80 bytes (fixed)
//! nonce           : u64
//! short_ids_count : compact-size varint
//! short_ids[]     : 6 bytes each (low 48 bits of the SipHash)
//! prefilled_count : compact-size varint
//! prefilled[]     : { skip: compact-size varint, tx: canonical encoding }
//! ```

use std::hash::Hasher;

use sha2::{Digest, Sha256};
use siphasher::sip::SipHasher24;

use ember_core::error::{ReadError, TxError};
use ember_core::types::{Block, BlockHeader, Hash256, Transaction};

/// A 48-bit transaction fingerprint, stored in the low bits of a u64.
pub type ShortId = u64;

/// Mask selecting the 48 bits that go on the wire.
pub const SHORT_ID_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Bytes per short ID on the wire.
pub const SHORT_ID_WIRE_LEN: usize = 6;

/// A transaction sent in full inside a compact block, addressed by the
/// number of slots skipped since the previous prefilled transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefilledTransaction {
    /// Slots skipped since the previous prefilled index (plus one).
    pub index_skip: u16,
    pub tx: Transaction,
}

/// Header plus short IDs plus prefilled transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactBlock {
    pub header: BlockHeader,
    /// Salt for the short-ID keys, chosen by the sender.
    pub nonce: u64,
    pub short_ids: Vec<ShortId>,
    pub prefilled: Vec<PrefilledTransaction>,
}

impl CompactBlock {
    /// Summarise a block: the coinbase rides prefilled at slot zero,
    /// everything else becomes a short ID.
    pub fn from_block(block: &Block, nonce: u64) -> Result<Self, TxError> {
        let header = block.header;
        let (k0, k1) = short_id_keys(&header, nonce);
        let mut short_ids = Vec::with_capacity(block.transactions.len().saturating_sub(1));
        for tx in block.transactions.iter().skip(1) {
            short_ids.push(short_id(k0, k1, &tx.txid()?));
        }
        let prefilled = block
            .coinbase()
            .map(|coinbase| {
                vec![PrefilledTransaction { index_skip: 0, tx: coinbase.clone() }]
            })
            .unwrap_or_default();
        Ok(Self { header, nonce, short_ids, prefilled })
    }

    /// As [`from_block`](Self::from_block) with a random nonce.
    pub fn from_block_with_random_nonce(block: &Block) -> Result<Self, TxError> {
        Self::from_block(block, rand::random())
    }

    /// Short-ID keys for this message's header and nonce.
    pub fn keys(&self) -> (u64, u64) {
        short_id_keys(&self.header, self.nonce)
    }

    /// The short ID this message assigns to `txid`.
    pub fn short_id(&self, txid: &Hash256) -> ShortId {
        let (k0, k1) = self.keys();
        short_id(k0, k1, txid)
    }

    /// Total transaction slots in the summarised block.
    pub fn slot_count(&self) -> usize {
        self.short_ids.len() + self.prefilled.len()
    }

    /// Encode to the wire layout.
    pub fn encode(&self) -> Result<Vec<u8>, TxError> {
        let mut out = Vec::with_capacity(
            BlockHeader::SIZE + 8 + 9 + self.short_ids.len() * SHORT_ID_WIRE_LEN,
        );
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());

        write_compact_size(&mut out, self.short_ids.len() as u64);
        for short_id in &self.short_ids {
            out.extend_from_slice(&(short_id & SHORT_ID_MASK).to_le_bytes()[..SHORT_ID_WIRE_LEN]);
        }

        write_compact_size(&mut out, self.prefilled.len() as u64);
        for prefilled in &self.prefilled {
            write_compact_size(&mut out, prefilled.index_skip as u64);
            let tx = bincode::encode_to_vec(&prefilled.tx, bincode::config::standard())
                .map_err(|e| TxError::Serialization(e.to_string()))?;
            out.extend_from_slice(&tx);
        }
        Ok(out)
    }

    /// Decode from the wire layout. Any structural defect is `Invalid`.
    pub fn decode(data: &[u8]) -> Result<Self, ReadError> {
        let mut pos = 0usize;

        let header_bytes: &[u8; BlockHeader::SIZE] = data
            .get(0..BlockHeader::SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(ReadError::Invalid)?;
        let header = BlockHeader::from_bytes(header_bytes);
        pos += BlockHeader::SIZE;

        let nonce_bytes: [u8; 8] = data
            .get(pos..pos + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or(ReadError::Invalid)?;
        let nonce = u64::from_le_bytes(nonce_bytes);
        pos += 8;

        let short_count = read_compact_size(data, &mut pos)?;
        // Bound before allocating: each short ID occupies wire bytes.
        if short_count as usize > data.len().saturating_sub(pos) / SHORT_ID_WIRE_LEN {
            return Err(ReadError::Invalid);
        }
        let mut short_ids = Vec::with_capacity(short_count as usize);
        for _ in 0..short_count {
            let raw = data.get(pos..pos + SHORT_ID_WIRE_LEN).ok_or(ReadError::Invalid)?;
            let mut bytes = [0u8; 8];
            bytes[..SHORT_ID_WIRE_LEN].copy_from_slice(raw);
            short_ids.push(u64::from_le_bytes(bytes));
            pos += SHORT_ID_WIRE_LEN;
        }

        let prefilled_count = read_compact_size(data, &mut pos)?;
        if prefilled_count > u16::MAX as u64 + 1 {
            return Err(ReadError::Invalid);
        }
        let mut prefilled = Vec::with_capacity(prefilled_count as usize);
        for _ in 0..prefilled_count {
            let skip = read_compact_size(data, &mut pos)?;
            if skip > u16::MAX as u64 {
                return Err(ReadError::Invalid);
            }
            let (tx, consumed): (Transaction, usize) =
                bincode::decode_from_slice(&data[pos..], bincode::config::standard())
                    .map_err(|_| ReadError::Invalid)?;
            pos += consumed;
            prefilled.push(PrefilledTransaction { index_skip: skip as u16, tx });
        }

        if pos != data.len() {
            return Err(ReadError::Invalid);
        }
        Ok(Self { header, nonce, short_ids, prefilled })
    }
}

/// Short-ID keys: SHA-256 over the canonical header bytes and the nonce,
/// split into two little-endian u64 halves.
pub fn short_id_keys(header: &BlockHeader, nonce: u64) -> (u64, u64) {
    let mut hasher = Sha256::new();
    hasher.update(header.to_bytes());
    hasher.update(nonce.to_le_bytes());
    let digest = hasher.finalize();
    let k0 = u64::from_le_bytes(digest[0..8].try_into().expect("fixed slice"));
    let k1 = u64::from_le_bytes(digest[8..16].try_into().expect("fixed slice"));
    (k0, k1)
}

/// 48-bit SipHash-2-4 fingerprint of a transaction ID.
pub fn short_id(k0: u64, k1: u64, txid: &Hash256) -> ShortId {
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(txid.as_bytes());
    hasher.finish() & SHORT_ID_MASK
}

/// Append a compact-size varint.
pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    if n < 253 {
        out.push(n as u8);
    } else if n <= u16::MAX as u64 {
        out.push(253);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= u32::MAX as u64 {
        out.push(254);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(255);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

/// Read a compact-size varint, advancing `pos`.
pub fn read_compact_size(data: &[u8], pos: &mut usize) -> Result<u64, ReadError> {
    let tag = *data.get(*pos).ok_or(ReadError::Invalid)?;
    *pos += 1;
    let value = match tag {
        0..=252 => tag as u64,
        253 => {
            let raw: [u8; 2] = data
                .get(*pos..*pos + 2)
                .and_then(|s| s.try_into().ok())
                .ok_or(ReadError::Invalid)?;
            *pos += 2;
            u16::from_le_bytes(raw) as u64
        }
        254 => {
            let raw: [u8; 4] = data
                .get(*pos..*pos + 4)
                .and_then(|s| s.try_into().ok())
                .ok_or(ReadError::Invalid)?;
            *pos += 4;
            u32::from_le_bytes(raw) as u64
        }
        255 => {
            let raw: [u8; 8] = data
                .get(*pos..*pos + 8)
                .and_then(|s| s.try_into().ok())
                .ok_or(ReadError::Invalid)?;
            *pos += 8;
            u64::from_le_bytes(raw)
        }
    };
    Ok(value)
}

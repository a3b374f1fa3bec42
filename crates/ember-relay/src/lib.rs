//! # ember-relay
//! Compact-block relay: bandwidth-efficient block propagation.
//!
//! Instead of a full block, a peer sends the header plus 48-bit SipHash
//! fingerprints (*short IDs*) of each transaction, prefilling only those
//! the receiver certainly lacks (the coinbase). The receiver resolves
//! short IDs against its own mempool and requests whatever is left. The
//! short-ID hash is keyed per-(header, nonce), so an attacker cannot
//! precompute collisions; when a collision does slip through, the
//! fallback is a full-block request, never an invalid block.

pub mod compact;
pub mod reconstruct;

pub use compact::{CompactBlock, PrefilledTransaction, ShortId};
pub use reconstruct::BlockReconstructor;

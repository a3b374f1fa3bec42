//! # ember-miner
//! Block template assembly.
//!
//! Unconfirmed transactions often depend on other pool transactions, so
//! selection works on *packages*: a transaction together with all its
//! in-pool ancestors, ranked by package fee rate. Ancestors already
//! placed in the block stop counting against their descendants through a
//! temporary modified view, so long chains fill blocks as profitably as
//! independent transactions.

pub mod assembler;
pub mod options;

pub use assembler::{BlockAssembler, BlockTemplate, ExtraNonce, TipInfo};
pub use options::{parse_money, AssemblerOptions};

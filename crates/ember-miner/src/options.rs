//! Assembler configuration and money parsing.

use ember_core::amount::{Amount, FeeRate};
use ember_core::constants::{
    COIN, DEFAULT_BLOCK_MAX_SIZE, DEFAULT_BLOCK_MAX_WEIGHT, DEFAULT_BLOCK_MIN_TX_FEE, NetworkType,
};
use ember_core::error::MinerError;

/// Block assembler configuration, typically sourced from the node's
/// CLI/environment surface.
#[derive(Clone, Debug)]
pub struct AssemblerOptions {
    /// Weight target; clamped to sane bounds at assembler construction.
    pub max_weight: u64,
    /// Serialized-size target; setting it below the consensus bound turns
    /// on byte-size accounting in addition to weight accounting.
    pub max_size: u64,
    /// Packages paying below this rate never enter a template.
    pub min_fee_rate: FeeRate,
    /// Header version override; honoured on regtest only.
    pub block_version: Option<u32>,
    pub network: NetworkType,
    /// Skip transactions received less than ten seconds ago, for two-pass
    /// assembly against recent-transaction churn.
    pub only_older_transactions: bool,
    /// Log the fee rate of every transaction placed in a template.
    pub print_priority: bool,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            max_weight: DEFAULT_BLOCK_MAX_WEIGHT,
            max_size: DEFAULT_BLOCK_MAX_SIZE,
            min_fee_rate: FeeRate::per_kb(DEFAULT_BLOCK_MIN_TX_FEE),
            block_version: None,
            network: NetworkType::default(),
            only_older_transactions: false,
            print_priority: false,
        }
    }
}

/// Parse a decimal EMBER amount ("0.0001") into embers.
///
/// At most eight fractional digits; no sign, no exponent.
pub fn parse_money(s: &str) -> Result<Amount, MinerError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(MinerError::InvalidAmount(s.into()));
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > 8 || (!whole.is_empty() && !whole.bytes().all(|b| b.is_ascii_digit())) {
        return Err(MinerError::InvalidAmount(s.into()));
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) || (whole.is_empty() && frac.is_empty()) {
        return Err(MinerError::InvalidAmount(s.into()));
    }

    let whole_value: Amount = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| MinerError::InvalidAmount(s.into()))?
    };
    let frac_value: Amount = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<8}");
        padded.parse().map_err(|_| MinerError::InvalidAmount(s.into()))?
    };

    whole_value
        .checked_mul(COIN)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or_else(|| MinerError::InvalidAmount(s.into()))
}

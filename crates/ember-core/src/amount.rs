//! Monetary amounts, fee rates, and weight arithmetic.
//!
//! Amounts are signed 64-bit counts of embers. Fee-rate division truncates
//! toward zero and never goes negative; value sums saturate at
//! [`MAX_MONEY`](crate::constants::MAX_MONEY) rather than overflow.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::WITNESS_SCALE_FACTOR;

/// A monetary amount in embers. Negative values appear only as deltas.
pub type Amount = i64;

/// A fee rate: embers per 1000 bytes of transaction size.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct FeeRate {
    per_kb: Amount,
}

impl FeeRate {
    /// Zero fee rate.
    pub const ZERO: Self = Self { per_kb: 0 };

    /// Fee rate from embers per 1000 bytes.
    pub fn per_kb(per_kb: Amount) -> Self {
        Self { per_kb }
    }

    /// Fee rate paid by `fee` embers on `size` bytes.
    ///
    /// Computed as `fee * 1000 / size`, truncating. A zero size yields the
    /// zero rate.
    pub fn from_fee(fee: Amount, size: u64) -> Self {
        if size == 0 {
            return Self::ZERO;
        }
        let per_kb = (fee as i128) * 1000 / (size as i128);
        Self {
            per_kb: clamp_amount(per_kb),
        }
    }

    /// The raw embers-per-kB value.
    pub fn per_kb_value(&self) -> Amount {
        self.per_kb
    }

    /// Fee owed for `size` bytes at this rate.
    ///
    /// Truncating multiplication then division by 1000; never negative,
    /// saturating at `Amount::MAX` on overflow.
    pub fn fee_for(&self, size: u64) -> Amount {
        let product = (self.per_kb as i128) * (size as i128);
        if product < 0 {
            return 0;
        }
        clamp_amount(product / 1000)
    }

    /// Scale the rate by an integer multiplier, saturating.
    pub fn scaled(&self, multiplier: i64) -> Self {
        Self {
            per_kb: self.per_kb.saturating_mul(multiplier),
        }
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} embers/kB", self.per_kb)
    }
}

fn clamp_amount(v: i128) -> Amount {
    if v > Amount::MAX as i128 {
        Amount::MAX
    } else if v < Amount::MIN as i128 {
        Amount::MIN
    } else {
        v as Amount
    }
}

/// Block weight of a transaction: base bytes count four, witness bytes one.
///
/// `base_size * (WITNESS_SCALE_FACTOR - 1) + total_size` is equivalent to
/// `base_size * 4 + witness_bytes`.
pub fn tx_weight(base_size: u64, total_size: u64) -> u64 {
    base_size * (WITNESS_SCALE_FACTOR - 1) + total_size
}

/// Virtual size: weight rounded up to the next whole base-equivalent byte.
pub fn vsize_from_weight(weight: u64) -> u64 {
    weight.div_ceil(WITNESS_SCALE_FACTOR)
}

/// Compare two fee/size ratios exactly, without division.
///
/// Returns the ordering of `a_fee/a_size` versus `b_fee/b_size` using
/// 128-bit cross multiplication. The index orderings and the eviction
/// benchmark all route through this.
pub fn cmp_feerate(a_fee: Amount, a_size: u64, b_fee: Amount, b_size: u64) -> std::cmp::Ordering {
    let lhs = (a_fee as i128) * (b_size as i128);
    let rhs = (b_fee as i128) * (a_size as i128);
    lhs.cmp(&rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    // --- FeeRate::fee_for ---

    #[test]
    fn fee_for_truncates() {
        let rate = FeeRate::per_kb(1000);
        assert_eq!(rate.fee_for(250), 250);
        assert_eq!(rate.fee_for(999), 999);
        // 1999 * 1000 / 1000 with rate 1: 1 ember per 1000 bytes
        assert_eq!(FeeRate::per_kb(1).fee_for(1999), 1);
    }

    #[test]
    fn fee_for_never_negative() {
        let rate = FeeRate::per_kb(-5000);
        assert_eq!(rate.fee_for(250), 0);
        assert_eq!(rate.fee_for(0), 0);
    }

    #[test]
    fn fee_for_saturates() {
        let rate = FeeRate::per_kb(Amount::MAX);
        assert_eq!(rate.fee_for(u64::MAX), Amount::MAX);
    }

    #[test]
    fn fee_for_zero_size() {
        assert_eq!(FeeRate::per_kb(1000).fee_for(0), 0);
    }

    // --- FeeRate::from_fee ---

    #[test]
    fn from_fee_round_trips_per_kb() {
        let rate = FeeRate::from_fee(2000, 1000);
        assert_eq!(rate.per_kb_value(), 2000);
    }

    #[test]
    fn from_fee_zero_size_is_zero() {
        assert_eq!(FeeRate::from_fee(1000, 0), FeeRate::ZERO);
    }

    #[test]
    fn from_fee_truncates_toward_zero() {
        // 999 embers on 1000 bytes: 999 per kB exactly.
        assert_eq!(FeeRate::from_fee(999, 1000).per_kb_value(), 999);
        // 1 ember on 3 bytes: 333 per kB, truncated.
        assert_eq!(FeeRate::from_fee(1, 3).per_kb_value(), 333);
    }

    #[test]
    fn scaled_saturates() {
        let rate = FeeRate::per_kb(Amount::MAX / 2 + 1);
        assert_eq!(rate.scaled(2).per_kb_value(), Amount::MAX);
    }

    // --- weight / vsize ---

    #[test]
    fn weight_without_witness() {
        // No witness: total == base, weight = 4 * base.
        assert_eq!(tx_weight(250, 250), 1000);
    }

    #[test]
    fn weight_with_witness() {
        // 50 witness bytes count once each.
        assert_eq!(tx_weight(250, 300), 1050);
    }

    #[test]
    fn vsize_rounds_up() {
        assert_eq!(vsize_from_weight(1000), 250);
        assert_eq!(vsize_from_weight(1001), 251);
        assert_eq!(vsize_from_weight(3), 1);
        assert_eq!(vsize_from_weight(0), 0);
    }

    // --- cmp_feerate ---

    #[test]
    fn cmp_feerate_exact() {
        // 3/2 > 4/3
        assert_eq!(cmp_feerate(3, 2, 4, 3), Ordering::Greater);
        // 1/2 == 2/4
        assert_eq!(cmp_feerate(1, 2, 2, 4), Ordering::Equal);
        assert_eq!(cmp_feerate(1, 3, 1, 2), Ordering::Less);
    }

    #[test]
    fn cmp_feerate_no_overflow() {
        assert_eq!(
            cmp_feerate(Amount::MAX, 1, Amount::MAX, 2),
            Ordering::Greater
        );
    }
}

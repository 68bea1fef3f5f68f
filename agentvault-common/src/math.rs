//! Amount and fee arithmetic
//!
//! All wallet-internal amounts are integer minor units (`u64`). Decimal
//! major-unit values only appear in configuration and at presentation time,
//! and are converted here with `rust_decimal` so no floating point ever
//! touches a balance.
//!
//! Example:
//! ```
//! use agentvault_common::math::{from_major, to_major};
//! use rust_decimal_macros::dec;
//!
//! let minor = from_major(dec!(1.5), 100_000_000).unwrap();
//! assert_eq!(minor, 150_000_000);
//! assert_eq!(to_major(minor, 100_000_000), dec!(1.5));
//! ```

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::WalletError;

/// Fixed overhead of a legacy transaction: version, locktime and counts
pub const TX_OVERHEAD_BYTES: u64 = 10;

/// Size of one signed pay-to-pubkey-hash input
pub const P2PKH_INPUT_BYTES: u64 = 148;

/// Size of one pay-to-pubkey-hash output
pub const P2PKH_OUTPUT_BYTES: u64 = 34;

/// Convert minor units to a major-unit decimal
pub fn to_major(minor: u64, minor_per_major: u64) -> Decimal {
    if minor_per_major == 0 {
        return Decimal::ZERO;
    }
    Decimal::from(minor) / Decimal::from(minor_per_major)
}

/// Convert a major-unit decimal to minor units
///
/// Fails on negative values, on precision finer than one minor unit, and on
/// values that do not fit a `u64`.
pub fn from_major(major: Decimal, minor_per_major: u64) -> Result<u64, WalletError> {
    if major.is_sign_negative() && !major.is_zero() {
        return Err(WalletError::InvalidAmount(format!(
            "negative amount not allowed: {}",
            major
        )));
    }

    let scaled = major
        .checked_mul(Decimal::from(minor_per_major))
        .ok_or_else(|| WalletError::InvalidAmount(format!("amount too large: {}", major)))?;

    if scaled.fract() != Decimal::ZERO {
        return Err(WalletError::InvalidAmount(format!(
            "amount {} is finer than one minor unit",
            major
        )));
    }

    scaled
        .to_u64()
        .ok_or_else(|| WalletError::InvalidAmount(format!("amount out of range: {}", major)))
}

/// Estimate the serialized size of a P2PKH transaction
pub fn estimate_tx_size(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_BYTES + P2PKH_INPUT_BYTES * inputs as u64 + P2PKH_OUTPUT_BYTES * outputs as u64
}

/// Fee for a transaction with the given shape at `fee_rate` minor units per byte
pub fn calculate_fee(inputs: usize, outputs: usize, fee_rate: u64) -> u64 {
    estimate_tx_size(inputs, outputs).saturating_mul(fee_rate)
}

/// Whether an amount is below the dust threshold
pub fn is_dust_amount(amount: u64, dust_threshold: u64) -> bool {
    amount < dust_threshold
}

/// Format minor units for display, e.g. `12.5 DOGE`
pub fn format_amount(minor: u64, minor_per_major: u64, ticker: &str) -> String {
    format!("{} {}", to_major(minor, minor_per_major).normalize(), ticker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn size_matches_p2pkh_model() {
        assert_eq!(estimate_tx_size(1, 1), 192);
        assert_eq!(estimate_tx_size(1, 2), 226);
        assert_eq!(estimate_tx_size(3, 2), 522);
    }

    #[test]
    fn fee_is_rate_times_size() {
        assert_eq!(calculate_fee(1, 2, 1_000), 226_000);
        assert_eq!(calculate_fee(0, 0, 0), 0);
    }

    #[test]
    fn from_major_rejects_sub_unit_precision() {
        assert!(from_major(dec!(0.000000001), 100_000_000).is_err());
        assert!(from_major(dec!(-1), 100_000_000).is_err());
        assert_eq!(from_major(dec!(5000), 100_000_000).unwrap(), 500_000_000_000);
    }

    #[test]
    fn format_amount_is_normalized() {
        assert_eq!(format_amount(1_250_000_000, 100_000_000, "DOGE"), "12.5 DOGE");
    }
}

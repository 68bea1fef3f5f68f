//! Coin selection for single-recipient spends
//!
//! Two strategies are tried in order:
//!
//! 1. **Exact match**: a single output that covers the target and its own
//!    one-input fee, leaving a remainder below the dust threshold. The
//!    remainder goes to the miner instead of creating an unspendable change
//!    output. Among several matches the smallest remainder wins.
//! 2. **Largest first**: outputs sorted by value, descending, accumulated
//!    until the inputs cover target plus fee. A change output is added unless
//!    it would be dust, in which case it is folded into the fee.
//!
//! # Security Considerations
//!
//! - The selector is pure: it never locks or mutates outputs. The ledger
//!   runs it inside the same critical section that locks the result
//! - Every returned selection satisfies `inputs == target + fee + change`

use serde::Serialize;

use agentvault_common::error::{WalletError, WalletResult};
use agentvault_common::math::calculate_fee;

use crate::utxo_management::UnspentOutput;

/// How a selection was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    ExactMatch,
    LargestFirst,
}

/// Inputs chosen for a spend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<UnspentOutput>,
    pub target: u64,
    pub fee: u64,
    /// Zero when no change output is created
    pub change: u64,
    pub strategy: SelectionStrategy,
}

impl Selection {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|u| u.amount).sum()
    }

    pub fn has_change(&self) -> bool {
        self.change > 0
    }

    /// Number of outputs the transaction will carry
    pub fn output_count(&self) -> usize {
        if self.has_change() {
            2
        } else {
            1
        }
    }
}

/// Coin selector parameterised by the chain's dust threshold
#[derive(Debug, Clone, Copy)]
pub struct CoinSelector {
    dust_threshold: u64,
}

impl CoinSelector {
    pub fn new(dust_threshold: u64) -> Self {
        Self { dust_threshold }
    }

    pub fn dust_threshold(&self) -> u64 {
        self.dust_threshold
    }

    /// Choose inputs paying `target` at `fee_rate` minor units per byte
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` for a zero target
    /// - `InsufficientFunds` when even every candidate cannot cover target plus fee
    pub fn select(&self, candidates: &[UnspentOutput], target: u64, fee_rate: u64) -> WalletResult<Selection> {
        if target == 0 {
            return Err(WalletError::InvalidAmount("target must be greater than zero".into()));
        }

        if let Some(selection) = self.exact_match(candidates, target, fee_rate) {
            return Ok(selection);
        }
        self.largest_first(candidates, target, fee_rate)
    }

    fn exact_match(&self, candidates: &[UnspentOutput], target: u64, fee_rate: u64) -> Option<Selection> {
        let fee = calculate_fee(1, 1, fee_rate);
        let needed = target.checked_add(fee)?;

        candidates
            .iter()
            .filter(|u| u.amount >= needed && u.amount - needed < self.dust_threshold)
            .min_by_key(|u| u.amount - needed)
            .map(|u| Selection {
                inputs: vec![u.clone()],
                target,
                fee: u.amount - target,
                change: 0,
                strategy: SelectionStrategy::ExactMatch,
            })
    }

    fn largest_first(&self, candidates: &[UnspentOutput], target: u64, fee_rate: u64) -> WalletResult<Selection> {
        let mut sorted: Vec<&UnspentOutput> = candidates.iter().collect();
        sorted.sort_by(|a, b| b.amount.cmp(&a.amount));

        let mut chosen: Vec<UnspentOutput> = Vec::new();
        let mut total: u64 = 0;

        for utxo in sorted {
            chosen.push(utxo.clone());
            total = total.saturating_add(utxo.amount);
            let n = chosen.len();

            let fee_with_change = calculate_fee(n, 2, fee_rate);
            if total >= target.saturating_add(fee_with_change) {
                let change = total - target - fee_with_change;
                let (fee, change) = if change < self.dust_threshold {
                    (total - target, 0)
                } else {
                    (fee_with_change, change)
                };
                return Ok(Selection {
                    inputs: chosen,
                    target,
                    fee,
                    change,
                    strategy: SelectionStrategy::LargestFirst,
                });
            }

            // Without room for change the remainder is below one output's cost
            let fee_no_change = calculate_fee(n, 1, fee_rate);
            if total >= target.saturating_add(fee_no_change) {
                return Ok(Selection {
                    inputs: chosen,
                    target,
                    fee: total - target,
                    change: 0,
                    strategy: SelectionStrategy::LargestFirst,
                });
            }
        }

        let needed = target.saturating_add(calculate_fee(candidates.len().max(1), 1, fee_rate));
        Err(WalletError::InsufficientFunds {
            needed,
            available: total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUST: u64 = 1_000_000;
    const RATE: u64 = 1_000;

    fn utxo(n: u32, amount: u64) -> UnspentOutput {
        UnspentOutput::new(&format!("{:064x}", n), 0, "D_test", amount, 1)
    }

    #[test]
    fn zero_target_is_rejected() {
        let selector = CoinSelector::new(DUST);
        assert!(matches!(
            selector.select(&[utxo(1, DUST * 10)], 0, RATE),
            Err(WalletError::InvalidAmount(_))
        ));
    }

    #[test]
    fn exact_match_absorbs_remainder_into_fee() {
        let selector = CoinSelector::new(DUST);
        let fee = calculate_fee(1, 1, RATE);
        let target = 50_000_000;
        let candidates = vec![
            utxo(1, 500_000_000),
            utxo(2, target + fee + 10),
            utxo(3, target + fee + 500_000),
        ];

        let selection = selector.select(&candidates, target, RATE).unwrap();
        assert_eq!(selection.strategy, SelectionStrategy::ExactMatch);
        assert_eq!(selection.inputs[0].txid, format!("{:064x}", 2));
        assert_eq!(selection.fee, fee + 10);
        assert!(!selection.has_change());
    }

    #[test]
    fn largest_first_creates_change() {
        let selector = CoinSelector::new(DUST);
        let candidates = vec![utxo(1, 100_000_000), utxo(2, 300_000_000), utxo(3, 200_000_000)];

        let selection = selector.select(&candidates, 350_000_000, RATE).unwrap();
        assert_eq!(selection.strategy, SelectionStrategy::LargestFirst);
        let picked: Vec<u64> = selection.inputs.iter().map(|u| u.amount).collect();
        assert_eq!(picked, vec![300_000_000, 200_000_000]);
        assert_eq!(selection.fee, calculate_fee(2, 2, RATE));
        assert_eq!(
            selection.input_total(),
            selection.target + selection.fee + selection.change
        );
    }

    #[test]
    fn dust_change_is_folded() {
        let selector = CoinSelector::new(DUST);
        let target = 100_000_000;
        // Neither output covers the target alone
        let first = 60_000_000;
        let second = target - first + calculate_fee(2, 2, RATE) + DUST / 2;
        let candidates = vec![utxo(1, first), utxo(2, second)];
        let selection = selector.select(&candidates, target, RATE).unwrap();
        assert_eq!(selection.strategy, SelectionStrategy::LargestFirst);
        assert_eq!(selection.change, 0);
        assert_eq!(selection.fee, first + second - target);
    }

    #[test]
    fn insufficient_funds_reports_available() {
        let selector = CoinSelector::new(DUST);
        let err = selector
            .select(&[utxo(1, 10_000_000), utxo(2, 5_000_000)], 20_000_000, RATE)
            .unwrap_err();
        match err {
            WalletError::InsufficientFunds { needed, available } => {
                assert_eq!(available, 15_000_000);
                assert!(needed > 20_000_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

//! Block subsidy and money-range rules

use crate::constants::*;
use crate::error::{ConsensusError, Result};

/// GetBlockSubsidy: ℕ × ℕ → ℕ
///
/// Subsidy halves every `halving_interval` blocks.
/// Formula: subsidy = 50 * C * 2^(-⌊h/H⌋), zero after 64 halvings.
pub fn get_block_subsidy(height: u32, halving_interval: u32) -> u64 {
    let halvings = height / halving_interval;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// MoneyRange: 0 ≤ v ≤ MAX_MONEY
pub fn money_range(value: u64) -> bool {
    value <= MAX_MONEY
}

/// Sum of values, failing when any partial sum leaves the money range
pub fn sum_in_range<I: IntoIterator<Item = u64>>(values: I) -> Result<u64> {
    let mut total = 0u64;
    for v in values {
        total = total
            .checked_add(v)
            .filter(|t| money_range(*t))
            .ok_or_else(|| ConsensusError::EconomicValidation("bad-txns-inputvalues-outofrange".into()))?;
    }
    Ok(total)
}

/// Fee of a transaction given its input and output totals
pub fn calculate_fee(total_in: u64, total_out: u64) -> Result<u64> {
    total_in
        .checked_sub(total_out)
        .ok_or_else(|| ConsensusError::EconomicValidation("bad-txns-in-belowout".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_block_subsidy_genesis() {
        assert_eq!(get_block_subsidy(0, 210_000), INITIAL_SUBSIDY);
    }

    #[test]
    fn test_get_block_subsidy_halvings() {
        assert_eq!(get_block_subsidy(209_999, 210_000), 50 * COIN);
        assert_eq!(get_block_subsidy(210_000, 210_000), 25 * COIN);
        assert_eq!(get_block_subsidy(420_000, 210_000), 1_250_000_000);
        // regtest halves every 150 blocks
        assert_eq!(get_block_subsidy(150, 150), 25 * COIN);
    }

    #[test]
    fn test_subsidy_zero_after_64_halvings() {
        assert_eq!(get_block_subsidy(64 * 210_000, 210_000), 0);
    }

    #[test]
    fn test_total_supply_below_max_money() {
        let total: u64 = (0..64u32).map(|h| get_block_subsidy(h * 210_000, 210_000) * 210_000).sum();
        assert!(money_range(total));
    }

    #[test]
    fn test_sum_in_range() {
        assert_eq!(sum_in_range([1, 2, 3]).unwrap(), 6);
        assert!(sum_in_range([MAX_MONEY, 1]).is_err());
        assert!(calculate_fee(10, 11).is_err());
        assert_eq!(calculate_fee(11, 10).unwrap(), 1);
    }
}

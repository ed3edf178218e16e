//! Monetary constants and the block subsidy schedule
//!
//! ## Units
//! - **Satoshi**: the smallest unit, every on-chain value is a count of these
//! - **Coin**: 100,000,000 satoshis
//!
//! ## Subsidy
//! The first block pays [`INITIAL_BLOCK_REWARD`]. Every
//! [`REDUCE_REWARD_EVERY`] blocks the reward is multiplied by
//! `REDUCE_REWARD_FACTOR_NUM / REDUCE_REWARD_FACTOR_DEN` and truncated, so
//! the rounding compounds step by step.

/// Number of satoshis in one coin
pub const SATOSHIS_PER_COIN: u64 = 100_000_000;

/// Reward of block 0 in satoshis (50 coins)
pub const INITIAL_BLOCK_REWARD: u64 = 50 * SATOSHIS_PER_COIN;

/// One week of one-minute blocks
pub const REDUCE_REWARD_EVERY: u32 = 10_080;

pub const REDUCE_REWARD_FACTOR_NUM: u64 = 9;
pub const REDUCE_REWARD_FACTOR_DEN: u64 = 10;

/// Floor for any free transaction fee in satoshis
pub const MIN_FEE: u64 = 1_000;

/// Per-byte fee rate for free transactions
pub const MIN_FEE_PER_BYTE: u64 = 10;

/// Coinbase subsidy for the block with id `block_id`
pub fn block_subsidy(block_id: u32) -> u64 {
    let mut reward = INITIAL_BLOCK_REWARD;
    for _ in 0..block_id / REDUCE_REWARD_EVERY {
        reward = reward * REDUCE_REWARD_FACTOR_NUM / REDUCE_REWARD_FACTOR_DEN;
        if reward == 0 {
            break;
        }
    }
    reward
}

/// Smallest fee a free transaction of `size` bytes must pay
pub fn minimum_fee(size: usize) -> u64 {
    (size as u64)
        .saturating_mul(MIN_FEE_PER_BYTE)
        .max(MIN_FEE)
}

pub mod conversions {
    use super::*;

    pub fn satoshis_to_coins(satoshis: u64) -> f64 {
        satoshis as f64 / SATOSHIS_PER_COIN as f64
    }

    /// Format satoshis as a human-readable string
    ///
    /// # Examples
    /// ```
    /// use architect_ledger::core::monetary::conversions::format_satoshis;
    /// assert_eq!(format_satoshis(100_000_000), "1.00000000 coins");
    /// assert_eq!(format_satoshis(1_000), "0.00001000 coins");
    /// ```
    pub fn format_satoshis(satoshis: u64) -> String {
        format!("{:.8} coins", satoshis_to_coins(satoshis))
    }
}

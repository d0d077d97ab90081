//! Deposit economics. Rates are parts per billion.

use crate::params::FinalizationParams;
use crate::types::{Amount, COIN};

pub const PPB: u64 = 1_000_000_000;

pub fn isqrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let n = n as u128;
    let mut x = (n as f64).sqrt() as u128;
    // float estimate can be off by one either way
    while x * x > n {
        x -= 1;
    }
    while (x + 1) * (x + 1) <= n {
        x += 1;
    }
    x as u64
}

/// `amount * rate / PPB` without overflow, saturating at `Amount::MAX`
pub fn apply_rate(amount: Amount, rate_ppb: u64) -> Amount {
    let scaled = amount as u128 * rate_ppb as u128 / PPB as u128;
    Amount::try_from(scaled).unwrap_or(Amount::MAX)
}

/// Per-vote interest for the coming epoch
pub fn interest_rate(params: &FinalizationParams, total_deposits: Amount) -> u64 {
    params.base_interest_factor / isqrt(total_deposits / COIN + 1)
}

/// Penalty for validators that did not vote while finality is delayed
pub fn penalty_rate(params: &FinalizationParams, epochs_since_finalization: u64) -> u64 {
    params
        .base_penalty_factor
        .saturating_mul(epochs_since_finalization.saturating_sub(2))
}

/// Part of a slashed deposit that is destroyed.
///
/// Scales with how much deposit was slashed in the same epoch, capped at the full deposit.
pub fn slash_forfeit(
    params: &FinalizationParams,
    deposit: Amount,
    slashed_this_epoch: Amount,
    total_deposits: Amount,
) -> Amount {
    if total_deposits == 0 {
        return deposit;
    }
    let scaled = deposit as u128
        * params.slash_fraction_multiplier as u128
        * slashed_this_epoch as u128
        / total_deposits as u128;
    scaled.min(deposit as u128) as Amount
}

pub fn slash_bounty(params: &FinalizationParams, deposit: Amount) -> Amount {
    deposit / params.bounty_fraction_denominator.max(1)
}

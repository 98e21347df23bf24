//! Mathematical Utilities for totem claim staking
//!
//! Checked fixed-point arithmetic for fees, pro-rata redemption estimates,
//! proportional withdrawals and slippage floors. All amounts are base units.

use crate::constants::precision;
use crate::errors::{EngineError, EngineResult};
use crate::types::{Amount, RecoveryEstimate, Shares, VaultState};

/// Apply a basis-point rate to an amount, rounding down
///
/// fee = amount * bps / denominator
pub fn apply_bps(amount: u128, bps: u64, denominator: u64) -> EngineResult<u128> {
    if denominator == 0 {
        return Err(EngineError::DivisionByZero);
    }
    amount
        .checked_mul(bps as u128)
        .ok_or(EngineError::Overflow)?
        .checked_div(denominator as u128)
        .ok_or(EngineError::DivisionByZero)
}

/// Pro-rata share of vault assets for a share amount
///
/// gross = shares * total_assets / total_shares
///
/// # Returns
/// Zero for an empty vault
pub fn pro_rata_assets(shares: Shares, vault: &VaultState) -> EngineResult<Amount> {
    if vault.total_shares == 0 {
        return Ok(0);
    }
    let capped = shares.min(vault.total_shares);
    let gross = capped
        .checked_mul(vault.total_assets)
        .ok_or(EngineError::Overflow)?
        / vault.total_shares; // Safe: checked above

    Ok(gross)
}

/// Estimate what redeeming `shares` would return, net of the exit fee
///
/// # Arguments
/// * `shares` - Shares to redeem
/// * `vault` - Current vault totals
/// * `exit_fee_bps` - Exit fee in basis points
/// * `denominator` - Basis points denominator
pub fn estimate_recovery(
    shares: Shares,
    vault: &VaultState,
    exit_fee_bps: u64,
    denominator: u64,
) -> EngineResult<RecoveryEstimate> {
    let gross_assets = pro_rata_assets(shares, vault)?;
    recovery_from_gross(gross_assets, exit_fee_bps, denominator)
}

/// Split gross redeem proceeds into exit fee and net assets
pub fn recovery_from_gross(
    gross_assets: Amount,
    exit_fee_bps: u64,
    denominator: u64,
) -> EngineResult<RecoveryEstimate> {
    let exit_fee = apply_bps(gross_assets, exit_fee_bps, denominator)?;
    let net_assets = gross_assets.checked_sub(exit_fee).ok_or(EngineError::Overflow)?;

    Ok(RecoveryEstimate {
        gross_assets,
        exit_fee,
        net_assets,
    })
}

/// Shares to redeem when withdrawing `percent` of a position
///
/// requested = floor(shares * percent / 100)
pub fn proportional_shares(shares: Shares, percent: u8) -> EngineResult<Shares> {
    if percent > 100 {
        return Err(EngineError::InvalidInput {
            param: "percent",
            reason: "Withdraw percentage must be between 0 and 100",
        });
    }
    Ok(shares
        .checked_mul(percent as u128)
        .ok_or(EngineError::Overflow)?
        / precision::PERCENT_PRECISION)
}

/// Lower bound accepted for a quoted amount under a slippage tolerance
///
/// floor = quoted - quoted * slippage_bps / denominator
pub fn slippage_floor(quoted: u128, slippage_bps: u64, denominator: u64) -> EngineResult<u128> {
    if slippage_bps as u128 > denominator as u128 {
        return Err(EngineError::InvalidInput {
            param: "slippage_bps",
            reason: "Slippage cannot exceed 100%",
        });
    }
    let tolerance = apply_bps(quoted, slippage_bps, denominator)?;
    Ok(quoted - tolerance) // Safe: tolerance <= quoted
}

/// Safe addition with overflow check
pub fn safe_add(a: u128, b: u128) -> EngineResult<u128> {
    a.checked_add(b).ok_or(EngineError::Overflow)
}

/// Sum amounts with overflow check
pub fn checked_sum<I: IntoIterator<Item = u128>>(amounts: I) -> EngineResult<u128> {
    amounts.into_iter().try_fold(0u128, safe_add)
}

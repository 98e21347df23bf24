//! Validation Helpers for totem claim staking
//!
//! Reusable guard clauses for the resolver and the settlement orchestrator.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use totem_common::{check, validation::require_min_deposit};
//!
//! check!(!items.is_empty(), EngineError::EmptyCart);
//! require_min_deposit(amount, config.min_deposit)?;
//! ```

use crate::{
    errors::{EngineError, EngineResult},
    types::{Address, Amount, Direction, Shares, VaultRef},
};

// ============ Validation Macro ============

/// Check a condition and return an error if it fails.
///
/// # Examples
///
/// ```rust,ignore
/// check!(
///     balance >= required,
///     EngineError::InsufficientBalance { available: balance, required }
/// );
/// ```
#[macro_export]
macro_rules! check {
    ($condition:expr, $error:expr) => {
        if !($condition) {
            return Err($error);
        }
    };
}


// ============ Session ============

/// Validates that a wallet address is available
pub fn require_connected(address: Option<Address>) -> EngineResult<Address> {
    address.ok_or(EngineError::WalletNotConnected)
}

// ============ Amounts ============

/// Validates that an amount is positive
#[inline]
pub fn require_positive(amount: u128, param: &'static str) -> EngineResult<()> {
    check!(
        amount > 0,
        EngineError::InvalidInput {
            param,
            reason: "Amount must be greater than zero",
        }
    );
    Ok(())
}

/// Validates a deposit against the protocol minimum
#[inline]
pub fn require_min_deposit(amount: Amount, minimum: Amount) -> EngineResult<()> {
    check!(amount >= minimum, EngineError::BelowMinimumDeposit { amount, minimum });
    Ok(())
}

/// Validates that available funds cover the required value
#[inline]
pub fn require_sufficient_balance(available: Amount, required: Amount) -> EngineResult<()> {
    check!(
        available >= required,
        EngineError::InsufficientBalance { available, required }
    );
    Ok(())
}

// ============ Redeems ============

/// Resolves a redeem request against the chain's redeemable maximum
///
/// # Returns
/// * The request unchanged if it fits
/// * The maximum if the request exceeds a positive maximum
/// * `InsufficientVaultShares` if nothing is redeemable
pub fn clamp_redeem(vault: VaultRef, requested: Shares, available: Shares) -> EngineResult<Shares> {
    if requested <= available {
        return Ok(requested);
    }
    check!(
        available > 0,
        EngineError::InsufficientVaultShares { vault, requested, available }
    );
    Ok(available)
}

// ============ Claims ============

/// Validates the direction of a stake that would create a claim
pub fn require_genesis_direction(direction: Direction) -> EngineResult<()> {
    check!(
        direction == Direction::Support,
        EngineError::TransitionBlocked {
            reason: "a new claim can only be created with a support deposit",
        }
    );
    Ok(())
}

/// Validates that parallel call arrays have equal, non-zero length
pub fn require_parallel(lengths: &[usize]) -> EngineResult<usize> {
    let first = lengths.first().copied().unwrap_or(0);
    check!(
        first > 0,
        EngineError::InvalidInput {
            param: "call",
            reason: "Call must carry at least one item",
        }
    );
    check!(
        lengths.iter().all(|l| *l == first),
        EngineError::InvalidInput {
            param: "call",
            reason: "Parallel argument arrays differ in length",
        }
    );
    Ok(first)
}

//! Error Types for totem claim staking
//!
//! Every error carries a stable machine-readable code (`code()`) and a
//! human-readable message (`Display`). Amount-related errors expose the
//! concrete shortfall so callers can offer a one-click correction.

use crate::types::{Amount, ClaimInfo, Shares, VaultRef};

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Main error enum for the staking engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    // ============ Control Flow ============
    /// Claim already exists; the caller should vote on it instead
    #[error("claim {} already exists", .claim.triple.id)]
    ClaimExists { claim: Box<ClaimInfo> },

    // ============ Session Errors ============
    /// No wallet address is available
    #[error("wallet is not connected")]
    WalletNotConnected,

    /// User declined to sign
    #[error("signature request was rejected by the user")]
    UserRejectedSignature,

    /// Confirmation did not arrive within the caller-supplied bound
    #[error("transaction confirmation timed out")]
    ConfirmationTimedOut,

    // ============ Amount Errors ============
    /// Deposit below the protocol minimum
    #[error("deposit of {amount} is below the minimum of {minimum}")]
    BelowMinimumDeposit { amount: Amount, minimum: Amount },

    /// Wallet funds do not cover the required value
    #[error("insufficient balance: {available} available, {required} required")]
    InsufficientBalance { available: Amount, required: Amount },

    /// Redeem request exceeds what the vault can honor
    #[error("vault {} on {} can redeem at most {available} shares, {requested} requested", .vault.term_id, .vault.curve)]
    InsufficientVaultShares {
        vault: VaultRef,
        requested: Shares,
        available: Shares,
    },

    /// Result fell below the caller's slippage floor
    #[error("slippage exceeded: {reason}")]
    SlippageExceeded { reason: String },

    // ============ Cart Errors ============
    /// Nothing to settle
    #[error("cart is empty")]
    EmptyCart,

    /// Cart cannot take more items
    #[error("cart is full ({maximum} items)")]
    CartFull { maximum: usize },

    /// The requested stake is blocked by the transition rules
    #[error("transition blocked: {reason}")]
    TransitionBlocked { reason: &'static str },

    // ============ Settlement Errors ============
    /// The batched redeem call failed; no deposit was attempted
    #[error("withdraw phase failed: {cause}")]
    WithdrawPhaseFailed { cause: Box<EngineError> },

    /// The deposit phase failed after withdrawals were committed
    #[error("deposit phase failed after {withdrawn_items} withdrawals were committed: {cause}")]
    DepositPhaseFailed {
        cause: Box<EngineError>,
        withdrawn_items: usize,
    },

    // ============ Lookup Errors ============
    /// Indexer or chain read failed; safe to retry
    #[error("lookup failed: {reason}")]
    LookupFailed { reason: String },

    // ============ Input Validation Errors ============
    /// Invalid input parameter
    #[error("invalid {param}: {reason}")]
    InvalidInput { param: &'static str, reason: &'static str },

    /// Runtime configuration is unusable
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // ============ Math Errors ============
    /// Arithmetic overflow occurred
    #[error("arithmetic overflow")]
    Overflow,

    /// Division by zero
    #[error("division by zero")]
    DivisionByZero,

    // ============ Fallback ============
    /// Anything the engine cannot classify
    #[error("unknown error: {reason}")]
    Unknown { reason: String },
}

impl EngineError {
    /// Returns a stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::ClaimExists { .. } => "CLAIM_EXISTS",
            Self::WalletNotConnected => "WALLET_NOT_CONNECTED",
            Self::UserRejectedSignature => "USER_REJECTED",
            Self::ConfirmationTimedOut => "CONFIRMATION_TIMEOUT",
            Self::BelowMinimumDeposit { .. } => "BELOW_MINIMUM_DEPOSIT",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::InsufficientVaultShares { .. } => "INSUFFICIENT_VAULT_SHARES",
            Self::SlippageExceeded { .. } => "SLIPPAGE_EXCEEDED",
            Self::EmptyCart => "EMPTY_CART",
            Self::CartFull { .. } => "CART_FULL",
            Self::TransitionBlocked { .. } => "TRANSITION_BLOCKED",
            Self::WithdrawPhaseFailed { .. } => "WITHDRAW_FAILED",
            Self::DepositPhaseFailed { .. } => "DEPOSIT_FAILED",
            Self::LookupFailed { .. } => "LOOKUP_FAILED",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Overflow => "MATH_OVERFLOW",
            Self::DivisionByZero => "DIVISION_BY_ZERO",
            Self::Unknown { .. } => "UNKNOWN_ERROR",
        }
    }

    /// Returns true if the user can fix this by changing the request
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BelowMinimumDeposit { .. }
                | Self::InsufficientBalance { .. }
                | Self::SlippageExceeded { .. }
                | Self::WalletNotConnected
        )
    }

    /// Returns true if the same call may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LookupFailed { .. } | Self::ConfirmationTimedOut)
    }

    /// Returns true for control-flow signals that must not be shown as failures
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Self::ClaimExists { .. })
    }

    /// Amount the user is short by, for amount-related errors
    pub fn shortfall(&self) -> Option<Amount> {
        match self {
            Self::BelowMinimumDeposit { amount, minimum } => Some(minimum.saturating_sub(*amount)),
            Self::InsufficientBalance { available, required } => Some(required.saturating_sub(*available)),
            Self::DepositPhaseFailed { cause, .. } | Self::WithdrawPhaseFailed { cause } => cause.shortfall(),
            _ => None,
        }
    }

    /// Innermost cause of a phase failure
    pub fn root_cause(&self) -> &EngineError {
        match self {
            Self::WithdrawPhaseFailed { cause } | Self::DepositPhaseFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Curve, TermId, Triple};
    use std::collections::BTreeSet;

    #[test]
    fn test_error_codes_unique() {
        let vault = VaultRef::new(TermId::atom("x"), Curve::Stable);
        let errors = [
            EngineError::WalletNotConnected,
            EngineError::BelowMinimumDeposit { amount: 1, minimum: 2 },
            EngineError::InsufficientBalance { available: 1, required: 2 },
            EngineError::InsufficientVaultShares { vault, requested: 2, available: 1 },
            EngineError::UserRejectedSignature,
            EngineError::EmptyCart,
            EngineError::WithdrawPhaseFailed { cause: Box::new(EngineError::EmptyCart) },
            EngineError::DepositPhaseFailed { cause: Box::new(EngineError::EmptyCart), withdrawn_items: 0 },
            EngineError::Unknown { reason: "x".into() },
        ];

        let codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        let unique: BTreeSet<_> = codes.iter().collect();
        assert_eq!(codes.len(), unique.len(), "Error codes must be unique");
    }

    #[test]
    fn test_shortfall() {
        let err = EngineError::BelowMinimumDeposit { amount: 40, minimum: 100 };
        assert_eq!(err.shortfall(), Some(60));

        let err = EngineError::InsufficientBalance { available: 500, required: 800 };
        assert_eq!(err.shortfall(), Some(300));
        assert!(err.is_recoverable());

        let wrapped = EngineError::DepositPhaseFailed { cause: Box::new(err), withdrawn_items: 2 };
        assert_eq!(wrapped.shortfall(), Some(300));
        assert_eq!(wrapped.code(), "DEPOSIT_FAILED");
        assert_eq!(wrapped.root_cause().code(), "INSUFFICIENT_BALANCE");

        assert_eq!(EngineError::EmptyCart.shortfall(), None);
    }

    #[test]
    fn test_claim_exists_is_control_flow() {
        let triple = Triple::new(TermId::atom("a"), TermId::atom("b"), TermId::atom("c"));
        let err = EngineError::ClaimExists { claim: Box::new(ClaimInfo::new(triple)) };
        assert!(err.is_control_flow());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("already exists"));
    }
}

//! Runtime protocol configuration
//!
//! Defaults come from [`crate::constants`]; any subset of fields can be
//! overridden from JSON.

use serde::{Deserialize, Serialize};

use crate::constants::{cart, dust, fees, limits};
use crate::errors::{EngineError, EngineResult};
use crate::math::apply_bps;
use crate::types::{Amount, Curve, Shares};

/// Fee percentages, all in basis points over `fee_denominator`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Entry fee on deposits
    pub entry_fee_bps: u64,
    /// Exit fee on redeems
    pub exit_fee_bps: u64,
    /// Protocol share of the entry fee
    pub protocol_fee_bps: u64,
    /// Basis points denominator
    pub fee_denominator: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            entry_fee_bps: fees::ENTRY_FEE_BPS,
            exit_fee_bps: fees::EXIT_FEE_BPS,
            protocol_fee_bps: fees::PROTOCOL_FEE_BPS,
            fee_denominator: fees::BPS_DENOMINATOR,
        }
    }
}

impl FeeConfig {
    /// Entry fee on a deposit amount
    pub fn entry_fee(&self, amount: Amount) -> EngineResult<Amount> {
        apply_bps(amount, self.entry_fee_bps, self.fee_denominator)
    }

    /// Protocol's share of an entry fee
    pub fn protocol_share(&self, entry_fee: Amount) -> EngineResult<Amount> {
        apply_bps(entry_fee, self.protocol_fee_bps, self.fee_denominator)
    }

    /// Exit fee on gross redeem proceeds
    pub fn exit_fee(&self, gross_assets: Amount) -> EngineResult<Amount> {
        apply_bps(gross_assets, self.exit_fee_bps, self.fee_denominator)
    }
}

/// Protocol parameters consumed by every component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Fee schedule
    pub fees: FeeConfig,
    /// Minimum assets per deposit
    pub min_deposit: Amount,
    /// Value attached per created atom
    pub atom_creation_cost: Amount,
    /// Value attached per created triple, on top of its deposit
    pub triple_creation_cost: Amount,
    /// Share balances at or below this count as no position
    pub dust_threshold_shares: Shares,
    /// Curve a creating call deposits into
    pub genesis_curve: Curve,
    /// Curve used when a request does not choose one
    pub default_curve: Curve,
    /// Slippage tolerance used to build floors
    pub default_slippage_bps: u64,
    /// Maximum pending items per cart
    pub max_cart_items: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            fees: FeeConfig::default(),
            min_deposit: limits::MIN_DEPOSIT,
            atom_creation_cost: limits::ATOM_CREATION_COST,
            triple_creation_cost: limits::TRIPLE_CREATION_COST,
            dust_threshold_shares: dust::DUST_THRESHOLD_SHARES,
            genesis_curve: Curve::Stable,
            default_curve: Curve::Stable,
            default_slippage_bps: cart::DEFAULT_SLIPPAGE_BPS,
            max_cart_items: cart::MAX_CART_ITEMS,
        }
    }
}

impl ProtocolConfig {
    /// Parse a configuration from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: ProtocolConfig = serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no deployment could use
    pub fn validate(&self) -> EngineResult<()> {
        let denom = self.fees.fee_denominator;
        if denom == 0 {
            return Err(invalid("fee_denominator must be positive"));
        }
        if self.fees.entry_fee_bps > denom || self.fees.exit_fee_bps > denom {
            return Err(invalid("fees cannot exceed 100%"));
        }
        if self.fees.protocol_fee_bps > denom {
            return Err(invalid("protocol share cannot exceed the entry fee"));
        }
        if self.default_slippage_bps > denom {
            return Err(invalid("slippage cannot exceed 100%"));
        }
        if self.max_cart_items == 0 {
            return Err(invalid("max_cart_items must be positive"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> EngineError {
    EngineError::InvalidConfig {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProtocolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.genesis_curve, Curve::Stable);
        assert_eq!(config.fees.fee_denominator, 10_000);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ProtocolConfig::from_json(
            r#"{ "fees": { "entry_fee_bps": 100 }, "default_curve": "conviction" }"#,
        )
        .unwrap();

        assert_eq!(config.fees.entry_fee_bps, 100);
        assert_eq!(config.fees.exit_fee_bps, fees::EXIT_FEE_BPS);
        assert_eq!(config.default_curve, Curve::Conviction);
        assert_eq!(config.min_deposit, limits::MIN_DEPOSIT);
    }

    #[test]
    fn test_invalid_json_rejected() {
        let err = ProtocolConfig::from_json(r#"{ "fees": { "fee_denominator": 0 } }"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");

        let err = ProtocolConfig::from_json("not json").unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_fee_helpers() {
        let fees = FeeConfig::default();
        let entry = fees.entry_fee(10_000).unwrap();
        assert_eq!(entry, 50);
        assert_eq!(fees.protocol_share(entry).unwrap(), 5);
        assert_eq!(fees.exit_fee(10_000).unwrap(), 75);
    }
}

//! Protocol Constants
//!
//! Default values for fees, limits and well-known labels used across the
//! staking engine. Every value here can be overridden at runtime through
//! [`crate::config::ProtocolConfig`].
//!
//! # Network Configuration
//!
//! Use feature flags to compile for different networks:
//! - `mainnet` - Production values (higher minimum deposit)
//! - Default (no feature) - Testnet values (lower minimums for testing)
//!
//! ```toml
//! # For mainnet deployment:
//! totem-common = { path = "...", features = ["mainnet"] }
//! ```

/// Token Metadata
pub mod token {
    /// One unit with decimals (1 token = 10^18 base units)
    pub const ONE: u128 = 1_000_000_000_000_000_000;
}

/// Fee Configuration (in basis points, 100 = 1%)
pub mod fees {
    /// Entry fee charged on deposits (0.5%)
    pub const ENTRY_FEE_BPS: u64 = 50;

    /// Exit fee charged on redeems (0.75%)
    pub const EXIT_FEE_BPS: u64 = 75;

    /// Share of the entry fee routed to the protocol (10% of the entry fee)
    pub const PROTOCOL_FEE_BPS: u64 = 1_000;

    /// Basis points denominator
    pub const BPS_DENOMINATOR: u64 = 10_000;
}

/// Deposit Limits
///
/// Values differ between mainnet and testnet to allow easier testing.
pub mod limits {
    use super::token::ONE;

    /// Minimum asset amount for a single deposit
    /// - Mainnet: 0.001 token
    /// - Testnet: 0.0001 token
    #[cfg(feature = "mainnet")]
    pub const MIN_DEPOSIT: u128 = ONE / 1_000;
    #[cfg(not(feature = "mainnet"))]
    pub const MIN_DEPOSIT: u128 = ONE / 10_000;

    /// Value attached per atom created
    pub const ATOM_CREATION_COST: u128 = ONE / 1_000;

    /// Value attached per triple created, on top of the genesis deposit
    pub const TRIPLE_CREATION_COST: u128 = ONE / 1_000;
}

/// Curve Configuration
pub mod curves {
    /// On-chain id of the linear ("Stable") curve
    pub const STABLE_CURVE_ID: u32 = 1;

    /// On-chain id of the progressive ("Conviction") curve
    pub const CONVICTION_CURVE_ID: u32 = 2;
}

/// Dust Configuration
pub mod dust {
    /// Share balances at or below this are treated as no position
    pub const DUST_THRESHOLD_SHARES: u128 = 1_000;
}

/// Cart Configuration
pub mod cart {
    /// Maximum number of pending items in one cart
    pub const MAX_CART_ITEMS: usize = 50;

    /// Default slippage tolerance applied when building floors (1%)
    pub const DEFAULT_SLIPPAGE_BPS: u64 = 100;
}

/// Well-known predicate labels
pub mod predicates {
    /// Subject has the object as a totem
    pub const HAS_TOTEM: &str = "has totem";

    /// Subject embodies the object
    pub const EMBODIES: &str = "embodies";
}

/// Labels used by auxiliary category tagging
pub mod tagging {
    /// Links an object to its category
    pub const HAS_CATEGORY: &str = "has category";

    /// Links a category to the system tag
    pub const TAGGED_WITH: &str = "tagged with";

    /// System tag applied to every category
    pub const SYSTEM_TAG: &str = "totem category";
}

/// Precision constants
pub mod precision {
    /// Percentage precision (100 = 100%)
    pub const PERCENT_PRECISION: u128 = 100;
}

//! Preview/Quote Service
//!
//! Estimates what a deposit or redeem would yield, from the configured fee
//! schedule plus the contract's simulation reads. Nothing here mutates
//! state.
//!
//! Quotes are best-effort. Vault totals move between a quote and its
//! execution; the only protection is the min-shares / min-assets floor
//! attached to the call, which defaults to zero (accept any result).
//!
//! ```text
//! deposit:  amount ─► entry fee ─► net ─► chain.preview_deposit ─► shares
//! redeem:   shares ─► chain.preview_redeem ─► gross ─► exit fee ─► net
//! ```

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use totem_common::{
    config::ProtocolConfig,
    errors::{EngineError, EngineResult},
    ledger::ChainReader,
    math::{recovery_from_gross, slippage_floor},
    types::{Amount, Shares, VaultRef, VoteCartItem},
    validation::require_positive,
};

// ============ Quotes ============

/// Estimated result of a deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositQuote {
    pub vault: VaultRef,
    /// Assets the user sends
    pub amount: Amount,
    /// Shares expected to be minted
    pub shares: Shares,
    /// Entry fee deducted from `amount`
    pub entry_fee: Amount,
    /// Part of the entry fee routed to the protocol
    pub protocol_fee_share: Amount,
    /// Assets that reach the vault
    pub net_amount: Amount,
}

/// Estimated result of a redeem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemQuote {
    pub vault: VaultRef,
    /// Shares burned
    pub shares: Shares,
    /// Pro-rata assets before the exit fee
    pub gross_assets: Amount,
    /// Exit fee
    pub exit_fee: Amount,
    /// Assets the user receives
    pub net_assets: Amount,
}

/// One entry of a batched quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteRequest {
    Deposit { vault: VaultRef, amount: Amount },
    Redeem { vault: VaultRef, shares: Shares },
}

/// Quote for a [`QuoteRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quote {
    Deposit(DepositQuote),
    Redeem(RedeemQuote),
}

// ============ Floors ============

/// Lowest share count to accept for a quoted deposit
pub fn min_shares_floor(quoted_shares: Shares, slippage_bps: u64, fee_denominator: u64) -> EngineResult<Shares> {
    slippage_floor(quoted_shares, slippage_bps, fee_denominator)
}

/// Lowest net assets to accept for a quoted redeem
pub fn min_assets_floor(quoted_assets: Amount, slippage_bps: u64, fee_denominator: u64) -> EngineResult<Amount> {
    slippage_floor(quoted_assets, slippage_bps, fee_denominator)
}

// ============ Service ============

/// Read-only quoting against the chain
#[derive(Clone)]
pub struct QuoteService {
    config: ProtocolConfig,
    chain: Arc<dyn ChainReader>,
}

impl QuoteService {
    pub fn new(config: ProtocolConfig, chain: Arc<dyn ChainReader>) -> Self {
        Self { config, chain }
    }

    /// Quote depositing `amount` into `vault`
    pub async fn preview_deposit(&self, vault: &VaultRef, amount: Amount) -> EngineResult<DepositQuote> {
        require_positive(amount, "amount")?;
        let fees = &self.config.fees;

        let entry_fee = fees.entry_fee(amount)?;
        let protocol_fee_share = fees.protocol_share(entry_fee)?;
        let net_amount = amount.checked_sub(entry_fee).ok_or(EngineError::Overflow)?;
        let shares = self.chain.preview_deposit(vault, net_amount).await?;

        debug!(vault = %vault.term_id, curve = %vault.curve, amount, shares, "Deposit quoted");
        Ok(DepositQuote {
            vault: *vault,
            amount,
            shares,
            entry_fee,
            protocol_fee_share,
            net_amount,
        })
    }

    /// Quote redeeming `shares` from `vault`
    pub async fn preview_redeem(&self, vault: &VaultRef, shares: Shares) -> EngineResult<RedeemQuote> {
        require_positive(shares, "shares")?;
        let fees = &self.config.fees;

        let gross = self.chain.preview_redeem(vault, shares).await?;
        let estimate = recovery_from_gross(gross, fees.exit_fee_bps, fees.fee_denominator)?;

        debug!(vault = %vault.term_id, curve = %vault.curve, shares, net = estimate.net_assets, "Redeem quoted");
        Ok(RedeemQuote {
            vault: *vault,
            shares,
            gross_assets: estimate.gross_assets,
            exit_fee: estimate.exit_fee,
            net_assets: estimate.net_assets,
        })
    }

    /// Quote several requests concurrently; results keep request order
    pub async fn preview_many(&self, requests: &[QuoteRequest]) -> Vec<EngineResult<Quote>> {
        join_all(requests.iter().map(|request| async move {
            match request {
                QuoteRequest::Deposit { vault, amount } => self.preview_deposit(vault, *amount).await.map(Quote::Deposit),
                QuoteRequest::Redeem { vault, shares } => self.preview_redeem(vault, *shares).await.map(Quote::Redeem),
            }
        }))
        .await
    }

    /// Attach slippage floors to a cart item from fresh quotes
    ///
    /// The deposit gets a min-shares floor and every redeem a min-assets
    /// floor, each `slippage_bps` below its quote.
    pub async fn with_floors(&self, mut item: VoteCartItem, slippage_bps: u64) -> EngineResult<VoteCartItem> {
        let denominator = self.config.fees.fee_denominator;

        let deposit = self.preview_deposit(&item.deposit_vault(), item.amount).await?;
        item.min_shares = min_shares_floor(deposit.shares, slippage_bps, denominator)?;

        for redeem in item.redeems.iter_mut() {
            let quote = self.preview_redeem(&redeem.vault(), redeem.shares).await?;
            redeem.min_assets = min_assets_floor(quote.net_assets, slippage_bps, denominator)?;
        }
        Ok(item)
    }

    /// Floors at the configured default tolerance
    pub async fn with_default_floors(&self, item: VoteCartItem) -> EngineResult<VoteCartItem> {
        self.with_floors(item, self.config.default_slippage_bps).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use totem_common::constants::token::ONE;
    use totem_common::testkit::{InMemoryLedger, DEFAULT_ACCOUNT};
    use totem_common::types::{ClaimTarget, Curve, Direction};

    fn setup() -> (InMemoryLedger, QuoteService) {
        let config = ProtocolConfig::default();
        let ledger = InMemoryLedger::new(config.clone());
        let service = QuoteService::new(config, Arc::new(ledger.clone()));
        (ledger, service)
    }

    #[tokio::test]
    async fn test_preview_deposit_fees() {
        let (ledger, service) = setup();
        let triple = ledger.seed_claim("me", "has totem", "wolf");
        let vault = VaultRef::new(triple.id, Curve::Stable);

        let quote = service.preview_deposit(&vault, 10_000).await.unwrap();

        assert_eq!(quote.entry_fee, 50);
        assert_eq!(quote.protocol_fee_share, 5);
        assert_eq!(quote.net_amount, 9_950);
        // Empty stable vault mints 1:1
        assert_eq!(quote.shares, 9_950);
    }

    #[tokio::test]
    async fn test_preview_redeem_fees() {
        let (ledger, service) = setup();
        let triple = ledger.seed_claim("me", "has totem", "wolf");
        ledger.seed_position(DEFAULT_ACCOUNT, &triple, Direction::Support, Curve::Stable, 20_000);
        let vault = VaultRef::new(triple.id, Curve::Stable);

        let quote = service.preview_redeem(&vault, 10_000).await.unwrap();

        assert_eq!(quote.gross_assets, 10_000);
        assert_eq!(quote.exit_fee, 75);
        assert_eq!(quote.net_assets, 9_925);
    }

    #[tokio::test]
    async fn test_preview_does_not_mutate() {
        let (ledger, service) = setup();
        let triple = ledger.seed_claim("me", "has totem", "wolf");
        let vault = VaultRef::new(triple.id, Curve::Conviction);

        let first = service.preview_deposit(&vault, ONE).await.unwrap();
        let second = service.preview_deposit(&vault, ONE).await.unwrap();

        assert_eq!(first, second);
        assert!(ledger.vault(&vault).is_empty());
        assert!(ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let (ledger, service) = setup();
        let triple = ledger.seed_claim("me", "has totem", "wolf");
        let vault = VaultRef::new(triple.id, Curve::Stable);

        assert_eq!(service.preview_deposit(&vault, 0).await.unwrap_err().code(), "INVALID_INPUT");
        assert_eq!(service.preview_redeem(&vault, 0).await.unwrap_err().code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_preview_many_keeps_order() {
        let (ledger, service) = setup();
        let triple = ledger.seed_claim("me", "has totem", "wolf");
        ledger.seed_position(DEFAULT_ACCOUNT, &triple, Direction::Support, Curve::Stable, ONE);
        let stable = VaultRef::new(triple.id, Curve::Stable);
        let oppose = VaultRef::new(triple.id.counter(), Curve::Conviction);

        let quotes = service
            .preview_many(&[
                QuoteRequest::Redeem { vault: stable, shares: ONE / 2 },
                QuoteRequest::Deposit { vault: oppose, amount: ONE },
                QuoteRequest::Deposit { vault: oppose, amount: 0 },
            ])
            .await;

        assert_eq!(quotes.len(), 3);
        assert!(matches!(quotes[0], Ok(Quote::Redeem(_))));
        assert!(matches!(quotes[1], Ok(Quote::Deposit(_))));
        assert!(quotes[2].is_err());
    }

    #[tokio::test]
    async fn test_with_floors() {
        let (ledger, service) = setup();
        let triple = ledger.seed_claim("me", "has totem", "wolf");
        let item = VoteCartItem::deposit(ClaimTarget::Existing(triple), Curve::Stable, Direction::Support, 10_000);

        let floored = service.with_floors(item.clone(), 100).await.unwrap();
        // 9_950 shares quoted, 1% tolerance
        assert_eq!(floored.min_shares, 9_851);

        let untouched = service.with_floors(item, 0).await.unwrap();
        assert_eq!(untouched.min_shares, 9_950);
    }

    #[test]
    fn test_floor_helpers() {
        assert_eq!(min_shares_floor(1_000, 100, 10_000).unwrap(), 990);
        assert_eq!(min_assets_floor(1_000, 0, 10_000).unwrap(), 1_000);
        assert!(min_assets_floor(1_000, 10_001, 10_000).is_err());
    }

    #[tokio::test]
    async fn test_unvalidated_fee_above_amount_is_an_error() {
        let mut config = ProtocolConfig::default();
        config.fees.entry_fee_bps = 2 * config.fees.fee_denominator;
        let ledger = InMemoryLedger::new(config.clone());
        let service = QuoteService::new(config, Arc::new(ledger.clone()));
        let triple = ledger.seed_claim("me", "has totem", "wolf");

        let err = service
            .preview_deposit(&VaultRef::new(triple.id, Curve::Stable), ONE)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Overflow);
    }
}

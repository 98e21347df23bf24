//! Direct withdraw paths
//!
//! Withdrawals that do not go through a cart: one position with the
//! single-item redeem call, or a percentage of several positions with one
//! batched redeem. Both re-read the redeemable maximum from the chain
//! first, like the cart's withdraw phase.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use totem_common::{
    errors::{EngineError, EngineResult},
    events::{EngineEvent, Phase},
    ledger::ContractCall,
    math::checked_sum,
    types::{Address, Amount, RedeemTarget, Shares, TxHash},
    validation::{clamp_redeem, require_connected},
};
use totem_positions::{plan_proportional_redeem, HeldPosition, VaultSnapshot};

use crate::orchestrator::{SettlementOrchestrator, SettlementProgress};

/// Result of a direct withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawOutcome {
    /// Redeem transaction
    pub tx: TxHash,
    /// Redeems actually submitted, after clamping
    pub redeemed: Vec<RedeemTarget>,
    /// Shares requested before clamping
    pub requested_shares: Shares,
    /// Shares burned
    pub redeemed_shares: Shares,
    /// Assets returned to the wallet
    pub net_assets: Amount,
}

impl SettlementOrchestrator {
    /// Redeem one position with the single-item redeem call
    pub async fn withdraw_position(&self, target: &RedeemTarget) -> EngineResult<WithdrawOutcome> {
        let account = require_connected(self.session().address())?;
        let requested_shares = target.shares;
        let mut clamped = self.clamp_to_redeemable(&account, vec![target.clone()]).await?;
        let target = clamped.remove(0);

        let call = ContractCall::Redeem {
            receiver: account,
            term_id: target.wing_id,
            curve_id: target.curve.id(),
            shares: target.shares,
            min_assets: target.min_assets,
        };
        self.submit_withdraw(call, vec![target], requested_shares).await
    }

    /// Redeem `percent` of each selected position in one batched call
    ///
    /// Positions whose share of the withdrawal rounds to zero are left out;
    /// if nothing remains the request is rejected.
    pub async fn withdraw_proportional(
        &self,
        selected: &[HeldPosition],
        percent: u8,
        vaults: &VaultSnapshot,
    ) -> EngineResult<WithdrawOutcome> {
        let account = require_connected(self.session().address())?;
        let plan = plan_proportional_redeem(selected, percent, vaults, self.config())?;
        if plan.is_empty() {
            return Err(EngineError::InvalidInput {
                param: "percent",
                reason: "Nothing to withdraw at this percentage",
            });
        }

        let requested_shares = checked_sum(plan.iter().map(|target| target.shares))?;
        let targets = self.clamp_to_redeemable(&account, plan).await?;
        let call = redeem_batch(account, &targets);
        self.submit_withdraw(call, targets, requested_shares).await
    }

    /// Lower each redeem to what the chain will honor right now
    ///
    /// Maxima are read concurrently. A request above a positive maximum is
    /// downgraded and recorded; a zero maximum fails the whole set.
    pub(crate) async fn clamp_to_redeemable(
        &self,
        account: &Address,
        targets: Vec<RedeemTarget>,
    ) -> EngineResult<Vec<RedeemTarget>> {
        let maxima = join_all(
            targets
                .iter()
                .map(|target| async move { self.chain().max_redeem(account, &target.vault()).await }),
        )
        .await;

        let mut clamped = Vec::with_capacity(targets.len());
        for (mut target, available) in targets.into_iter().zip(maxima) {
            let available = available?;
            let vault = target.vault();
            let shares = clamp_redeem(vault, target.shares, available)?;
            if shares < target.shares {
                warn!(
                    vault = %vault.term_id,
                    curve = %vault.curve,
                    requested = target.shares,
                    available,
                    "Redeem downgraded to redeemable maximum"
                );
                self.emit(EngineEvent::RedeemDowngraded {
                    term_id: vault.term_id,
                    curve: vault.curve,
                    requested: target.shares,
                    available,
                });
                target.shares = shares;
            }
            clamped.push(target);
        }
        Ok(clamped)
    }

    async fn submit_withdraw(
        &self,
        call: ContractCall,
        redeemed: Vec<RedeemTarget>,
        requested_shares: Shares,
    ) -> EngineResult<WithdrawOutcome> {
        let items = redeemed.len() as u32;
        self.emit(EngineEvent::PhaseStarted { phase: Phase::Withdraw, items });
        self.publish(SettlementProgress::Submitted { phase: Phase::Withdraw, items });

        let receipt = match self.session().execute(call, self.options().confirmation_timeout).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.emit(EngineEvent::PhaseFailed { phase: Phase::Withdraw, code: e.code().to_string() });
                return Err(e);
            }
        };

        self.emit(EngineEvent::PhaseCommitted { phase: Phase::Withdraw, items, tx: receipt.tx });
        self.publish(SettlementProgress::Confirmed { phase: Phase::Withdraw, tx: receipt.tx });

        let redeemed_shares = checked_sum(redeemed.iter().map(|target| target.shares))?;
        let net_assets = checked_sum(receipt.item_amounts.iter().copied())?;
        info!(tx = %receipt.tx, items, shares = redeemed_shares, net_assets, "Withdrawal confirmed");

        Ok(WithdrawOutcome {
            tx: receipt.tx,
            redeemed,
            requested_shares,
            redeemed_shares,
            net_assets,
        })
    }
}

/// Batched redeem call for a set of targets
pub(crate) fn redeem_batch(receiver: Address, targets: &[RedeemTarget]) -> ContractCall {
    ContractCall::RedeemBatch {
        receiver,
        term_ids: targets.iter().map(|t| t.wing_id).collect(),
        curve_ids: targets.iter().map(|t| t.curve.id()).collect(),
        shares: targets.iter().map(|t| t.shares).collect(),
        min_assets: targets.iter().map(|t| t.min_assets).collect(),
    }
}

//! Proportional redeem planning
//!
//! Withdrawing P% of a selection of positions redeems
//! `floor(shares * P / 100)` from each. Positions whose request rounds to
//! zero are skipped.

use totem_common::{
    config::ProtocolConfig,
    errors::EngineResult,
    math::proportional_shares,
    types::RedeemTarget,
};

use crate::aggregate::HeldPosition;
use crate::transitions::{redeem_target, VaultSnapshot};

/// Plan redeeming `percent` of each selected position
pub fn plan_proportional_redeem(
    selected: &[HeldPosition],
    percent: u8,
    vaults: &VaultSnapshot,
    config: &ProtocolConfig,
) -> EngineResult<Vec<RedeemTarget>> {
    let mut plan = Vec::with_capacity(selected.len());
    for held in selected {
        let shares = proportional_shares(held.entry.shares, percent)?;
        if shares == 0 {
            continue;
        }
        plan.push(redeem_target(held, shares, vaults, config)?);
    }
    Ok(plan)
}

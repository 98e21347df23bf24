//! Transition Constraint Engine
//!
//! One pure decision function over a position snapshot and a requested
//! (claim, direction, curve). Checks run in a fixed order and the first
//! that applies wins:
//!
//! 1. Oppose on a claim that does not exist yet: `BlockedGenesisOppose`
//! 2. Any live position on the same totem under another predicate:
//!    `BlockedCrossPredicate`
//! 3. The opposite wing held on the requested curve: `NeedsRedeemSameCurve`,
//!    or `NeedsChooseCurveToRedeem` when no curve was chosen and both
//!    curves hold it
//! 4. Otherwise `Allowed`
//!
//! Balances at or below the dust threshold count as no position.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use totem_common::{
    config::ProtocolConfig,
    errors::{EngineError, EngineResult},
    math::{estimate_recovery, recovery_from_gross},
    types::{
        Amount, ClaimTarget, Curve, Direction, RecoveryEstimate, RedeemTarget, Shares, TermId, VaultRef,
        VaultState, VoteCartItem,
    },
};

use crate::aggregate::{on_object, HeldPosition, Positions};

/// Vault totals known at decision time
pub type VaultSnapshot = BTreeMap<VaultRef, VaultState>;

/// A requested stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRequest {
    /// Claim to stake on
    pub claim: ClaimTarget,
    /// Wing to stake into
    pub direction: Direction,
    /// Curve, `None` if the caller has not chosen yet
    pub curve: Option<Curve>,
}

impl TransitionRequest {
    /// Request with a chosen curve
    pub fn new(claim: ClaimTarget, direction: Direction, curve: Curve) -> Self {
        Self { claim, direction, curve: Some(curve) }
    }

    /// Request leaving the curve to the engine
    pub fn any_curve(claim: ClaimTarget, direction: Direction) -> Self {
        Self { claim, direction, curve: None }
    }
}

/// Outcome of evaluating a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionDecision {
    /// Deposit straight away on `curve`
    Allowed { curve: Curve },

    /// The opposite wing on `curve` must be fully redeemed first
    NeedsRedeemSameCurve { curve: Curve, redeem: RedeemTarget },

    /// The opposite wing is held on both curves; the caller must pick one
    NeedsChooseCurveToRedeem { options: Vec<RedeemTarget> },

    /// Positions under other predicates on this totem must be redeemed first
    BlockedCrossPredicate {
        predicates: Vec<TermId>,
        redeem: Vec<RedeemTarget>,
        total: RecoveryEstimate,
    },

    /// A new claim cannot start with an Oppose stake
    BlockedGenesisOppose,
}

impl TransitionDecision {
    /// Returns true if the request can go into a cart as is
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::Allowed { .. } | Self::NeedsRedeemSameCurve { .. })
    }

    /// Returns true if the request is blocked outright
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::BlockedCrossPredicate { .. } | Self::BlockedGenesisOppose)
    }

    /// Estimated proceeds of the redeems this decision requires
    pub fn recoverable(&self) -> RecoveryEstimate {
        match self {
            Self::NeedsRedeemSameCurve { redeem, .. } => redeem.estimate,
            Self::BlockedCrossPredicate { total, .. } => *total,
            _ => RecoveryEstimate::default(),
        }
    }

    /// Resolve a curve choice; other decisions are returned unchanged
    pub fn choose_curve(self, curve: Curve) -> Self {
        match self {
            Self::NeedsChooseCurveToRedeem { options } => {
                match options.into_iter().find(|option| option.curve == curve) {
                    Some(redeem) => Self::NeedsRedeemSameCurve { curve, redeem },
                    None => Self::Allowed { curve },
                }
            }
            other => other,
        }
    }

    /// Turn an actionable decision into a cart item
    ///
    /// # Errors
    /// * `TRANSITION_BLOCKED` for blocked decisions
    /// * `INVALID_INPUT` while a curve choice is still pending
    pub fn into_cart_item(self, request: &TransitionRequest, amount: Amount) -> EngineResult<VoteCartItem> {
        match self {
            Self::Allowed { curve } => Ok(VoteCartItem::deposit(request.claim.clone(), curve, request.direction, amount)),
            Self::NeedsRedeemSameCurve { curve, redeem } => {
                let mut item = VoteCartItem::deposit(request.claim.clone(), curve, request.direction, amount);
                item.redeems.push(redeem);
                Ok(item)
            }
            Self::NeedsChooseCurveToRedeem { .. } => Err(EngineError::InvalidInput {
                param: "curve",
                reason: "Choose which curve to redeem before staking",
            }),
            Self::BlockedCrossPredicate { .. } => Err(EngineError::TransitionBlocked {
                reason: "positions under another predicate on this totem must be redeemed first",
            }),
            Self::BlockedGenesisOppose => Err(EngineError::TransitionBlocked {
                reason: "a new claim can only be created with a support deposit",
            }),
        }
    }
}

/// Decide whether a requested stake is allowed
///
/// # Arguments
/// * `request` - Requested claim, direction and curve
/// * `positions` - The user's aggregated positions
/// * `vaults` - Vault totals for recovery estimates; positions in vaults
///   missing here are estimated from their tracked assets
/// * `config` - Fees, dust threshold and default curve
pub fn evaluate(
    request: &TransitionRequest,
    positions: &Positions,
    vaults: &VaultSnapshot,
    config: &ProtocolConfig,
) -> EngineResult<TransitionDecision> {
    let dust = config.dust_threshold_shares;
    let triple = request.claim.derived_triple();

    // 1. Genesis direction
    if request.claim.is_new() && request.direction == Direction::Oppose {
        return Ok(TransitionDecision::BlockedGenesisOppose);
    }

    // 2. Predicate exclusivity on the totem
    let conflicting: Vec<HeldPosition> = on_object(positions, &triple.object)
        .filter(|bundle| bundle.triple.predicate != triple.predicate)
        .flat_map(|bundle| bundle.held(dust))
        .collect();
    if !conflicting.is_empty() {
        let mut predicates: Vec<TermId> = conflicting.iter().map(|held| held.triple.predicate).collect();
        predicates.sort();
        predicates.dedup();

        let redeem = conflicting
            .iter()
            .map(|held| full_redeem(held, vaults, config))
            .collect::<EngineResult<Vec<_>>>()?;
        let total = redeem
            .iter()
            .fold(RecoveryEstimate::default(), |acc, target| acc.combine(&target.estimate));

        return Ok(TransitionDecision::BlockedCrossPredicate { predicates, redeem, total });
    }

    // 3. Opposite wing on the same curve
    let opposite = request.direction.opposite();
    let held_opposite: Vec<HeldPosition> = positions
        .get(&triple.id)
        .map(|bundle| {
            bundle
                .held(dust)
                .into_iter()
                .filter(|held| held.direction == opposite)
                .collect()
        })
        .unwrap_or_default();

    let curve = match request.curve {
        Some(curve) => curve,
        None if held_opposite.len() == Curve::ALL.len() => {
            let options = held_opposite
                .iter()
                .map(|held| full_redeem(held, vaults, config))
                .collect::<EngineResult<Vec<_>>>()?;
            return Ok(TransitionDecision::NeedsChooseCurveToRedeem { options });
        }
        None => config.default_curve,
    };

    if let Some(held) = held_opposite.iter().find(|held| held.curve == curve) {
        let redeem = full_redeem(held, vaults, config)?;
        return Ok(TransitionDecision::NeedsRedeemSameCurve { curve, redeem });
    }

    // 4. No conflict
    Ok(TransitionDecision::Allowed { curve })
}

/// Redeem target for the whole of a held position
pub fn full_redeem(held: &HeldPosition, vaults: &VaultSnapshot, config: &ProtocolConfig) -> EngineResult<RedeemTarget> {
    redeem_target(held, held.entry.shares, vaults, config)
}

/// Redeem target for part of a held position
pub fn redeem_target(
    held: &HeldPosition,
    shares: Shares,
    vaults: &VaultSnapshot,
    config: &ProtocolConfig,
) -> EngineResult<RedeemTarget> {
    let fees = &config.fees;
    let estimate = match vaults.get(&held.vault()) {
        Some(vault) if !vault.is_empty() => {
            estimate_recovery(shares, vault, fees.exit_fee_bps, fees.fee_denominator)?
        }
        _ => {
            // Share of the assets the user put in
            let gross = held
                .entry
                .assets
                .checked_mul(shares)
                .ok_or(EngineError::Overflow)?
                .checked_div(held.entry.shares)
                .unwrap_or(0);
            recovery_from_gross(gross, fees.exit_fee_bps, fees.fee_denominator)?
        }
    };

    Ok(RedeemTarget {
        triple: held.triple,
        wing_id: held.wing_id(),
        curve: held.curve,
        direction: held.direction,
        shares,
        estimate,
        min_assets: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use totem_common::constants::{predicates::{EMBODIES, HAS_TOTEM}, token::ONE};
    use totem_common::types::{NewClaim, StakeEvent, StakeKind, TermRef, Triple};

    fn config() -> ProtocolConfig {
        ProtocolConfig::default()
    }

    fn claim(predicate: &str) -> Triple {
        Triple::new(TermId::atom("me"), TermId::atom(predicate), TermId::atom("wolf"))
    }

    fn deposit(triple: Triple, curve: Curve, direction: Direction, shares: u128) -> StakeEvent {
        StakeEvent {
            triple,
            wing_id: triple.wing(direction),
            curve,
            direction,
            kind: StakeKind::Deposit,
            shares,
            assets: shares,
            block_height: 1,
        }
    }

    #[test]
    fn test_allowed_without_positions() {
        let k = claim(HAS_TOTEM);
        let request = TransitionRequest::new(ClaimTarget::Existing(k), Direction::Oppose, Curve::Conviction);
        let decision = evaluate(&request, &Positions::new(), &VaultSnapshot::new(), &config()).unwrap();
        assert_eq!(decision, TransitionDecision::Allowed { curve: Curve::Conviction });
    }

    #[test]
    fn test_same_direction_is_allowed() {
        let k = claim(HAS_TOTEM);
        let positions = aggregate(&[deposit(k, Curve::Stable, Direction::Support, ONE)]);
        let request = TransitionRequest::new(ClaimTarget::Existing(k), Direction::Support, Curve::Stable);
        let decision = evaluate(&request, &positions, &VaultSnapshot::new(), &config()).unwrap();
        assert!(matches!(decision, TransitionDecision::Allowed { curve: Curve::Stable }));
    }

    #[test]
    fn test_opposite_on_same_curve_needs_redeem() {
        let k = claim(HAS_TOTEM);
        let positions = aggregate(&[deposit(k, Curve::Stable, Direction::Support, ONE)]);
        let mut vaults = VaultSnapshot::new();
        vaults.insert(
            VaultRef::new(k.id, Curve::Stable),
            VaultState { total_shares: 2 * ONE, total_assets: 4 * ONE },
        );

        let request = TransitionRequest::new(ClaimTarget::Existing(k), Direction::Oppose, Curve::Stable);
        let decision = evaluate(&request, &positions, &vaults, &config()).unwrap();

        match &decision {
            TransitionDecision::NeedsRedeemSameCurve { curve, redeem } => {
                assert_eq!(*curve, Curve::Stable);
                assert_eq!(redeem.shares, ONE);
                assert_eq!(redeem.wing_id, k.id);
                assert_eq!(redeem.estimate.gross_assets, 2 * ONE);
                assert!(redeem.estimate.net_assets > 0);
                assert!(redeem.estimate.net_assets < redeem.estimate.gross_assets);
            }
            other => panic!("unexpected decision {:?}", other),
        }

        let item = decision.into_cart_item(&request, ONE).unwrap();
        assert!(item.requires_redeem());
        assert_eq!(item.direction, Direction::Oppose);
        assert_eq!(item.deposit_vault(), VaultRef::new(k.id.counter(), Curve::Stable));
    }

    #[test]
    fn test_opposite_on_other_curve_is_allowed() {
        let k = claim(HAS_TOTEM);
        let positions = aggregate(&[deposit(k, Curve::Stable, Direction::Support, ONE)]);
        let request = TransitionRequest::new(ClaimTarget::Existing(k), Direction::Oppose, Curve::Conviction);
        let decision = evaluate(&request, &positions, &VaultSnapshot::new(), &config()).unwrap();
        assert_eq!(decision, TransitionDecision::Allowed { curve: Curve::Conviction });
    }

    #[test]
    fn test_opposite_on_both_curves_needs_choice() {
        let k = claim(HAS_TOTEM);
        let positions = aggregate(&[
            deposit(k, Curve::Stable, Direction::Support, ONE),
            deposit(k, Curve::Conviction, Direction::Support, 3 * ONE),
        ]);
        let request = TransitionRequest::any_curve(ClaimTarget::Existing(k), Direction::Oppose);
        let decision = evaluate(&request, &positions, &VaultSnapshot::new(), &config()).unwrap();

        match &decision {
            TransitionDecision::NeedsChooseCurveToRedeem { options } => assert_eq!(options.len(), 2),
            other => panic!("unexpected decision {:?}", other),
        }
        assert!(decision.clone().into_cart_item(&request, ONE).is_err());

        match decision.choose_curve(Curve::Conviction) {
            TransitionDecision::NeedsRedeemSameCurve { curve, redeem } => {
                assert_eq!(curve, Curve::Conviction);
                assert_eq!(redeem.shares, 3 * ONE);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_no_curve_chosen_uses_default() {
        let k = claim(HAS_TOTEM);
        let request = TransitionRequest::any_curve(ClaimTarget::Existing(k), Direction::Support);
        let decision = evaluate(&request, &Positions::new(), &VaultSnapshot::new(), &config()).unwrap();
        assert_eq!(decision, TransitionDecision::Allowed { curve: config().default_curve });
    }

    #[test]
    fn test_cross_predicate_is_blocked() {
        let has_totem = claim(HAS_TOTEM);
        let embodies = claim(EMBODIES);
        let positions = aggregate(&[
            deposit(has_totem, Curve::Stable, Direction::Support, ONE),
            deposit(has_totem, Curve::Conviction, Direction::Oppose, 2 * ONE),
        ]);

        let request = TransitionRequest::new(ClaimTarget::Existing(embodies), Direction::Support, Curve::Stable);
        let decision = evaluate(&request, &positions, &VaultSnapshot::new(), &config()).unwrap();

        match &decision {
            TransitionDecision::BlockedCrossPredicate { predicates, redeem, total } => {
                assert_eq!(predicates, &vec![TermId::atom(HAS_TOTEM)]);
                assert_eq!(redeem.len(), 2);
                assert!(redeem.iter().all(|target| target.triple.id == has_totem.id));
                let shares: u128 = redeem.iter().map(|target| target.shares).sum();
                assert_eq!(shares, 3 * ONE);
                assert!(total.net_assets > 0);
            }
            other => panic!("unexpected decision {:?}", other),
        }
        assert!(decision.is_blocked());
        assert_eq!(decision.into_cart_item(&request, ONE).unwrap_err().code(), "TRANSITION_BLOCKED");
    }

    #[test]
    fn test_cross_predicate_takes_precedence() {
        let has_totem = claim(HAS_TOTEM);
        let embodies = claim(EMBODIES);
        let positions = aggregate(&[
            deposit(has_totem, Curve::Stable, Direction::Support, ONE),
            deposit(embodies, Curve::Stable, Direction::Support, ONE),
        ]);

        // Oppose on embodies/Stable would need a same-curve redeem, but the
        // has-totem position blocks first
        let request = TransitionRequest::new(ClaimTarget::Existing(embodies), Direction::Oppose, Curve::Stable);
        let decision = evaluate(&request, &positions, &VaultSnapshot::new(), &config()).unwrap();
        assert!(matches!(decision, TransitionDecision::BlockedCrossPredicate { .. }));
    }

    #[test]
    fn test_other_totem_does_not_block() {
        let wolf = claim(HAS_TOTEM);
        let bear = Triple::new(TermId::atom("me"), TermId::atom(EMBODIES), TermId::atom("bear"));
        let positions = aggregate(&[deposit(bear, Curve::Stable, Direction::Support, ONE)]);

        let request = TransitionRequest::new(ClaimTarget::Existing(wolf), Direction::Support, Curve::Stable);
        let decision = evaluate(&request, &positions, &VaultSnapshot::new(), &config()).unwrap();
        assert!(decision.is_actionable());
    }

    #[test]
    fn test_dust_is_ignored() {
        let has_totem = claim(HAS_TOTEM);
        let embodies = claim(EMBODIES);
        let dust = config().dust_threshold_shares;
        let positions = aggregate(&[
            deposit(has_totem, Curve::Stable, Direction::Support, dust),
            deposit(embodies, Curve::Stable, Direction::Support, dust),
        ]);

        let request = TransitionRequest::new(ClaimTarget::Existing(embodies), Direction::Oppose, Curve::Stable);
        let decision = evaluate(&request, &positions, &VaultSnapshot::new(), &config()).unwrap();
        assert_eq!(decision, TransitionDecision::Allowed { curve: Curve::Stable });
    }

    #[test]
    fn test_genesis_oppose_is_blocked() {
        let new_claim = NewClaim::new(TermRef::label("me"), TermRef::label(HAS_TOTEM), TermRef::label("lynx"));
        let request = TransitionRequest::new(ClaimTarget::New(new_claim.clone()), Direction::Oppose, Curve::Stable);
        let decision = evaluate(&request, &Positions::new(), &VaultSnapshot::new(), &config()).unwrap();
        assert_eq!(decision, TransitionDecision::BlockedGenesisOppose);

        let support = TransitionRequest::new(ClaimTarget::New(new_claim), Direction::Support, Curve::Stable);
        let decision = evaluate(&support, &Positions::new(), &VaultSnapshot::new(), &config()).unwrap();
        assert!(decision.is_actionable());
    }

    /// Following the engine's decisions never leaves both wings held on
    /// one curve
    #[test]
    fn test_decisions_never_cross_wings() {
        let claims = [claim(HAS_TOTEM), Triple::new(TermId::atom("you"), TermId::atom(HAS_TOTEM), TermId::atom("wolf"))];
        let config = config();
        let mut history: Vec<StakeEvent> = Vec::new();
        let mut seed: u64 = 0x5eed;

        for step in 0..400 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let triple = claims[(seed >> 33) as usize % claims.len()];
            let direction = if (seed >> 40) & 1 == 0 { Direction::Support } else { Direction::Oppose };
            let curve = match (seed >> 45) % 3 {
                0 => None,
                1 => Some(Curve::Stable),
                _ => Some(Curve::Conviction),
            };
            let shares = ONE + (seed >> 50) as u128;

            let positions = aggregate(&history);
            let request = TransitionRequest { claim: ClaimTarget::Existing(triple), direction, curve };
            let mut decision = evaluate(&request, &positions, &VaultSnapshot::new(), &config).unwrap();
            if let TransitionDecision::NeedsChooseCurveToRedeem { .. } = decision {
                decision = decision.choose_curve(Curve::ALL[step % 2]);
            }

            let (curve, redeem) = match decision {
                TransitionDecision::Allowed { curve } => (curve, None),
                TransitionDecision::NeedsRedeemSameCurve { curve, redeem } => (curve, Some(redeem)),
                _ => continue,
            };
            if let Some(redeem) = redeem {
                history.push(StakeEvent {
                    triple,
                    wing_id: redeem.wing_id,
                    curve: redeem.curve,
                    direction: redeem.direction,
                    kind: StakeKind::Redeem,
                    shares: redeem.shares,
                    assets: 0,
                    block_height: step as u64,
                });
            }
            history.push(deposit(triple, curve, direction, shares));

            for bundle in aggregate(&history).values() {
                assert!(!bundle.has_crossed_wings(config.dust_threshold_shares));
            }
        }
    }
}

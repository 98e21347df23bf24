//! Vote Cart
//!
//! Pending stake instructions waiting for settlement. Items for the same
//! (claim, curve, direction) are merged. After a partially committed run
//! the cart keeps only what is still outstanding, so settling it again
//! never re-submits committed work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use totem_common::{
    check,
    config::ProtocolConfig,
    errors::{EngineError, EngineResult},
    math::checked_sum,
    types::{Amount, ClaimTarget, RecoveryEstimate, RedeemTarget, Triple, VaultRef, VoteCartItem},
    validation::require_positive,
};

/// Pending stake instructions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCart {
    items: Vec<VoteCartItem>,
    max_items: usize,
}

impl VoteCart {
    /// Empty cart holding at most `max_items`
    pub fn new(max_items: usize) -> Self {
        Self { items: Vec::new(), max_items }
    }

    /// Empty cart sized from the configuration
    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(config.max_cart_items)
    }

    /// Add an item, merging it into an existing one for the same vault
    ///
    /// # Returns
    /// Index of the item that now holds the instruction
    pub fn add(&mut self, item: VoteCartItem) -> EngineResult<usize> {
        require_positive(item.amount, "amount")?;

        if let Some(index) = self.items.iter().position(|existing| same_slot(existing, &item)) {
            let existing = &mut self.items[index];
            existing.amount = existing.amount.checked_add(item.amount).ok_or(EngineError::Overflow)?;
            existing.min_shares = existing.min_shares.saturating_add(item.min_shares);
            for redeem in item.redeems {
                if !existing.redeems.iter().any(|r| r.vault() == redeem.vault()) {
                    existing.redeems.push(redeem);
                }
            }
            return Ok(index);
        }

        check!(
            self.items.len() < self.max_items,
            EngineError::CartFull { maximum: self.max_items }
        );
        self.items.push(item);
        Ok(self.items.len() - 1)
    }

    /// Remove an item
    pub fn remove(&mut self, index: usize) -> Option<VoteCartItem> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    pub fn items(&self) -> &[VoteCartItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Sum of deposit amounts
    pub fn total_deposit(&self) -> EngineResult<Amount> {
        checked_sum(self.items.iter().map(|item| item.amount))
    }

    /// Combined estimate of the redeems the cart will submit
    ///
    /// A position displaced by several items is counted once.
    pub fn total_recoverable(&self) -> RecoveryEstimate {
        merge_redeems(self.redeem_targets())
            .iter()
            .fold(RecoveryEstimate::default(), |acc, target| acc.combine(&target.estimate))
    }

    /// Returns true if any item must redeem before depositing
    pub fn requires_withdraw(&self) -> bool {
        self.items.iter().any(VoteCartItem::requires_redeem)
    }

    /// Every redeem in the cart, in item order
    pub fn redeem_targets(&self) -> impl Iterator<Item = &RedeemTarget> {
        self.items.iter().flat_map(|item| item.redeems.iter())
    }

    // ============ Settlement bookkeeping ============

    /// Forget redeems once the withdraw phase is committed
    pub(crate) fn clear_settled_redeems(&mut self) {
        for item in self.items.iter_mut() {
            item.redeems.clear();
        }
    }

    /// Point an item at the claim it resolved to
    pub(crate) fn settle_target(&mut self, index: usize, triple: Triple) {
        if let Some(item) = self.items.get_mut(index) {
            item.target = ClaimTarget::Existing(triple);
        }
    }

    /// Drop items whose deposit is already committed
    pub(crate) fn remove_settled(&mut self, indices: &[usize]) {
        let mut index = 0;
        self.items.retain(|_| {
            let keep = !indices.contains(&index);
            index += 1;
            keep
        });
    }
}

fn same_slot(a: &VoteCartItem, b: &VoteCartItem) -> bool {
    a.target == b.target && a.curve == b.curve && a.direction == b.direction
}

/// One redeem per vault, keeping the largest request
///
/// Two items displacing the same position each carry a full redeem of it;
/// it must only be redeemed once.
pub(crate) fn merge_redeems<'a>(targets: impl Iterator<Item = &'a RedeemTarget>) -> Vec<RedeemTarget> {
    let mut by_vault: BTreeMap<VaultRef, RedeemTarget> = BTreeMap::new();
    for target in targets {
        by_vault
            .entry(target.vault())
            .and_modify(|existing| {
                if target.shares > existing.shares {
                    *existing = target.clone();
                }
            })
            .or_insert_with(|| target.clone());
    }
    by_vault.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use totem_common::types::{Curve, Direction, NewClaim, TermId, TermRef};

    fn triple() -> Triple {
        Triple::new(TermId::atom("me"), TermId::atom("has totem"), TermId::atom("wolf"))
    }

    fn item(direction: Direction, amount: Amount) -> VoteCartItem {
        VoteCartItem::deposit(ClaimTarget::Existing(triple()), Curve::Stable, direction, amount)
    }

    fn redeem(shares: u128) -> RedeemTarget {
        let triple = triple();
        RedeemTarget {
            triple,
            wing_id: triple.id,
            curve: Curve::Stable,
            direction: Direction::Support,
            shares,
            estimate: RecoveryEstimate { gross_assets: shares, exit_fee: 0, net_assets: shares },
            min_assets: 0,
        }
    }

    #[test]
    fn test_add_merges_same_slot() {
        let mut cart = VoteCart::new(10);
        assert_eq!(cart.add(item(Direction::Support, 100)).unwrap(), 0);
        assert_eq!(cart.add(item(Direction::Support, 50)).unwrap(), 0);
        assert_eq!(cart.add(item(Direction::Oppose, 10)).unwrap(), 1);

        assert_eq!(cart.len(), 2);
        assert_eq!(cart.items()[0].amount, 150);
        assert_eq!(cart.total_deposit().unwrap(), 160);
    }

    #[test]
    fn test_merge_does_not_duplicate_redeems() {
        let mut cart = VoteCart::new(10);
        let mut first = item(Direction::Oppose, 100);
        first.redeems.push(redeem(40));
        let mut second = item(Direction::Oppose, 100);
        second.redeems.push(redeem(40));

        cart.add(first).unwrap();
        cart.add(second).unwrap();

        assert_eq!(cart.redeem_targets().count(), 1);
        assert_eq!(cart.total_recoverable().net_assets, 40);
        assert!(cart.requires_withdraw());
    }

    #[test]
    fn test_cart_full_and_zero_amount() {
        let mut cart = VoteCart::new(1);
        cart.add(item(Direction::Support, 1)).unwrap();

        let err = cart.add(item(Direction::Oppose, 1)).unwrap_err();
        assert_eq!(err, EngineError::CartFull { maximum: 1 });
        assert_eq!(cart.add(item(Direction::Support, 0)).unwrap_err().code(), "INVALID_INPUT");
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cart = VoteCart::new(10);
        cart.add(item(Direction::Support, 1)).unwrap();
        cart.add(item(Direction::Oppose, 2)).unwrap();

        assert!(cart.remove(5).is_none());
        assert_eq!(cart.remove(0).map(|i| i.amount), Some(1));
        assert_eq!(cart.len(), 1);

        cart.clear();
        assert!(cart.is_empty());
    }

    #[test]
    fn test_settlement_bookkeeping() {
        let mut cart = VoteCart::new(10);
        let new_claim = NewClaim::new(TermRef::label("me"), TermRef::label("has totem"), TermRef::label("lynx"));
        let mut displacing = item(Direction::Oppose, 5);
        displacing.redeems.push(redeem(10));
        cart.add(displacing).unwrap();
        cart.add(VoteCartItem::deposit(ClaimTarget::New(new_claim.clone()), Curve::Stable, Direction::Support, 5))
            .unwrap();
        cart.add(item(Direction::Support, 7)).unwrap();

        cart.clear_settled_redeems();
        assert!(!cart.requires_withdraw());

        cart.settle_target(1, new_claim.derived_triple());
        assert_eq!(cart.items()[1].target, ClaimTarget::Existing(new_claim.derived_triple()));

        cart.remove_settled(&[0, 2]);
        assert_eq!(cart.len(), 1);
        assert_eq!(cart.items()[0].amount, 5);
    }

    #[test]
    fn test_merge_redeems_keeps_one_per_vault() {
        let small = redeem(10);
        let full = redeem(40);

        let merged = merge_redeems([&small, &full].into_iter());

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].shares, 40);
    }

    #[test]
    fn test_shared_redeem_is_recovered_once() {
        let mut cart = VoteCart::new(10);
        let mut stable = item(Direction::Oppose, 100);
        stable.redeems.push(redeem(40));
        let mut conviction = VoteCartItem::deposit(ClaimTarget::Existing(triple()), Curve::Conviction, Direction::Oppose, 100);
        conviction.redeems.push(redeem(40));

        cart.add(stable).unwrap();
        cart.add(conviction).unwrap();

        assert_eq!(cart.len(), 2);
        assert_eq!(cart.redeem_targets().count(), 2);
        assert_eq!(cart.total_recoverable().net_assets, 40);
    }
}

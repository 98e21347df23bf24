//! Core Types for totem claim staking
//!
//! This module defines the fundamental data structures shared by the
//! resolver, the position engine, the quote service and the settlement
//! orchestrator.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::curves;

/// Type alias for account addresses
pub type Address = [u8; 20];

/// Fixed-point token amount in base units
pub type Amount = u128;

/// Vault share amount
pub type Shares = u128;

// ============ Identifiers ============

/// Identity handle of a term (atom, triple or counter triple)
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct TermId(pub [u8; 32]);

impl TermId {
    /// Label-derived id of an atom
    pub fn atom(label: &str) -> Self {
        Self::digest(&[b"atom", label.as_bytes()])
    }

    /// Id of the (subject, predicate, object) triple
    pub fn triple(subject: &TermId, predicate: &TermId, object: &TermId) -> Self {
        Self::digest(&[b"triple", &subject.0, &predicate.0, &object.0])
    }

    /// Id of the Oppose wing of the triple identified by `self`
    pub fn counter(&self) -> Self {
        Self::digest(&[b"counter", &self.0])
    }

    fn digest(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 0x-prefixed hex rendering
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TermId(0x{})", hex::encode(&self.0[..6]))
    }
}

/// Transaction reference returned by the wallet
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Default,
    Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct TxHash(pub [u8; 32]);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash(0x{})", hex::encode(&self.0[..6]))
    }
}

// ============ Curves and Directions ============

/// Bonding-curve variant. Pools on different curves are independent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    /// Linear pricing
    Stable,
    /// Progressive pricing
    Conviction,
}

impl Curve {
    /// Both curves, in id order
    pub const ALL: [Curve; 2] = [Curve::Stable, Curve::Conviction];

    /// On-chain curve id
    pub fn id(&self) -> u32 {
        match self {
            Curve::Stable => curves::STABLE_CURVE_ID,
            Curve::Conviction => curves::CONVICTION_CURVE_ID,
        }
    }

    /// Curve for an on-chain id
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            curves::STABLE_CURVE_ID => Some(Curve::Stable),
            curves::CONVICTION_CURVE_ID => Some(Curve::Conviction),
            _ => None,
        }
    }

    /// The other curve
    pub fn other(&self) -> Self {
        match self {
            Curve::Stable => Curve::Conviction,
            Curve::Conviction => Curve::Stable,
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Curve::Stable => f.write_str("stable"),
            Curve::Conviction => f.write_str("conviction"),
        }
    }
}

/// Polarity of a stake on a claim
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Stake for the claim
    Support,
    /// Stake against the claim
    Oppose,
}

impl Direction {
    /// The other wing
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Support => Direction::Oppose,
            Direction::Oppose => Direction::Support,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Support => f.write_str("support"),
            Direction::Oppose => f.write_str("oppose"),
        }
    }
}

/// Kind of a historical stake event
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub enum StakeKind {
    /// Assets went into the vault, shares were minted
    Deposit,
    /// Shares were burned, assets left the vault
    Redeem,
}

// ============ Terms ============

/// Reference to an atom that may not be resolved to an id yet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TermRef {
    /// Known only by label; resolving may require a creating call
    Pending(String),
    /// Already resolved to an existing term
    Resolved(TermId),
}

impl TermRef {
    /// Pending reference from a label
    pub fn label(label: impl Into<String>) -> Self {
        TermRef::Pending(label.into())
    }

    /// Resolved id, if any
    pub fn id(&self) -> Option<TermId> {
        match self {
            TermRef::Resolved(id) => Some(*id),
            TermRef::Pending(_) => None,
        }
    }

    /// Id this reference resolves to once it exists on the ledger
    pub fn derived_id(&self) -> TermId {
        match self {
            TermRef::Resolved(id) => *id,
            TermRef::Pending(label) => TermId::atom(label),
        }
    }

    /// Returns true if this reference still needs resolution
    pub fn is_pending(&self) -> bool {
        matches!(self, TermRef::Pending(_))
    }
}

impl From<TermId> for TermRef {
    fn from(id: TermId) -> Self {
        TermRef::Resolved(id)
    }
}

impl fmt::Display for TermRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermRef::Pending(label) => write!(f, "\"{}\"", label),
            TermRef::Resolved(id) => write!(f, "{}", id),
        }
    }
}

/// An identity term for a single entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Atom {
    /// Term id
    pub id: TermId,
    /// Human label
    pub label: String,
}

impl Atom {
    /// Atom with its label-derived id
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            id: TermId::atom(&label),
            label,
        }
    }
}

/// A subject-predicate-object claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Triple {
    /// Term id (also the Support wing)
    pub id: TermId,
    /// Subject atom
    pub subject: TermId,
    /// Predicate atom
    pub predicate: TermId,
    /// Object atom (the totem)
    pub object: TermId,
}

impl Triple {
    /// Triple with its derived id
    pub fn new(subject: TermId, predicate: TermId, object: TermId) -> Self {
        Self {
            id: TermId::triple(&subject, &predicate, &object),
            subject,
            predicate,
            object,
        }
    }

    /// Term id of the given wing
    pub fn wing(&self, direction: Direction) -> TermId {
        match direction {
            Direction::Support => self.id,
            Direction::Oppose => self.id.counter(),
        }
    }
}

// ============ Vault Types ============

/// Address of one vault: a claim wing on a curve
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct VaultRef {
    /// Wing term id
    pub term_id: TermId,
    /// Curve
    pub curve: Curve,
}

impl VaultRef {
    /// Creates a vault reference
    pub fn new(term_id: TermId, curve: Curve) -> Self {
        Self { term_id, curve }
    }
}

/// Aggregate balances of a vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct VaultState {
    /// Total shares outstanding
    pub total_shares: Shares,
    /// Total assets held
    pub total_assets: Amount,
}

impl VaultState {
    /// Returns true if nobody holds shares
    pub fn is_empty(&self) -> bool {
        self.total_shares == 0
    }
}

/// Vault totals of one wing on both curves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct WingTotals {
    /// Stable curve vault
    pub stable: VaultState,
    /// Conviction curve vault
    pub conviction: VaultState,
}

impl WingTotals {
    /// Totals for a curve
    pub fn get(&self, curve: Curve) -> &VaultState {
        match curve {
            Curve::Stable => &self.stable,
            Curve::Conviction => &self.conviction,
        }
    }

    /// Mutable totals for a curve
    pub fn get_mut(&mut self, curve: Curve) -> &mut VaultState {
        match curve {
            Curve::Stable => &mut self.stable,
            Curve::Conviction => &mut self.conviction,
        }
    }
}

/// A claim as seen on the ledger, with both wings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct ClaimInfo {
    /// The underlying triple
    pub triple: Triple,
    /// Support wing term id
    pub support_wing: TermId,
    /// Oppose wing term id, unresolved until someone stakes against
    pub oppose_wing: Option<TermId>,
    /// Support wing vault totals
    pub support: WingTotals,
    /// Oppose wing vault totals
    pub oppose: WingTotals,
}

impl ClaimInfo {
    /// Fresh claim with empty vaults
    pub fn new(triple: Triple) -> Self {
        Self {
            triple,
            support_wing: triple.id,
            oppose_wing: None,
            support: WingTotals::default(),
            oppose: WingTotals::default(),
        }
    }

    /// Oppose wing id, derived from the triple id when unresolved
    pub fn oppose_wing_or_derived(&self) -> TermId {
        self.oppose_wing.unwrap_or_else(|| self.triple.id.counter())
    }

    /// Wing id for a direction
    pub fn wing(&self, direction: Direction) -> TermId {
        match direction {
            Direction::Support => self.support_wing,
            Direction::Oppose => self.oppose_wing_or_derived(),
        }
    }

    /// Vault totals for a wing on a curve
    pub fn totals(&self, direction: Direction, curve: Curve) -> &VaultState {
        match direction {
            Direction::Support => self.support.get(curve),
            Direction::Oppose => self.oppose.get(curve),
        }
    }

    /// Returns true if nobody has staked on any vault of this claim
    pub fn is_unstaked(&self) -> bool {
        Curve::ALL.iter().all(|c| {
            self.support.get(*c).is_empty() && self.oppose.get(*c).is_empty()
        })
    }
}

// ============ Positions ============

/// A user's share balance and tracked assets in one vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct PositionEntry {
    /// Shares held
    pub shares: Shares,
    /// Assets contributed after fees, net of redeemed assets
    pub assets: Amount,
}

impl PositionEntry {
    /// Returns true if the share balance is above the dust threshold
    pub fn is_live(&self, dust_threshold: Shares) -> bool {
        self.shares > dust_threshold
    }
}

/// One raw stake event from a user's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct StakeEvent {
    /// Claim the event belongs to
    pub triple: Triple,
    /// Wing term that received or released shares
    pub wing_id: TermId,
    /// Curve of the vault
    pub curve: Curve,
    /// Wing polarity
    pub direction: Direction,
    /// Deposit or redeem
    pub kind: StakeKind,
    /// Shares minted or burned
    pub shares: Shares,
    /// Assets after fees moved in or out
    pub assets: Amount,
    /// Block height, for display ordering only
    pub block_height: u64,
}

// ============ Cart Types ============

/// Estimated proceeds of redeeming a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecoveryEstimate {
    /// Pro-rata share of vault assets
    pub gross_assets: Amount,
    /// Exit fee deducted
    pub exit_fee: Amount,
    /// What the user receives
    pub net_assets: Amount,
}

impl RecoveryEstimate {
    /// Sum of two estimates
    pub fn combine(&self, other: &RecoveryEstimate) -> RecoveryEstimate {
        RecoveryEstimate {
            gross_assets: self.gross_assets.saturating_add(other.gross_assets),
            exit_fee: self.exit_fee.saturating_add(other.exit_fee),
            net_assets: self.net_assets.saturating_add(other.net_assets),
        }
    }
}

/// A held position that must be redeemed before a deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemTarget {
    /// Claim holding the position
    pub triple: Triple,
    /// Wing term to redeem from
    pub wing_id: TermId,
    /// Curve of the vault
    pub curve: Curve,
    /// Wing polarity
    pub direction: Direction,
    /// Shares to redeem
    pub shares: Shares,
    /// Expected proceeds
    pub estimate: RecoveryEstimate,
    /// Minimum assets accepted on redeem (0 = any)
    pub min_assets: Amount,
}

impl RedeemTarget {
    /// The vault this target redeems from
    pub fn vault(&self) -> VaultRef {
        VaultRef::new(self.wing_id, self.curve)
    }
}

/// Claim that a cart item stakes on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimTarget {
    /// Claim already on the ledger
    Existing(Triple),
    /// Claim that the settlement must create first
    New(NewClaim),
}

impl ClaimTarget {
    /// Returns true if settling this target needs a creating call
    pub fn is_new(&self) -> bool {
        matches!(self, ClaimTarget::New(_))
    }

    /// Triple id this target has or will have
    pub fn derived_triple(&self) -> Triple {
        match self {
            ClaimTarget::Existing(triple) => *triple,
            ClaimTarget::New(new) => new.derived_triple(),
        }
    }
}

/// Descriptor of a not-yet-created claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClaim {
    /// Subject atom
    pub subject: TermRef,
    /// Predicate atom
    pub predicate: TermRef,
    /// Object atom
    pub object: TermRef,
}

impl NewClaim {
    /// Creates a descriptor
    pub fn new(subject: TermRef, predicate: TermRef, object: TermRef) -> Self {
        Self { subject, predicate, object }
    }

    /// Subject, predicate and object references
    pub fn terms(&self) -> [&TermRef; 3] {
        [&self.subject, &self.predicate, &self.object]
    }

    /// The triple this descriptor will produce
    pub fn derived_triple(&self) -> Triple {
        Triple::new(
            self.subject.derived_id(),
            self.predicate.derived_id(),
            self.object.derived_id(),
        )
    }
}

/// A pending stake instruction awaiting settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCartItem {
    /// Claim to stake on
    pub target: ClaimTarget,
    /// Curve to deposit on
    pub curve: Curve,
    /// Wing to deposit into
    pub direction: Direction,
    /// Assets to deposit
    pub amount: Amount,
    /// Positions to redeem before the deposit
    pub redeems: Vec<RedeemTarget>,
    /// Minimum shares accepted on deposit (0 = any)
    pub min_shares: Shares,
}

impl VoteCartItem {
    /// Plain deposit with no displacement
    pub fn deposit(target: ClaimTarget, curve: Curve, direction: Direction, amount: Amount) -> Self {
        Self {
            target,
            curve,
            direction,
            amount,
            redeems: Vec::new(),
            min_shares: 0,
        }
    }

    /// Returns true if this item displaces existing positions
    pub fn requires_redeem(&self) -> bool {
        !self.redeems.is_empty()
    }

    /// Vault the deposit lands in
    pub fn deposit_vault(&self) -> VaultRef {
        VaultRef::new(self.target.derived_triple().wing(self.direction), self.curve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_id_is_label_derived() {
        assert_eq!(TermId::atom("wolf"), TermId::atom("wolf"));
        assert_ne!(TermId::atom("wolf"), TermId::atom("bear"));
        assert_eq!(Atom::new("wolf").id, TermId::atom("wolf"));
    }

    #[test]
    fn test_triple_wings() {
        let triple = Triple::new(TermId::atom("me"), TermId::atom("has totem"), TermId::atom("wolf"));
        assert_eq!(triple.wing(Direction::Support), triple.id);
        assert_eq!(triple.wing(Direction::Oppose), triple.id.counter());
        assert_ne!(triple.id, triple.id.counter());

        // Order of the atoms matters
        let flipped = Triple::new(TermId::atom("wolf"), TermId::atom("has totem"), TermId::atom("me"));
        assert_ne!(triple.id, flipped.id);
    }

    #[test]
    fn test_claim_info_derives_oppose_wing() {
        let triple = Triple::new(TermId::atom("a"), TermId::atom("b"), TermId::atom("c"));
        let mut claim = ClaimInfo::new(triple);
        assert_eq!(claim.wing(Direction::Oppose), triple.id.counter());
        assert!(claim.is_unstaked());

        claim.support.stable.total_shares = 10;
        assert!(!claim.is_unstaked());
    }

    #[test]
    fn test_term_ref_resolution() {
        let pending = TermRef::label("wolf");
        assert!(pending.is_pending());
        assert_eq!(pending.id(), None);
        assert_eq!(pending.derived_id(), TermId::atom("wolf"));

        let resolved = TermRef::from(TermId::atom("wolf"));
        assert_eq!(resolved.id(), Some(TermId::atom("wolf")));
    }

    #[test]
    fn test_curve_ids() {
        for curve in Curve::ALL {
            assert_eq!(Curve::from_id(curve.id()), Some(curve));
        }
        assert_eq!(Curve::from_id(99), None);
        assert_eq!(Curve::Stable.other(), Curve::Conviction);
    }
}

//! Position Aggregator
//!
//! Folds raw stake history into one bundle per claim with four buckets:
//! Stable×Support, Stable×Oppose, Conviction×Support, Conviction×Oppose.
//!
//! Accumulation is signed and only clamped at the end, so the result does
//! not depend on event order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use totem_common::types::{
    Curve, Direction, PositionEntry, Shares, StakeEvent, StakeKind, TermId, Triple, VaultRef,
};

/// Positions keyed by claim (triple) id
pub type Positions = BTreeMap<TermId, PositionBundle>;

/// One live position, addressed by claim, curve and wing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldPosition {
    pub triple: Triple,
    pub curve: Curve,
    pub direction: Direction,
    pub entry: PositionEntry,
}

impl HeldPosition {
    /// Wing term the position sits in
    pub fn wing_id(&self) -> TermId {
        self.triple.wing(self.direction)
    }

    /// Vault the position sits in
    pub fn vault(&self) -> VaultRef {
        VaultRef::new(self.wing_id(), self.curve)
    }
}

/// A user's four positions on one claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionBundle {
    pub triple: Triple,
    pub stable_support: PositionEntry,
    pub stable_oppose: PositionEntry,
    pub conviction_support: PositionEntry,
    pub conviction_oppose: PositionEntry,
}

impl PositionBundle {
    /// Empty bundle for a claim
    pub fn new(triple: Triple) -> Self {
        Self {
            triple,
            stable_support: PositionEntry::default(),
            stable_oppose: PositionEntry::default(),
            conviction_support: PositionEntry::default(),
            conviction_oppose: PositionEntry::default(),
        }
    }

    /// Position in one bucket
    pub fn get(&self, curve: Curve, direction: Direction) -> PositionEntry {
        match (curve, direction) {
            (Curve::Stable, Direction::Support) => self.stable_support,
            (Curve::Stable, Direction::Oppose) => self.stable_oppose,
            (Curve::Conviction, Direction::Support) => self.conviction_support,
            (Curve::Conviction, Direction::Oppose) => self.conviction_oppose,
        }
    }

    /// Mutable position in one bucket
    pub fn get_mut(&mut self, curve: Curve, direction: Direction) -> &mut PositionEntry {
        match (curve, direction) {
            (Curve::Stable, Direction::Support) => &mut self.stable_support,
            (Curve::Stable, Direction::Oppose) => &mut self.stable_oppose,
            (Curve::Conviction, Direction::Support) => &mut self.conviction_support,
            (Curve::Conviction, Direction::Oppose) => &mut self.conviction_oppose,
        }
    }

    /// Returns true if the bucket holds more than dust
    pub fn holds(&self, curve: Curve, direction: Direction, dust_threshold: Shares) -> bool {
        self.get(curve, direction).is_live(dust_threshold)
    }

    /// Buckets holding more than dust
    pub fn held(&self, dust_threshold: Shares) -> Vec<HeldPosition> {
        let mut held = Vec::new();
        for curve in Curve::ALL {
            for direction in [Direction::Support, Direction::Oppose] {
                let entry = self.get(curve, direction);
                if entry.is_live(dust_threshold) {
                    held.push(HeldPosition { triple: self.triple, curve, direction, entry });
                }
            }
        }
        held
    }

    /// Returns true if nothing above dust is held
    pub fn is_empty(&self, dust_threshold: Shares) -> bool {
        self.held(dust_threshold).is_empty()
    }

    /// Returns true if both wings are held on the same curve
    pub fn has_crossed_wings(&self, dust_threshold: Shares) -> bool {
        Curve::ALL.iter().any(|curve| {
            self.holds(*curve, Direction::Support, dust_threshold)
                && self.holds(*curve, Direction::Oppose, dust_threshold)
        })
    }
}

#[derive(Default, Clone, Copy)]
struct Accumulator {
    shares: i128,
    assets: i128,
}

impl Accumulator {
    fn apply(&mut self, event: &StakeEvent) {
        let shares = to_signed(event.shares);
        let assets = to_signed(event.assets);
        match event.kind {
            StakeKind::Deposit => {
                self.shares = self.shares.saturating_add(shares);
                self.assets = self.assets.saturating_add(assets);
            }
            StakeKind::Redeem => {
                self.shares = self.shares.saturating_sub(shares);
                self.assets = self.assets.saturating_sub(assets);
            }
        }
    }

    fn settle(self) -> PositionEntry {
        PositionEntry {
            shares: to_unsigned(self.shares),
            assets: to_unsigned(self.assets),
        }
    }
}

fn to_signed(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}

fn to_unsigned(value: i128) -> u128 {
    u128::try_from(value).unwrap_or(0)
}

fn bucket(curve: Curve, direction: Direction) -> usize {
    match (curve, direction) {
        (Curve::Stable, Direction::Support) => 0,
        (Curve::Stable, Direction::Oppose) => 1,
        (Curve::Conviction, Direction::Support) => 2,
        (Curve::Conviction, Direction::Oppose) => 3,
    }
}

/// Fold stake events into per-claim bundles
///
/// Deterministic and order-independent. Balances never go below zero.
pub fn aggregate(events: &[StakeEvent]) -> Positions {
    let mut sums: BTreeMap<TermId, (Triple, [Accumulator; 4])> = BTreeMap::new();
    for event in events {
        let (_, buckets) = sums
            .entry(event.triple.id)
            .or_insert_with(|| (event.triple, [Accumulator::default(); 4]));
        buckets[bucket(event.curve, event.direction)].apply(event);
    }

    sums.into_iter()
        .map(|(id, (triple, buckets))| {
            let mut bundle = PositionBundle::new(triple);
            for curve in Curve::ALL {
                for direction in [Direction::Support, Direction::Oppose] {
                    *bundle.get_mut(curve, direction) = buckets[bucket(curve, direction)].settle();
                }
            }
            (id, bundle)
        })
        .collect()
}

/// Bundles on claims about one object (totem)
pub fn on_object<'a>(positions: &'a Positions, object: &'a TermId) -> impl Iterator<Item = &'a PositionBundle> + 'a {
    positions.values().filter(move |bundle| bundle.triple.object == *object)
}

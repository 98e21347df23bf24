//! Positions and Transitions
//!
//! - [`aggregate`]: folds stake history into per-claim position bundles
//! - [`transitions`]: decides whether a requested stake is allowed, needs a
//!   prior redeem, or is blocked
//! - [`redeem`]: plans proportional withdrawals
//! - [`snapshot`]: loads positions and vault totals from the ledger
//!
//! Everything except [`snapshot`] is pure.

pub mod aggregate;
pub mod redeem;
pub mod snapshot;
pub mod transitions;

pub use aggregate::{aggregate, on_object, HeldPosition, PositionBundle, Positions};
pub use redeem::plan_proportional_redeem;
pub use snapshot::{load_positions, load_vaults};
pub use transitions::{
    evaluate, full_redeem, redeem_target, TransitionDecision, TransitionRequest, VaultSnapshot,
};

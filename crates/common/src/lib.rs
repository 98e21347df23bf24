//! Totem Common Library
//!
//! Shared types, constants, and utilities for the totem claim staking
//! engine. Every other crate in the workspace builds on this one.
//!
//! ## Concepts
//!
//! - **Claims** are subject-predicate-object triples with a Support and an
//!   Oppose wing
//! - **Vaults** hold shares and assets per (wing, curve); the Stable and
//!   Conviction curves are independent pools
//! - **Positions** are a user's share balance in one vault
//!
//! ## Collaborators
//!
//! The ledger is external. The engine reaches it through the [`ledger`]
//! traits: an eventually consistent [`ledger::Indexer`], an authoritative
//! [`ledger::ChainReader`] and a [`ledger::Wallet`]. Enable the `testing`
//! feature for an in-memory implementation of all three.

pub mod config;
pub mod constants;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod math;
pub mod types;
pub mod validation;

#[cfg(feature = "testing")]
pub mod testkit;

// Re-exports for convenience
pub use config::*;
pub use constants::*;
pub use errors::*;
pub use events::*;
pub use ledger::*;
pub use math::*;
pub use types::*;

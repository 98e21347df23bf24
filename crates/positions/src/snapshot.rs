//! Loading a decision snapshot from the ledger
//!
//! Positions come from the indexer's stake history. Vault totals come from
//! the chain and are read concurrently; they are only used for estimates.

use futures::future::join_all;
use tracing::debug;

use totem_common::{
    errors::EngineResult,
    ledger::{ChainReader, Indexer},
    types::{Address, VaultRef},
};

use crate::aggregate::{aggregate, Positions};
use crate::transitions::VaultSnapshot;

/// Aggregated positions of an account
pub async fn load_positions(indexer: &dyn Indexer, account: &Address) -> EngineResult<Positions> {
    let events = indexer.stake_events(account).await?;
    debug!(events = events.len(), "Aggregating stake history");
    Ok(aggregate(&events))
}

/// Chain totals of every vault the positions touch
pub async fn load_vaults(
    chain: &dyn ChainReader,
    positions: &Positions,
    dust_threshold: u128,
) -> EngineResult<VaultSnapshot> {
    let vaults: Vec<VaultRef> = positions
        .values()
        .flat_map(|bundle| bundle.held(dust_threshold))
        .map(|held| held.vault())
        .collect();

    let states = join_all(vaults.iter().map(|vault| chain.vault_state(vault))).await;

    let mut snapshot = VaultSnapshot::new();
    for (vault, state) in vaults.into_iter().zip(states) {
        snapshot.insert(vault, state?);
    }
    Ok(snapshot)
}

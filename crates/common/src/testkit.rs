//! In-memory ledger for tests
//!
//! `InMemoryLedger` plays chain, indexer and wallet at once. Calls are
//! executed atomically at confirmation time: either every item applies or
//! the whole call reverts and no state changes.
//!
//! Pricing is a stand-in for the real bonding curves:
//! - Stable: shares are minted pro rata to the vault (1:1 while empty)
//! - Conviction: each unit of assets mints fewer shares as the vault grows

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha256};

use crate::config::ProtocolConfig;
use crate::constants::token::ONE;
use crate::ledger::{CallKind, ChainReader, ContractCall, Indexer, LedgerError, TxReceipt, Wallet};
use crate::math::pro_rata_assets;
use crate::types::{
    Address, Amount, Atom, ClaimInfo, Curve, Direction, PositionEntry, Shares, StakeEvent, StakeKind,
    TermId, Triple, TxHash, VaultRef, VaultState,
};

/// Account the ledger connects as by default
pub const DEFAULT_ACCOUNT: Address = [0xA1; 20];

#[derive(Debug, Clone, Default)]
struct LedgerState {
    address: Option<Address>,
    balances: HashMap<Address, Amount>,
    atoms: BTreeMap<TermId, Atom>,
    triples: BTreeMap<TermId, Triple>,
    /// Counter term id -> triple id
    counters: BTreeMap<TermId, TermId>,
    vaults: HashMap<VaultRef, VaultState>,
    positions: HashMap<(Address, VaultRef), PositionEntry>,
    history: Vec<(Address, StakeEvent)>,
    pending: BTreeMap<[u8; 32], (Address, ContractCall)>,
    calls: Vec<ContractCall>,
    nonce: u64,
    block_height: u64,
    reject_next: bool,
    revert_next: Option<CallKind>,
    indexer_lag: bool,
    unindexed: BTreeSet<TermId>,
}

/// Deterministic in-memory chain, indexer and wallet
#[derive(Clone)]
pub struct InMemoryLedger {
    config: ProtocolConfig,
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedger {
    /// Empty ledger connected as [`DEFAULT_ACCOUNT`] with no funds
    pub fn new(config: ProtocolConfig) -> Self {
        let state = LedgerState {
            address: Some(DEFAULT_ACCOUNT),
            ..Default::default()
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ============ Setup ============

    /// Credit an account
    pub fn fund(&self, account: Address, amount: Amount) {
        *self.state().balances.entry(account).or_default() += amount;
    }

    /// Register an atom without a creating call
    pub fn seed_atom(&self, label: &str) -> TermId {
        let atom = Atom::new(label);
        let id = atom.id;
        self.state().atoms.insert(id, atom);
        id
    }

    /// Register a claim (and its atoms) without a creating call
    pub fn seed_claim(&self, subject: &str, predicate: &str, object: &str) -> Triple {
        let triple = Triple::new(self.seed_atom(subject), self.seed_atom(predicate), self.seed_atom(object));
        let mut state = self.state();
        state.triples.insert(triple.id, triple);
        state.counters.insert(triple.id.counter(), triple.id);
        triple
    }

    /// Give an account a position by depositing on its behalf, free of charge
    pub fn seed_position(
        &self,
        account: Address,
        triple: &Triple,
        direction: Direction,
        curve: Curve,
        assets: Amount,
    ) -> PositionEntry {
        let mut state = self.state();
        let vault = VaultRef::new(triple.wing(direction), curve);
        let shares = mint_shares(state.vaults.get(&vault).copied().unwrap_or_default(), curve, assets)
            .unwrap_or_default();
        apply_deposit(&mut state, account, *triple, direction, vault, shares, assets);
        state.positions.get(&(account, vault)).copied().unwrap_or_default()
    }

    // ============ Failure Injection ============

    /// The next signature request is rejected by the user
    pub fn reject_next_signature(&self) {
        self.state().reject_next = true;
    }

    /// The next call of this kind reverts at confirmation
    pub fn revert_next(&self, kind: CallKind) {
        self.state().revert_next = Some(kind);
    }

    /// While lagging, terms created on chain stay invisible to the indexer
    pub fn set_indexer_lag(&self, lagging: bool) {
        let mut state = self.state();
        state.indexer_lag = lagging;
        if !lagging {
            state.unindexed.clear();
        }
    }

    /// Drop the wallet connection
    pub fn disconnect(&self) {
        self.state().address = None;
    }

    // ============ Inspection ============

    /// Every call submitted so far, in order
    pub fn calls(&self) -> Vec<ContractCall> {
        self.state().calls.clone()
    }

    /// Number of submitted calls of one kind
    pub fn call_count(&self, kind: CallKind) -> usize {
        self.state().calls.iter().filter(|c| c.kind() == kind).count()
    }

    /// Number of atoms on chain
    pub fn atom_count(&self) -> usize {
        self.state().atoms.len()
    }

    /// Number of triples on chain
    pub fn triple_count(&self) -> usize {
        self.state().triples.len()
    }

    /// Token balance of an account
    pub fn balance_of(&self, account: &Address) -> Amount {
        self.state().balances.get(account).copied().unwrap_or_default()
    }

    /// Position of an account in one vault
    pub fn position_of(&self, account: &Address, vault: &VaultRef) -> PositionEntry {
        self.state().positions.get(&(*account, *vault)).copied().unwrap_or_default()
    }

    /// Totals of one vault
    pub fn vault(&self, vault: &VaultRef) -> VaultState {
        self.state().vaults.get(vault).copied().unwrap_or_default()
    }

    // ============ Execution ============

    fn execute(&self, state: &mut LedgerState, sender: Address, call: &ContractCall) -> Result<Vec<u128>, LedgerError> {
        call.validate().map_err(|e| LedgerError::Reverted(e.to_string()))?;
        let value = call.value().map_err(|e| LedgerError::Reverted(e.to_string()))?;
        let balance = state.balances.get(&sender).copied().unwrap_or_default();
        if balance < value {
            return Err(LedgerError::Reverted("insufficient funds for value".into()));
        }
        *state.balances.entry(sender).or_default() -= value;

        match call {
            ContractCall::CreateAtoms { labels, assets } => {
                let mut out = Vec::with_capacity(labels.len());
                for (label, paid) in labels.iter().zip(assets) {
                    if *paid < self.config.atom_creation_cost {
                        return Err(LedgerError::Reverted("atom creation cost not covered".into()));
                    }
                    let atom = Atom::new(label.clone());
                    if state.atoms.contains_key(&atom.id) {
                        return Err(LedgerError::Reverted(format!("atom {} exists", atom.id)));
                    }
                    if state.indexer_lag {
                        state.unindexed.insert(atom.id);
                    }
                    state.atoms.insert(atom.id, atom);
                    out.push(0);
                }
                Ok(out)
            }

            ContractCall::CreateTriples { subjects, predicates, objects, assets } => {
                let mut out = Vec::with_capacity(subjects.len());
                for i in 0..subjects.len() {
                    for atom in [&subjects[i], &predicates[i], &objects[i]] {
                        if !state.atoms.contains_key(atom) {
                            return Err(LedgerError::Reverted(format!("unknown atom {}", atom)));
                        }
                    }
                    let triple = Triple::new(subjects[i], predicates[i], objects[i]);
                    if state.triples.contains_key(&triple.id) {
                        return Err(LedgerError::Reverted(format!("triple {} exists", triple.id)));
                    }
                    let deposit = assets[i]
                        .checked_sub(self.config.triple_creation_cost)
                        .ok_or_else(|| LedgerError::Reverted("triple creation cost not covered".into()))?;

                    state.triples.insert(triple.id, triple);
                    state.counters.insert(triple.id.counter(), triple.id);
                    if state.indexer_lag {
                        state.unindexed.insert(triple.id);
                    }

                    let minted = if deposit > 0 {
                        let vault = VaultRef::new(triple.id, self.config.genesis_curve);
                        self.deposit_into(state, sender, triple, Direction::Support, vault, deposit, 0)?
                    } else {
                        0
                    };
                    out.push(minted);
                }
                Ok(out)
            }

            ContractCall::DepositBatch { receiver, term_ids, curve_ids, assets, min_shares } => {
                let mut out = Vec::with_capacity(term_ids.len());
                for i in 0..term_ids.len() {
                    if assets[i] < self.config.min_deposit {
                        return Err(LedgerError::Reverted("deposit below minimum".into()));
                    }
                    let (triple, direction) = wing_of(state, &term_ids[i])?;
                    let curve = curve_of(curve_ids[i])?;
                    let vault = VaultRef::new(term_ids[i], curve);
                    let minted =
                        self.deposit_into(state, *receiver, triple, direction, vault, assets[i], min_shares[i])?;
                    out.push(minted);
                }
                Ok(out)
            }

            ContractCall::RedeemBatch { receiver, term_ids, curve_ids, shares, min_assets } => {
                let mut out = Vec::with_capacity(term_ids.len());
                for i in 0..term_ids.len() {
                    let curve = curve_of(curve_ids[i])?;
                    out.push(self.redeem_from(state, *receiver, &term_ids[i], curve, shares[i], min_assets[i])?);
                }
                Ok(out)
            }

            ContractCall::Redeem { receiver, term_id, curve_id, shares, min_assets } => {
                let curve = curve_of(*curve_id)?;
                Ok(vec![self.redeem_from(state, *receiver, term_id, curve, *shares, *min_assets)?])
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deposit_into(
        &self,
        state: &mut LedgerState,
        receiver: Address,
        triple: Triple,
        direction: Direction,
        vault: VaultRef,
        assets: Amount,
        min_shares: Shares,
    ) -> Result<Shares, LedgerError> {
        let entry_fee = self
            .config
            .fees
            .entry_fee(assets)
            .map_err(|e| LedgerError::Reverted(e.to_string()))?;
        let net = assets - entry_fee;
        let totals = state.vaults.get(&vault).copied().unwrap_or_default();
        let shares = mint_shares(totals, vault.curve, net)?;
        if shares < min_shares {
            return Err(LedgerError::SlippageExceeded(format!("minted {} shares, floor {}", shares, min_shares)));
        }
        apply_deposit(state, receiver, triple, direction, vault, shares, net);
        Ok(shares)
    }

    fn redeem_from(
        &self,
        state: &mut LedgerState,
        receiver: Address,
        term_id: &TermId,
        curve: Curve,
        shares: Shares,
        min_assets: Amount,
    ) -> Result<Amount, LedgerError> {
        let (triple, direction) = wing_of(state, term_id)?;
        let vault = VaultRef::new(*term_id, curve);
        let held = state.positions.get(&(receiver, vault)).copied().unwrap_or_default();
        if shares == 0 || shares > held.shares {
            return Err(LedgerError::Reverted(format!("cannot redeem {} of {} shares", shares, held.shares)));
        }

        let totals = state.vaults.get(&vault).copied().unwrap_or_default();
        let gross = pro_rata_assets(shares, &totals).map_err(|e| LedgerError::Reverted(e.to_string()))?;
        let exit_fee = self
            .config
            .fees
            .exit_fee(gross)
            .map_err(|e| LedgerError::Reverted(e.to_string()))?;
        let net = gross - exit_fee;
        if net < min_assets {
            return Err(LedgerError::SlippageExceeded(format!("returned {} assets, floor {}", net, min_assets)));
        }

        let vault_totals = state.vaults.entry(vault).or_default();
        vault_totals.total_shares -= shares;
        vault_totals.total_assets = vault_totals.total_assets.saturating_sub(gross);

        let position = state.positions.entry((receiver, vault)).or_default();
        let released = position.assets.saturating_mul(shares) / position.shares.max(1);
        position.shares -= shares;
        position.assets = position.assets.saturating_sub(released);

        *state.balances.entry(receiver).or_default() += net;
        state.block_height += 1;
        let block_height = state.block_height;
        state.history.push((
            receiver,
            StakeEvent {
                triple,
                wing_id: *term_id,
                curve,
                direction,
                kind: StakeKind::Redeem,
                shares,
                assets: gross,
                block_height,
            },
        ));
        Ok(net)
    }

    fn claim_info(state: &LedgerState, triple: &Triple) -> ClaimInfo {
        let mut claim = ClaimInfo::new(*triple);
        let counter = triple.id.counter();
        for curve in Curve::ALL {
            *claim.support.get_mut(curve) = state.vaults.get(&VaultRef::new(triple.id, curve)).copied().unwrap_or_default();
            if let Some(totals) = state.vaults.get(&VaultRef::new(counter, curve)) {
                *claim.oppose.get_mut(curve) = *totals;
                claim.oppose_wing = Some(counter);
            }
        }
        claim
    }
}

fn curve_of(id: u32) -> Result<Curve, LedgerError> {
    Curve::from_id(id).ok_or_else(|| LedgerError::Reverted(format!("unknown curve {}", id)))
}

fn wing_of(state: &LedgerState, term_id: &TermId) -> Result<(Triple, Direction), LedgerError> {
    if let Some(triple) = state.triples.get(term_id) {
        return Ok((*triple, Direction::Support));
    }
    state
        .counters
        .get(term_id)
        .and_then(|id| state.triples.get(id))
        .map(|triple| (*triple, Direction::Oppose))
        .ok_or_else(|| LedgerError::Reverted(format!("unknown term {}", term_id)))
}

fn mint_shares(totals: VaultState, curve: Curve, net_assets: Amount) -> Result<Shares, LedgerError> {
    let overflow = || LedgerError::Reverted("share math overflow".into());
    match curve {
        Curve::Stable => {
            if totals.total_shares == 0 || totals.total_assets == 0 {
                Ok(net_assets)
            } else {
                Ok(net_assets.checked_mul(totals.total_shares).ok_or_else(overflow)? / totals.total_assets)
            }
        }
        Curve::Conviction => {
            let denominator = ONE.checked_add(totals.total_assets).ok_or_else(overflow)?;
            Ok(net_assets.checked_mul(ONE).ok_or_else(overflow)? / denominator)
        }
    }
}

fn apply_deposit(
    state: &mut LedgerState,
    receiver: Address,
    triple: Triple,
    direction: Direction,
    vault: VaultRef,
    shares: Shares,
    net_assets: Amount,
) {
    let totals = state.vaults.entry(vault).or_default();
    totals.total_shares += shares;
    totals.total_assets += net_assets;

    let position = state.positions.entry((receiver, vault)).or_default();
    position.shares += shares;
    position.assets += net_assets;

    state.block_height += 1;
    let block_height = state.block_height;
    state.history.push((
        receiver,
        StakeEvent {
            triple,
            wing_id: vault.term_id,
            curve: vault.curve,
            direction,
            kind: StakeKind::Deposit,
            shares,
            assets: net_assets,
            block_height,
        },
    ));
}

// ============ Collaborator Implementations ============

#[async_trait::async_trait]
impl Indexer for InMemoryLedger {
    async fn find_atom(&self, label: &str) -> Result<Option<Atom>, LedgerError> {
        let state = self.state();
        let id = TermId::atom(label);
        if state.unindexed.contains(&id) {
            return Ok(None);
        }
        Ok(state.atoms.get(&id).cloned())
    }

    async fn find_triple(
        &self,
        subject: &TermId,
        predicate: &TermId,
        object: &TermId,
    ) -> Result<Option<ClaimInfo>, LedgerError> {
        let state = self.state();
        let id = TermId::triple(subject, predicate, object);
        if state.unindexed.contains(&id) {
            return Ok(None);
        }
        Ok(state.triples.get(&id).map(|triple| Self::claim_info(&state, triple)))
    }

    async fn position(&self, account: &Address, vault: &VaultRef) -> Result<PositionEntry, LedgerError> {
        Ok(self.position_of(account, vault))
    }

    async fn stake_events(&self, account: &Address) -> Result<Vec<StakeEvent>, LedgerError> {
        Ok(self
            .state()
            .history
            .iter()
            .filter(|(owner, _)| owner == account)
            .map(|(_, event)| event.clone())
            .collect())
    }
}

#[async_trait::async_trait]
impl ChainReader for InMemoryLedger {
    async fn term_exists(&self, term: &TermId) -> Result<bool, LedgerError> {
        let state = self.state();
        Ok(state.atoms.contains_key(term) || state.triples.contains_key(term) || state.counters.contains_key(term))
    }

    async fn vault_state(&self, vault: &VaultRef) -> Result<VaultState, LedgerError> {
        Ok(self.vault(vault))
    }

    async fn preview_deposit(&self, vault: &VaultRef, net_assets: Amount) -> Result<Shares, LedgerError> {
        mint_shares(self.vault(vault), vault.curve, net_assets)
    }

    async fn preview_redeem(&self, vault: &VaultRef, shares: Shares) -> Result<Amount, LedgerError> {
        pro_rata_assets(shares, &self.vault(vault)).map_err(|e| LedgerError::Network(e.to_string()))
    }

    async fn max_redeem(&self, account: &Address, vault: &VaultRef) -> Result<Shares, LedgerError> {
        Ok(self.position_of(account, vault).shares)
    }

    async fn balance(&self, account: &Address) -> Result<Amount, LedgerError> {
        Ok(self.balance_of(account))
    }
}

#[async_trait::async_trait]
impl Wallet for InMemoryLedger {
    fn address(&self) -> Option<Address> {
        self.state().address
    }

    async fn submit(&self, call: ContractCall) -> Result<TxHash, LedgerError> {
        let mut state = self.state();
        let sender = state.address.ok_or(LedgerError::NotConnected)?;
        if std::mem::take(&mut state.reject_next) {
            return Err(LedgerError::Rejected);
        }

        state.nonce += 1;
        let mut hasher = Sha256::new();
        hasher.update(b"tx");
        hasher.update(state.nonce.to_be_bytes());
        let tx: [u8; 32] = hasher.finalize().into();

        state.calls.push(call.clone());
        state.pending.insert(tx, (sender, call));
        Ok(TxHash(tx))
    }

    async fn confirm(&self, tx: &TxHash) -> Result<TxReceipt, LedgerError> {
        let mut state = self.state();
        let (sender, call) = state
            .pending
            .remove(&tx.0)
            .ok_or_else(|| LedgerError::Network(format!("unknown transaction {}", tx)))?;

        if state.revert_next == Some(call.kind()) {
            state.revert_next = None;
            return Err(LedgerError::Reverted(format!("{} reverted", call.signature())));
        }

        let mut working = state.clone();
        let item_amounts = self.execute(&mut working, sender, &call)?;
        working.block_height += 1;
        *state = working;

        Ok(TxReceipt {
            tx: *tx,
            block_height: state.block_height,
            item_amounts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> InMemoryLedger {
        let ledger = InMemoryLedger::new(ProtocolConfig::default());
        ledger.fund(DEFAULT_ACCOUNT, 10 * ONE);
        ledger
    }

    #[tokio::test]
    async fn test_create_atoms_then_triple() {
        let ledger = ledger();
        let config = ProtocolConfig::default();

        let tx = ledger
            .submit(ContractCall::CreateAtoms {
                labels: vec!["me".into(), "has totem".into(), "wolf".into()],
                assets: vec![config.atom_creation_cost; 3],
            })
            .await
            .unwrap();
        ledger.confirm(&tx).await.unwrap();
        assert_eq!(ledger.atom_count(), 3);

        let tx = ledger
            .submit(ContractCall::CreateTriples {
                subjects: vec![TermId::atom("me")],
                predicates: vec![TermId::atom("has totem")],
                objects: vec![TermId::atom("wolf")],
                assets: vec![config.triple_creation_cost + ONE],
            })
            .await
            .unwrap();
        let receipt = ledger.confirm(&tx).await.unwrap();
        assert!(receipt.item_amounts[0] > 0);

        let triple = Triple::new(TermId::atom("me"), TermId::atom("has totem"), TermId::atom("wolf"));
        let position = ledger.position_of(&DEFAULT_ACCOUNT, &VaultRef::new(triple.id, Curve::Stable));
        assert_eq!(position.shares, receipt.item_amounts[0]);
    }

    #[tokio::test]
    async fn test_reverted_call_changes_nothing() {
        let ledger = ledger();
        let before = ledger.balance_of(&DEFAULT_ACCOUNT);

        // Second atom already exists, so the first must not be created either
        ledger.seed_atom("taken");
        let tx = ledger
            .submit(ContractCall::CreateAtoms {
                labels: vec!["fresh".into(), "taken".into()],
                assets: vec![ONE / 1_000; 2],
            })
            .await
            .unwrap();
        assert!(matches!(ledger.confirm(&tx).await, Err(LedgerError::Reverted(_))));
        assert_eq!(ledger.atom_count(), 1);
        assert_eq!(ledger.balance_of(&DEFAULT_ACCOUNT), before);
    }

    #[tokio::test]
    async fn test_redeem_is_pro_rata_with_exit_fee() {
        let ledger = ledger();
        let triple = ledger.seed_claim("me", "has totem", "wolf");
        let position = ledger.seed_position(DEFAULT_ACCOUNT, &triple, Direction::Support, Curve::Stable, ONE);
        assert_eq!(position.shares, ONE);

        let vault = VaultRef::new(triple.id, Curve::Stable);
        let before = ledger.balance_of(&DEFAULT_ACCOUNT);
        let tx = ledger
            .submit(ContractCall::Redeem {
                receiver: DEFAULT_ACCOUNT,
                term_id: triple.id,
                curve_id: Curve::Stable.id(),
                shares: ONE / 2,
                min_assets: 0,
            })
            .await
            .unwrap();
        let receipt = ledger.confirm(&tx).await.unwrap();

        let gross = ONE / 2;
        let net = gross - gross * 75 / 10_000;
        assert_eq!(receipt.item_amounts, vec![net]);
        assert_eq!(ledger.balance_of(&DEFAULT_ACCOUNT), before + net);
        assert_eq!(ledger.position_of(&DEFAULT_ACCOUNT, &vault).shares, ONE / 2);
    }

    #[tokio::test]
    async fn test_conviction_pricing_is_progressive() {
        let ledger = ledger();
        let triple = ledger.seed_claim("me", "has totem", "wolf");
        let vault = VaultRef::new(triple.id, Curve::Conviction);

        let first = ledger.preview_deposit(&vault, ONE).await.unwrap();
        ledger.seed_position([7u8; 20], &triple, Direction::Support, Curve::Conviction, ONE);
        let second = ledger.preview_deposit(&vault, ONE).await.unwrap();
        assert!(second < first);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let ledger = ledger();
        let call = ContractCall::CreateAtoms { labels: vec!["x".into()], assets: vec![ONE / 1_000] };

        ledger.reject_next_signature();
        assert_eq!(ledger.submit(call.clone()).await, Err(LedgerError::Rejected));

        ledger.revert_next(CallKind::CreateAtoms);
        let tx = ledger.submit(call.clone()).await.unwrap();
        assert!(ledger.confirm(&tx).await.is_err());

        let tx = ledger.submit(call).await.unwrap();
        assert!(ledger.confirm(&tx).await.is_ok());

        ledger.disconnect();
        assert_eq!(ledger.address(), None);
    }

    #[tokio::test]
    async fn test_lagging_indexer_hides_new_terms() {
        let ledger = ledger();
        ledger.set_indexer_lag(true);

        let tx = ledger
            .submit(ContractCall::CreateAtoms { labels: vec!["late".into()], assets: vec![ONE / 1_000] })
            .await
            .unwrap();
        ledger.confirm(&tx).await.unwrap();

        assert_eq!(ledger.find_atom("late").await.unwrap(), None);
        assert!(ledger.term_exists(&TermId::atom("late")).await.unwrap());

        ledger.set_indexer_lag(false);
        assert!(ledger.find_atom("late").await.unwrap().is_some());
    }
}

//! Batch Settlement Orchestrator
//!
//! Turns a vote cart into on-chain calls in two independently committed
//! phases.
//!
//! ## State machine
//!
//! ```text
//! idle ──► validating ──► [withdrawing] ──► depositing ──► success
//!              │               │                │
//!              └───────────────┴────────────────┴──────► error
//! ```
//!
//! - **validating**: the cart is non-empty, the wallet is connected, every
//!   deposit meets the minimum and the wallet (plus what the withdrawals
//!   free up) covers the required value
//! - **withdrawing**: every redeem in the cart goes into one batched redeem
//!   call; skipped when nothing needs redeeming
//! - **depositing**: new claims are created with one atom call and one
//!   triple call (or redirected to a vote), then every remaining deposit
//!   goes into one batched deposit call
//!
//! A withdraw failure stops everything. A deposit failure leaves the
//! committed withdrawals in place; the cart keeps only what is still
//! outstanding so it can be settled again without re-submitting anything.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use totem_claim_resolver::{ClaimCreation, ClaimRequest, ClaimResolver};
use totem_common::{
    check,
    config::ProtocolConfig,
    errors::{EngineError, EngineResult},
    events::{EngineEvent, EventLog, Phase},
    ledger::{ChainReader, ContractCall, WalletSession},
    math::{checked_sum, safe_add},
    types::{Address, Amount, ClaimTarget, RedeemTarget, Shares, TermId, TermRef, TxHash, VaultRef},
    validation::{require_connected, require_genesis_direction, require_min_deposit, require_sufficient_balance},
};

use crate::cart::{merge_redeems, VoteCart};
use crate::withdraw::redeem_batch;

// ============================================================================
// Types
// ============================================================================

/// Settlement state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    /// Nothing running
    Idle,
    /// Checking the cart against wallet and ledger
    Validating,
    /// Batched redeem submitted or awaiting confirmation
    Withdrawing,
    /// Claim creation and batched deposit
    Depositing,
    /// Every phase committed
    Success,
    /// A phase failed; see the execution failure
    Error,
}

/// Progress update published while settling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementProgress {
    /// State changed
    Status(SettlementStatus),
    /// A phase call was handed to the wallet
    Submitted { phase: Phase, items: u32 },
    /// A phase call was confirmed
    Confirmed { phase: Phase, tx: TxHash },
    /// A new-claim item turned into a vote on an existing claim
    Redirected { triple_id: TermId },
}

/// Knobs for one orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Bound on every confirmation wait; `None` waits indefinitely
    pub confirmation_timeout: Option<Duration>,
}

/// What a settlement run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Items that passed validation
    pub validated: usize,
    /// Redeems committed by the withdraw phase
    pub withdrawn_items: usize,
    /// Deposits committed, including genesis deposits made while creating
    pub deposited_items: usize,
    /// Claims created on the way
    pub created_claims: Vec<TermId>,
    /// New-claim items that found an existing claim
    pub redirected: Vec<TermId>,
    /// Batched redeem transaction
    pub withdraw_tx: Option<TxHash>,
    /// Batched deposit transaction
    pub deposit_tx: Option<TxHash>,
    /// Claim creation transactions
    pub creation_txs: Vec<TxHash>,
    /// Why the withdraw phase failed
    pub withdraw_error: Option<EngineError>,
    /// Why the deposit phase failed
    pub deposit_error: Option<EngineError>,
    /// Everything recorded during the run, in order
    pub events: Vec<EngineEvent>,
}

impl ExecutionResult {
    /// Returns true if funds were freed but not redeployed
    pub fn is_partial(&self) -> bool {
        self.withdrawn_items > 0 && self.deposit_error.is_some()
    }

    /// Every transaction this run committed, in submission order
    pub fn transactions(&self) -> Vec<TxHash> {
        self.withdraw_tx
            .iter()
            .chain(self.creation_txs.iter())
            .chain(self.deposit_tx.iter())
            .copied()
            .collect()
    }
}

/// A settlement run that ended in the error state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    /// Terminal error
    pub error: EngineError,
    /// What was committed before the failure
    pub partial: Box<ExecutionResult>,
}

impl ExecutionFailure {
    /// Stable code of the terminal error
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}

/// One entry of the batched deposit
struct PendingDeposit {
    index: usize,
    vault: VaultRef,
    amount: Amount,
    min_shares: Shares,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Settles vote carts against the ledger
pub struct SettlementOrchestrator {
    config: ProtocolConfig,
    chain: Arc<dyn ChainReader>,
    session: Arc<WalletSession>,
    resolver: Arc<ClaimResolver>,
    options: ExecutionOptions,
    status: RwLock<SettlementStatus>,
    progress_tx: broadcast::Sender<SettlementProgress>,
    events: Mutex<EventLog>,
}

impl SettlementOrchestrator {
    /// Create an orchestrator
    ///
    /// The resolver should share `session` so that every signing request
    /// goes through the same lock.
    pub fn new(
        config: ProtocolConfig,
        chain: Arc<dyn ChainReader>,
        session: Arc<WalletSession>,
        resolver: Arc<ClaimResolver>,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(64);
        Self {
            config,
            chain,
            session,
            resolver,
            options: ExecutionOptions::default(),
            status: RwLock::new(SettlementStatus::Idle),
            progress_tx,
            events: Mutex::new(EventLog::new()),
        }
    }

    /// Replace the execution options
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Subscribe to progress updates
    pub fn subscribe_progress(&self) -> broadcast::Receiver<SettlementProgress> {
        self.progress_tx.subscribe()
    }

    /// Current state
    pub async fn status(&self) -> SettlementStatus {
        *self.status.read().await
    }

    /// Take events recorded outside a cart run (direct withdrawals)
    pub fn take_events(&self) -> EventLog {
        std::mem::take(&mut *self.lock_events())
    }

    pub(crate) fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub(crate) fn chain(&self) -> &dyn ChainReader {
        self.chain.as_ref()
    }

    pub(crate) fn session(&self) -> &WalletSession {
        &self.session
    }

    pub(crate) fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        self.lock_events().emit(event);
    }

    pub(crate) fn publish(&self, progress: SettlementProgress) {
        // No subscribers is fine
        let _ = self.progress_tx.send(progress);
    }

    /// Pull the resolver's events into our log so the order is kept
    fn absorb_resolver_events(&self) {
        let resolved = self.resolver.take_events();
        self.lock_events().extend(resolved);
    }

    async fn set_status(&self, status: SettlementStatus) {
        *self.status.write().await = status;
        debug!(?status, "Settlement status changed");
        self.publish(SettlementProgress::Status(status));
    }

    // ============ Execution ============

    /// Settle a cart
    ///
    /// On success the cart is emptied. On failure it keeps only the work
    /// that was not committed, so calling `execute` again picks up where
    /// this run stopped.
    ///
    /// # Errors
    /// * `EMPTY_CART`, `WALLET_NOT_CONNECTED`, `BELOW_MINIMUM_DEPOSIT`,
    ///   `INSUFFICIENT_BALANCE`, `TRANSITION_BLOCKED` from validation
    /// * `WITHDRAW_FAILED` with zero deposits attempted
    /// * `DEPOSIT_FAILED` after the withdraw phase was committed
    /// * `USER_REJECTED` when the user declines either phase
    pub async fn execute(&self, cart: &mut VoteCart) -> Result<ExecutionResult, ExecutionFailure> {
        // Drop anything left over from direct withdrawals
        self.lock_events().clear();

        let mut result = ExecutionResult::default();
        let outcome = self.run(cart, &mut result).await;
        self.absorb_resolver_events();
        result.events = std::mem::take(&mut *self.lock_events()).into_events();

        match outcome {
            Ok(()) => {
                self.set_status(SettlementStatus::Success).await;
                info!(
                    withdrawn = result.withdrawn_items,
                    deposited = result.deposited_items,
                    created = result.created_claims.len(),
                    "Cart settled"
                );
                Ok(result)
            }
            Err(error) => {
                self.set_status(SettlementStatus::Error).await;
                error!(code = error.code(), error = %error, "Settlement failed");
                Err(ExecutionFailure {
                    error,
                    partial: Box::new(result),
                })
            }
        }
    }

    async fn run(&self, cart: &mut VoteCart, result: &mut ExecutionResult) -> EngineResult<()> {
        self.set_status(SettlementStatus::Validating).await;
        let account = self.validate(cart, result).await?;
        result.validated = cart.len();

        if cart.requires_withdraw() {
            self.set_status(SettlementStatus::Withdrawing).await;
            self.withdraw_phase(cart, account, result).await?;
        }

        self.set_status(SettlementStatus::Depositing).await;
        self.deposit_phase(cart, account, result).await?;

        cart.clear();
        Ok(())
    }

    // ============ Validating ============

    async fn validate(&self, cart: &mut VoteCart, result: &mut ExecutionResult) -> EngineResult<Address> {
        check!(!cart.is_empty(), EngineError::EmptyCart);
        let account = require_connected(self.session.address())?;

        for item in cart.items() {
            require_min_deposit(item.amount, self.config.min_deposit)?;
        }

        let mut required = cart.total_deposit()?;
        let mut pending_labels = BTreeSet::new();

        for index in 0..cart.len() {
            let item = &cart.items()[index];
            let ClaimTarget::New(claim) = &item.target else {
                continue;
            };
            let (claim, direction) = (claim.clone(), item.direction);

            match self.resolver.find_claim_by_refs(&claim).await {
                Ok(Some(existing)) => {
                    let triple_id = existing.triple.id;
                    debug!(claim = %triple_id, "Cart item targets an existing claim, voting instead");
                    cart.settle_target(index, existing.triple);
                    self.emit(EngineEvent::RedirectedToVote { triple_id });
                    self.publish(SettlementProgress::Redirected { triple_id });
                    result.redirected.push(triple_id);
                    continue;
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Claim lookup failed during validation, treating as new"),
            }

            require_genesis_direction(direction)?;
            required = safe_add(required, self.config.triple_creation_cost)?;
            for term in claim.terms() {
                if let TermRef::Pending(label) = term {
                    pending_labels.insert(label.clone());
                }
            }
        }

        for label in pending_labels {
            match self.resolver.lookup_ref(&TermRef::Pending(label)).await {
                Ok(Some(_)) => {}
                // Unknown or unreadable: budget for creating it
                Ok(None) | Err(_) => required = safe_add(required, self.config.atom_creation_cost)?,
            }
        }
        self.absorb_resolver_events();

        let balance = self.chain.balance(&account).await?;
        let recoverable = cart.total_recoverable().net_assets;
        require_sufficient_balance(balance.saturating_add(recoverable), required)?;

        debug!(items = cart.len(), required, balance, recoverable, "Cart validated");
        Ok(account)
    }

    // ============ Withdrawing ============

    async fn withdraw_phase(
        &self,
        cart: &mut VoteCart,
        account: Address,
        result: &mut ExecutionResult,
    ) -> EngineResult<()> {
        let targets = merge_redeems(cart.redeem_targets());

        let committed = match self.submit_redeems(account, targets).await {
            Ok(committed) => committed,
            Err(e) => {
                self.emit(EngineEvent::PhaseFailed { phase: Phase::Withdraw, code: e.code().to_string() });
                result.withdraw_error = Some(e.clone());
                return Err(phase_error(e, |cause| EngineError::WithdrawPhaseFailed { cause }));
            }
        };

        let (tx, items) = committed;
        result.withdraw_tx = Some(tx);
        result.withdrawn_items = items;
        cart.clear_settled_redeems();
        Ok(())
    }

    async fn submit_redeems(&self, account: Address, targets: Vec<RedeemTarget>) -> EngineResult<(TxHash, usize)> {
        let targets = self.clamp_to_redeemable(&account, targets).await?;
        let items = targets.len();
        let call = redeem_batch(account, &targets);

        self.emit(EngineEvent::PhaseStarted { phase: Phase::Withdraw, items: items as u32 });
        self.publish(SettlementProgress::Submitted { phase: Phase::Withdraw, items: items as u32 });

        let receipt = self.session.execute(call, self.options.confirmation_timeout).await?;

        info!(tx = %receipt.tx, items, "Withdraw phase committed");
        self.emit(EngineEvent::PhaseCommitted { phase: Phase::Withdraw, items: items as u32, tx: receipt.tx });
        self.publish(SettlementProgress::Confirmed { phase: Phase::Withdraw, tx: receipt.tx });
        Ok((receipt.tx, items))
    }

    // ============ Depositing ============

    async fn deposit_phase(
        &self,
        cart: &mut VoteCart,
        account: Address,
        result: &mut ExecutionResult,
    ) -> EngineResult<()> {
        let mut settled = Vec::new();
        let outcome = self.settle_deposits(cart, account, result, &mut settled).await;
        cart.remove_settled(&settled);

        outcome.map_err(|e| {
            self.emit(EngineEvent::PhaseFailed { phase: Phase::Deposit, code: e.code().to_string() });
            result.deposit_error = Some(e.clone());
            if result.withdrawn_items > 0 {
                warn!(
                    withdrawn = result.withdrawn_items,
                    "Withdrawals are committed but the freed funds were not redeployed"
                );
            }
            let withdrawn_items = result.withdrawn_items;
            phase_error(e, |cause| EngineError::DepositPhaseFailed { cause, withdrawn_items })
        })
    }

    /// Create new claims, then submit the batched deposit
    ///
    /// Every new claim goes into one atom call and one triple call ahead of
    /// the deposit batch. Indices of items whose deposit is committed are
    /// pushed to `settled` as soon as they are, so the caller can trim the
    /// cart on failure.
    async fn settle_deposits(
        &self,
        cart: &mut VoteCart,
        account: Address,
        result: &mut ExecutionResult,
        settled: &mut Vec<usize>,
    ) -> EngineResult<()> {
        let mut batch = Vec::with_capacity(cart.len());
        let mut requests = Vec::new();
        let mut new_items = Vec::new();

        for (index, item) in cart.items().iter().enumerate() {
            match &item.target {
                ClaimTarget::Existing(_) => batch.push(PendingDeposit {
                    index,
                    vault: item.deposit_vault(),
                    amount: item.amount,
                    min_shares: item.min_shares,
                }),
                ClaimTarget::New(claim) => {
                    // Only the genesis curve can take the deposit inside the creating call
                    let deposit = if item.curve == self.config.genesis_curve { item.amount } else { 0 };
                    requests.push(ClaimRequest::new(claim.clone(), item.direction, deposit));
                    new_items.push(index);
                }
            }
        }

        if !requests.is_empty() {
            let items = requests.len() as u32;
            self.publish(SettlementProgress::Submitted { phase: Phase::Creation, items });
            let creation = self.resolver.create_claims(&requests).await;
            self.absorb_resolver_events();
            let creation = creation?;

            result.creation_txs.extend(creation.txs.iter().copied());
            if let Some(tx) = creation.txs.last() {
                self.publish(SettlementProgress::Confirmed { phase: Phase::Creation, tx: *tx });
            }

            for ((index, request), outcome) in new_items.into_iter().zip(&requests).zip(creation.outcomes) {
                let item = cart.items()[index].clone();
                match outcome {
                    ClaimCreation::Created(created) => {
                        let triple = created.claim.triple;
                        if !result.created_claims.contains(&triple.id) {
                            result.created_claims.push(triple.id);
                        }
                        cart.settle_target(index, triple);

                        if request.deposit > 0 {
                            result.deposited_items += 1;
                            settled.push(index);
                        } else {
                            debug!(claim = %triple.id, curve = %item.curve, "Claim created, deposit moves to the batch");
                            batch.push(PendingDeposit {
                                index,
                                vault: VaultRef::new(triple.wing(item.direction), item.curve),
                                amount: item.amount,
                                min_shares: item.min_shares,
                            });
                        }
                    }
                    ClaimCreation::RedirectToVote(existing) => {
                        let triple_id = existing.triple.id;
                        result.redirected.push(triple_id);
                        self.publish(SettlementProgress::Redirected { triple_id });
                        cart.settle_target(index, existing.triple);
                        batch.push(PendingDeposit {
                            index,
                            vault: VaultRef::new(existing.wing(item.direction), item.curve),
                            amount: item.amount,
                            min_shares: item.min_shares,
                        });
                    }
                }
            }
            batch.sort_by_key(|deposit| deposit.index);
        }

        if batch.is_empty() {
            return Ok(());
        }

        // Withdrawals and creations changed the balance since validation
        let required = checked_sum(batch.iter().map(|deposit| deposit.amount))?;
        let balance = self.chain.balance(&account).await?;
        require_sufficient_balance(balance, required)?;

        let items = batch.len();
        let call = ContractCall::DepositBatch {
            receiver: account,
            term_ids: batch.iter().map(|d| d.vault.term_id).collect(),
            curve_ids: batch.iter().map(|d| d.vault.curve.id()).collect(),
            assets: batch.iter().map(|d| d.amount).collect(),
            min_shares: batch.iter().map(|d| d.min_shares).collect(),
        };

        self.emit(EngineEvent::PhaseStarted { phase: Phase::Deposit, items: items as u32 });
        self.publish(SettlementProgress::Submitted { phase: Phase::Deposit, items: items as u32 });

        let receipt = self.session.execute(call, self.options.confirmation_timeout).await?;

        info!(tx = %receipt.tx, items, assets = required, "Deposit phase committed");
        self.emit(EngineEvent::PhaseCommitted { phase: Phase::Deposit, items: items as u32, tx: receipt.tx });
        self.publish(SettlementProgress::Confirmed { phase: Phase::Deposit, tx: receipt.tx });

        result.deposit_tx = Some(receipt.tx);
        result.deposited_items += items;
        settled.extend(batch.iter().map(|deposit| deposit.index));
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Wrap a phase error, except for a user rejection which is reported as is
fn phase_error(error: EngineError, wrap: impl FnOnce(Box<EngineError>) -> EngineError) -> EngineError {
    match error {
        EngineError::UserRejectedSignature => error,
        other => wrap(Box::new(other)),
    }
}

//! Ledger Collaborators
//!
//! The engine reads from two sources and writes through one:
//!
//! ```text
//!   Indexer ──────► lookups (eventually consistent, may lag)
//!   ChainReader ──► simulation reads (authoritative)
//!   Wallet ───────► sign + submit + confirm (one request at a time)
//! ```
//!
//! Every collaborator is an object-safe async trait so callers can hold
//! them as `Arc<dyn ...>` and tests can swap in the in-memory ledger.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::math::checked_sum;
use crate::types::{
    Address, Amount, Atom, ClaimInfo, Curve, PositionEntry, Shares, StakeEvent, TermId, TxHash,
    VaultRef, VaultState,
};
use crate::validation::require_parallel;

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by a ledger collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Transport or indexer failure
    #[error("network error: {0}")]
    Network(String),
    /// User declined the signature request
    #[error("signature rejected")]
    Rejected,
    /// Transaction was included but reverted
    #[error("transaction reverted: {0}")]
    Reverted(String),
    /// A min-shares or min-assets floor was not met
    #[error("slippage floor not met: {0}")]
    SlippageExceeded(String),
    /// No wallet session
    #[error("wallet not connected")]
    NotConnected,
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Network(reason) => EngineError::LookupFailed { reason },
            LedgerError::Rejected => EngineError::UserRejectedSignature,
            LedgerError::Reverted(reason) => EngineError::Unknown {
                reason: format!("reverted: {}", reason),
            },
            LedgerError::SlippageExceeded(reason) => EngineError::SlippageExceeded { reason },
            LedgerError::NotConnected => EngineError::WalletNotConnected,
        }
    }
}

// ============================================================================
// Contract Calls
// ============================================================================

/// Discriminant of a [`ContractCall`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    CreateAtoms,
    CreateTriples,
    DepositBatch,
    RedeemBatch,
    Redeem,
}

/// A mutating call against the staking contract
///
/// Batched variants carry parallel argument arrays; item `i` of every array
/// describes the same item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractCall {
    /// Create atoms; `assets[i]` is the creation cost attached for `labels[i]`
    CreateAtoms { labels: Vec<String>, assets: Vec<Amount> },

    /// Create triples; `assets[i]` is the creation cost plus the genesis
    /// Support deposit
    CreateTriples {
        subjects: Vec<TermId>,
        predicates: Vec<TermId>,
        objects: Vec<TermId>,
        assets: Vec<Amount>,
    },

    /// Deposit into several vaults at once
    DepositBatch {
        receiver: Address,
        term_ids: Vec<TermId>,
        curve_ids: Vec<u32>,
        assets: Vec<Amount>,
        min_shares: Vec<Shares>,
    },

    /// Redeem from several vaults at once
    RedeemBatch {
        receiver: Address,
        term_ids: Vec<TermId>,
        curve_ids: Vec<u32>,
        shares: Vec<Shares>,
        min_assets: Vec<Amount>,
    },

    /// Redeem from one vault
    Redeem {
        receiver: Address,
        term_id: TermId,
        curve_id: u32,
        shares: Shares,
        min_assets: Amount,
    },
}

impl ContractCall {
    /// Call discriminant
    pub fn kind(&self) -> CallKind {
        match self {
            Self::CreateAtoms { .. } => CallKind::CreateAtoms,
            Self::CreateTriples { .. } => CallKind::CreateTriples,
            Self::DepositBatch { .. } => CallKind::DepositBatch,
            Self::RedeemBatch { .. } => CallKind::RedeemBatch,
            Self::Redeem { .. } => CallKind::Redeem,
        }
    }

    /// Contract function signature
    pub fn signature(&self) -> &'static str {
        match self {
            Self::CreateAtoms { .. } => "createAtoms(bytes[],uint256[])",
            Self::CreateTriples { .. } => "createTriples(bytes32[],bytes32[],bytes32[],uint256[])",
            Self::DepositBatch { .. } => "depositBatch(address,bytes32[],uint256[],uint256[],uint256[])",
            Self::RedeemBatch { .. } => "redeemBatch(address,bytes32[],uint256[],uint256[],uint256[])",
            Self::Redeem { .. } => "redeem(address,bytes32,uint256,uint256,uint256)",
        }
    }

    /// Number of items carried
    pub fn len(&self) -> usize {
        match self {
            Self::CreateAtoms { labels, .. } => labels.len(),
            Self::CreateTriples { subjects, .. } => subjects.len(),
            Self::DepositBatch { term_ids, .. } | Self::RedeemBatch { term_ids, .. } => term_ids.len(),
            Self::Redeem { .. } => 1,
        }
    }

    /// Returns true if the call carries no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value attached to the transaction
    ///
    /// Creating and deposit calls pay for their assets; redeems attach nothing.
    pub fn value(&self) -> EngineResult<Amount> {
        match self {
            Self::CreateAtoms { assets, .. }
            | Self::CreateTriples { assets, .. }
            | Self::DepositBatch { assets, .. } => checked_sum(assets.iter().copied()),
            Self::RedeemBatch { .. } | Self::Redeem { .. } => Ok(0),
        }
    }

    /// Checks the parallel arrays are consistent and non-empty
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Self::CreateAtoms { labels, assets } => {
                require_parallel(&[labels.len(), assets.len()])?;
            }
            Self::CreateTriples { subjects, predicates, objects, assets } => {
                require_parallel(&[subjects.len(), predicates.len(), objects.len(), assets.len()])?;
            }
            Self::DepositBatch { term_ids, curve_ids, assets, min_shares, .. } => {
                require_parallel(&[term_ids.len(), curve_ids.len(), assets.len(), min_shares.len()])?;
            }
            Self::RedeemBatch { term_ids, curve_ids, shares, min_assets, .. } => {
                require_parallel(&[term_ids.len(), curve_ids.len(), shares.len(), min_assets.len()])?;
            }
            Self::Redeem { .. } => {}
        }
        self.value().map(|_| ())
    }
}

/// Confirmed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    /// Transaction reference
    pub tx: TxHash,
    /// Inclusion height
    pub block_height: u64,
    /// Per item: shares minted for deposits and creations, net assets
    /// returned for redeems
    pub item_amounts: Vec<u128>,
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Read-only index over the ledger (may lag the chain)
#[async_trait::async_trait]
pub trait Indexer: Send + Sync {
    /// Atom with exactly this label
    async fn find_atom(&self, label: &str) -> Result<Option<Atom>, LedgerError>;

    /// Claim with exactly this (subject, predicate, object)
    async fn find_triple(
        &self,
        subject: &TermId,
        predicate: &TermId,
        object: &TermId,
    ) -> Result<Option<ClaimInfo>, LedgerError>;

    /// Position of an account in one vault
    async fn position(&self, account: &Address, vault: &VaultRef) -> Result<PositionEntry, LedgerError>;

    /// Raw stake history of an account
    async fn stake_events(&self, account: &Address) -> Result<Vec<StakeEvent>, LedgerError>;
}

/// Authoritative simulation reads against the contract
#[async_trait::async_trait]
pub trait ChainReader: Send + Sync {
    /// Returns true if the term exists on chain
    async fn term_exists(&self, term: &TermId) -> Result<bool, LedgerError>;

    /// Current vault totals
    async fn vault_state(&self, vault: &VaultRef) -> Result<VaultState, LedgerError>;

    /// Shares minted for `net_assets` deposited after fees
    async fn preview_deposit(&self, vault: &VaultRef, net_assets: Amount) -> Result<Shares, LedgerError>;

    /// Gross assets released by redeeming `shares`, before the exit fee
    async fn preview_redeem(&self, vault: &VaultRef, shares: Shares) -> Result<Amount, LedgerError>;

    /// Shares the account can redeem from the vault right now
    async fn max_redeem(&self, account: &Address, vault: &VaultRef) -> Result<Shares, LedgerError>;

    /// Spendable token balance of the account
    async fn balance(&self, account: &Address) -> Result<Amount, LedgerError>;
}

/// Signing and submission
#[async_trait::async_trait]
pub trait Wallet: Send + Sync {
    /// Connected account, `None` when disconnected
    fn address(&self) -> Option<Address>;

    /// Sign and submit a call; the user may reject
    async fn submit(&self, call: ContractCall) -> Result<TxHash, LedgerError>;

    /// Wait for inclusion; no built-in timeout
    async fn confirm(&self, tx: &TxHash) -> Result<TxReceipt, LedgerError>;
}

// ============================================================================
// Wallet Session
// ============================================================================

/// Serializes signing requests so at most one is outstanding
pub struct WalletSession {
    wallet: Arc<dyn Wallet>,
    outstanding: Mutex<()>,
}

impl WalletSession {
    /// Wrap a wallet
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        Self {
            wallet,
            outstanding: Mutex::new(()),
        }
    }

    /// Connected account
    pub fn address(&self) -> Option<Address> {
        self.wallet.address()
    }

    /// Submit a call and wait for its confirmation
    ///
    /// The session lock is held from signature to confirmation. With a
    /// `timeout` the confirmation wait fails with `CONFIRMATION_TIMEOUT`;
    /// without one it waits indefinitely.
    pub async fn execute(&self, call: ContractCall, timeout: Option<Duration>) -> EngineResult<TxReceipt> {
        call.validate()?;
        let _guard = self.outstanding.lock().await;

        let signature = call.signature();
        let items = call.len();
        info!(call = signature, items, "Submitting transaction");

        let tx = self.wallet.submit(call).await.map_err(|e| {
            warn!(call = signature, error = %e, "Submission failed");
            EngineError::from(e)
        })?;
        debug!(tx = %tx, "Awaiting confirmation");

        let receipt = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wallet.confirm(&tx))
                .await
                .map_err(|_| EngineError::ConfirmationTimedOut)?,
            None => self.wallet.confirm(&tx).await,
        }
        .map_err(|e| {
            warn!(tx = %tx, error = %e, "Transaction failed");
            EngineError::from(e)
        })?;

        info!(tx = %receipt.tx, block = receipt.block_height, "Transaction confirmed");
        Ok(receipt)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowWallet {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        confirm_delay: Duration,
    }

    impl SlowWallet {
        fn new(confirm_delay: Duration) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                confirm_delay,
            }
        }
    }

    #[async_trait::async_trait]
    impl Wallet for SlowWallet {
        fn address(&self) -> Option<Address> {
            Some([9u8; 20])
        }

        async fn submit(&self, _call: ContractCall) -> Result<TxHash, LedgerError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            Ok(TxHash([1u8; 32]))
        }

        async fn confirm(&self, tx: &TxHash) -> Result<TxReceipt, LedgerError> {
            tokio::time::sleep(self.confirm_delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(TxReceipt { tx: *tx, block_height: 1, item_amounts: vec![0] })
        }
    }

    fn redeem_call() -> ContractCall {
        ContractCall::Redeem {
            receiver: [9u8; 20],
            term_id: TermId::atom("wing"),
            curve_id: 1,
            shares: 10,
            min_assets: 0,
        }
    }

    #[test]
    fn test_call_value_and_validation() {
        let call = ContractCall::CreateTriples {
            subjects: vec![TermId::atom("a"), TermId::atom("d")],
            predicates: vec![TermId::atom("b"), TermId::atom("b")],
            objects: vec![TermId::atom("c"), TermId::atom("c")],
            assets: vec![100, 250],
        };
        assert_eq!(call.value(), Ok(350));
        assert_eq!(call.len(), 2);
        assert!(call.validate().is_ok());
        assert_eq!(call.kind(), CallKind::CreateTriples);

        let redeem = ContractCall::RedeemBatch {
            receiver: [0u8; 20],
            term_ids: vec![TermId::atom("w")],
            curve_ids: vec![1],
            shares: vec![10],
            min_assets: vec![],
        };
        assert_eq!(redeem.value(), Ok(0));
        assert!(redeem.validate().is_err());
    }

    #[test]
    fn test_ledger_error_conversion() {
        assert_eq!(EngineError::from(LedgerError::Rejected).code(), "USER_REJECTED");
        assert_eq!(EngineError::from(LedgerError::NotConnected).code(), "WALLET_NOT_CONNECTED");
        let network = EngineError::from(LedgerError::Network("timeout".into()));
        assert_eq!(network.code(), "LOOKUP_FAILED");
        assert!(network.is_retryable());
    }

    #[tokio::test]
    async fn test_session_serializes_requests() {
        let wallet = Arc::new(SlowWallet::new(Duration::from_millis(20)));
        let session = Arc::new(WalletSession::new(wallet.clone()));

        let a = {
            let session = session.clone();
            tokio::spawn(async move { session.execute(redeem_call(), None).await })
        };
        let b = {
            let session = session.clone();
            tokio::spawn(async move { session.execute(redeem_call(), None).await })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(wallet.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_confirmation_timeout() {
        let wallet = Arc::new(SlowWallet::new(Duration::from_millis(200)));
        let session = WalletSession::new(wallet);

        let err = session
            .execute(redeem_call(), Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::ConfirmationTimedOut);
    }
}

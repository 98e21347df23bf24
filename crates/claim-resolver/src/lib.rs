//! Identity/Claim Resolver
//!
//! Looks up atoms and claims before writing anything. Every creating call
//! is preceded by a lookup against the indexer and, because the indexer may
//! lag, an authoritative existence check against the chain.
//!
//! ## Dedupe-before-write
//!
//! ```text
//! label ──► indexer.find_atom ──► chain.term_exists ──► createAtoms
//!              │ found                │ exists
//!              ▼                      ▼
//!           reuse id              reuse id
//! ```
//!
//! Claim creation follows the same discipline. Hitting an existing claim
//! fails with `ClaimExists`, which [`ClaimResolver::create_or_redirect`]
//! turns into a redirect to vote on it. [`ClaimResolver::create_claims`]
//! creates many claims with one atom call and one triple call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use totem_common::{
    check,
    config::ProtocolConfig,
    errors::{EngineError, EngineResult},
    events::{EngineEvent, EventLog, Phase},
    ledger::{ChainReader, ContractCall, Indexer, WalletSession},
    math::safe_add,
    types::{Amount, ClaimInfo, Curve, Direction, NewClaim, Shares, TermId, TermRef, Triple, TxHash, VaultRef},
    validation::{require_genesis_direction, require_min_deposit},
};

pub mod tagging;

pub use tagging::TaggedClaim;

// ============ Results ============

/// Outcome of resolving an atom label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomResolution {
    /// Atom id
    pub id: TermId,
    /// True if this call created the atom
    pub created: bool,
}

/// A claim created by this resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedClaim {
    /// The claim as read back from the chain
    pub claim: ClaimInfo,
    /// Creating transaction
    pub tx: TxHash,
    /// Atoms created on the way
    pub created_atoms: Vec<TermId>,
    /// Shares minted by the genesis deposit
    pub genesis_shares: Shares,
}

/// Outcome of [`ClaimResolver::create_or_redirect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimCreation {
    /// The claim did not exist and was created
    Created(CreatedClaim),
    /// The claim already exists; stake on it instead
    RedirectToVote(ClaimInfo),
}

impl ClaimCreation {
    /// The claim, whichever way it was reached
    pub fn claim(&self) -> &ClaimInfo {
        match self {
            ClaimCreation::Created(created) => &created.claim,
            ClaimCreation::RedirectToVote(claim) => claim,
        }
    }

    /// Returns true if the claim already existed
    pub fn is_redirect(&self) -> bool {
        matches!(self, ClaimCreation::RedirectToVote(_))
    }
}

/// One claim to create as part of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// Claim descriptor
    pub claim: NewClaim,
    /// Requested direction; only Support can open a claim
    pub direction: Direction,
    /// Genesis deposit on the genesis curve; zero pays only the creation cost
    pub deposit: Amount,
}

impl ClaimRequest {
    pub fn new(claim: NewClaim, direction: Direction, deposit: Amount) -> Self {
        Self { claim, direction, deposit }
    }
}

/// Outcome of [`ClaimResolver::create_claims`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCreation {
    /// One outcome per request, in request order
    pub outcomes: Vec<ClaimCreation>,
    /// Atom and triple creation transactions, in submission order
    pub txs: Vec<TxHash>,
}

fn single(batch: BatchCreation) -> EngineResult<ClaimCreation> {
    batch.outcomes.into_iter().next().ok_or(EngineError::Unknown {
        reason: "claim batch returned no outcome".to_string(),
    })
}

// ============ Resolver ============

/// Resolves and creates atoms and claims against the shared ledger
pub struct ClaimResolver {
    config: ProtocolConfig,
    indexer: Arc<dyn Indexer>,
    chain: Arc<dyn ChainReader>,
    session: Arc<WalletSession>,
    confirmation_timeout: Option<Duration>,
    events: Mutex<EventLog>,
}

impl ClaimResolver {
    /// Create a resolver over the given collaborators
    pub fn new(
        config: ProtocolConfig,
        indexer: Arc<dyn Indexer>,
        chain: Arc<dyn ChainReader>,
        session: Arc<WalletSession>,
    ) -> Self {
        Self {
            config,
            indexer,
            chain,
            session,
            confirmation_timeout: None,
            events: Mutex::new(EventLog::new()),
        }
    }

    /// Bound every confirmation wait
    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = Some(timeout);
        self
    }

    /// Protocol configuration in use
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Take every event recorded so far
    pub fn take_events(&self) -> EventLog {
        std::mem::take(&mut *self.lock_events())
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: EngineEvent) {
        self.lock_events().emit(event);
    }

    // ============ Atoms ============

    /// Return the atom with this label, creating it if nobody has
    ///
    /// Repeated calls with the same label issue at most one creating call.
    pub async fn resolve_or_create_atom(&self, label: &str) -> EngineResult<AtomResolution> {
        if label.trim().is_empty() {
            return Err(EngineError::InvalidInput {
                param: "label",
                reason: "Atom label cannot be empty",
            });
        }

        if let Some(id) = self.lookup_atom(label).await? {
            debug!(atom = %id, label, "Reusing existing atom");
            self.emit(EngineEvent::AtomReused { atom_id: id, label: label.to_string() });
            return Ok(AtomResolution { id, created: false });
        }

        let receipt = self
            .session
            .execute(
                ContractCall::CreateAtoms {
                    labels: vec![label.to_string()],
                    assets: vec![self.config.atom_creation_cost],
                },
                self.confirmation_timeout,
            )
            .await?;

        let id = TermId::atom(label);
        info!(atom = %id, label, tx = %receipt.tx, "Atom created");
        self.emit(EngineEvent::AtomCreated { atom_id: id, label: label.to_string(), tx: receipt.tx });
        Ok(AtomResolution { id, created: true })
    }

    /// Resolve a reference, creating the atom if it is still pending
    pub async fn resolve_ref(&self, term: &TermRef) -> EngineResult<AtomResolution> {
        match term {
            TermRef::Resolved(id) => Ok(AtomResolution { id: *id, created: false }),
            TermRef::Pending(label) => self.resolve_or_create_atom(label).await,
        }
    }

    /// Resolve a reference without writing; `None` if the atom does not exist
    pub async fn lookup_ref(&self, term: &TermRef) -> EngineResult<Option<TermId>> {
        match term {
            TermRef::Resolved(id) => Ok(Some(*id)),
            TermRef::Pending(label) => self.lookup_atom(label).await,
        }
    }

    async fn lookup_atom(&self, label: &str) -> EngineResult<Option<TermId>> {
        match self.indexer.find_atom(label).await {
            Ok(Some(atom)) => return Ok(Some(atom.id)),
            Ok(None) => {}
            Err(e) => debug!(label, error = %e, "Indexer lookup failed, asking chain"),
        }

        let id = TermId::atom(label);
        if self.chain.term_exists(&id).await? {
            debug!(atom = %id, "Atom exists on chain but not in index");
            return Ok(Some(id));
        }
        Ok(None)
    }

    // ============ Claims ============

    /// Exact-match claim lookup
    ///
    /// Falls back to the chain when the indexer has not seen the claim yet.
    pub async fn find_claim(
        &self,
        subject: &TermId,
        predicate: &TermId,
        object: &TermId,
    ) -> EngineResult<Option<ClaimInfo>> {
        match self.indexer.find_triple(subject, predicate, object).await {
            Ok(Some(claim)) => return Ok(Some(claim)),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Indexer claim lookup failed, asking chain"),
        }

        let triple = Triple::new(*subject, *predicate, *object);
        if !self.chain.term_exists(&triple.id).await? {
            return Ok(None);
        }
        debug!(claim = %triple.id, "Claim exists on chain but not in index");
        self.read_claim(triple).await.map(Some)
    }

    /// Claim with wing totals read from the chain
    async fn read_claim(&self, triple: Triple) -> EngineResult<ClaimInfo> {
        let mut claim = ClaimInfo::new(triple);
        let counter = triple.id.counter();
        for curve in Curve::ALL {
            *claim.support.get_mut(curve) = self.chain.vault_state(&VaultRef::new(triple.id, curve)).await?;
            let oppose = self.chain.vault_state(&VaultRef::new(counter, curve)).await?;
            if !oppose.is_empty() {
                claim.oppose_wing = Some(counter);
            }
            *claim.oppose.get_mut(curve) = oppose;
        }
        Ok(claim)
    }

    /// Find a claim given possibly unresolved references, without writing
    pub async fn find_claim_by_refs(&self, claim: &NewClaim) -> EngineResult<Option<ClaimInfo>> {
        let subject = self.lookup_ref(&claim.subject).await?;
        let predicate = self.lookup_ref(&claim.predicate).await?;
        let object = self.lookup_ref(&claim.object).await?;

        match (subject, predicate, object) {
            (Some(s), Some(p), Some(o)) => self.find_claim(&s, &p, &o).await,
            // A claim cannot exist over an atom that does not
            _ => Ok(None),
        }
    }

    /// Create a claim with a Support deposit
    ///
    /// # Errors
    /// * `ClaimExists` carrying the existing wings if the claim is already on
    ///   the ledger, whatever the deposit; no creating call is made
    /// * `BelowMinimumDeposit` for a positive deposit under the minimum
    pub async fn create_claim(&self, claim: &NewClaim, deposit: Amount) -> EngineResult<CreatedClaim> {
        let request = ClaimRequest::new(claim.clone(), Direction::Support, deposit);
        match single(self.create_batch(std::slice::from_ref(&request)).await?)? {
            ClaimCreation::Created(created) => Ok(created),
            ClaimCreation::RedirectToVote(existing) => {
                debug!(claim = %existing.triple.id, "Claim already exists");
                Err(EngineError::ClaimExists { claim: Box::new(existing) })
            }
        }
    }

    /// Create a claim, or point at the existing one when it is already there
    ///
    /// An Oppose request for a claim that does not exist is rejected before
    /// any atom or triple is written.
    pub async fn create_or_redirect(
        &self,
        claim: &NewClaim,
        direction: Direction,
        deposit: Amount,
    ) -> EngineResult<ClaimCreation> {
        let request = ClaimRequest::new(claim.clone(), direction, deposit);
        single(self.create_claims(std::slice::from_ref(&request)).await?)
    }

    /// Create several claims with one atom call and one triple call
    ///
    /// Every request is checked before anything is written. Requests whose
    /// claim already exists come back as `RedirectToVote`. Missing atoms are
    /// created in a single `CreateAtoms` call, then every new triple with
    /// its genesis deposit in a single `CreateTriples` call.
    pub async fn create_claims(&self, requests: &[ClaimRequest]) -> EngineResult<BatchCreation> {
        let batch = self.create_batch(requests).await?;
        for outcome in &batch.outcomes {
            if let ClaimCreation::RedirectToVote(existing) = outcome {
                debug!(claim = %existing.triple.id, "Claim exists, redirecting to vote");
                self.emit(EngineEvent::RedirectedToVote { triple_id: existing.triple.id });
            }
        }
        Ok(batch)
    }

    async fn create_batch(&self, requests: &[ClaimRequest]) -> EngineResult<BatchCreation> {
        for request in requests {
            for term in request.claim.terms() {
                if let TermRef::Pending(label) = term {
                    check!(
                        !label.trim().is_empty(),
                        EngineError::InvalidInput { param: "label", reason: "Atom label cannot be empty" }
                    );
                }
            }
        }

        // Existence first: an existing claim redirects whatever the amount
        let mut existing = Vec::with_capacity(requests.len());
        for request in requests {
            let found = self.find_claim_by_refs(&request.claim).await?;
            if found.is_none() {
                require_genesis_direction(request.direction)?;
                if request.deposit > 0 {
                    require_min_deposit(request.deposit, self.config.min_deposit)?;
                }
            }
            existing.push(found);
        }

        // Unique triples in request order, each with the deposits aimed at it
        let mut triples: Vec<(Triple, Amount)> = Vec::new();
        let mut slots = Vec::with_capacity(requests.len());
        for (request, found) in requests.iter().zip(&existing) {
            if found.is_some() {
                slots.push(None);
                continue;
            }
            let triple = request.claim.derived_triple();
            match triples.iter().position(|(t, _)| t.id == triple.id) {
                Some(slot) => {
                    triples[slot].1 = safe_add(triples[slot].1, request.deposit)?;
                    slots.push(Some(slot));
                }
                None => {
                    triples.push((triple, request.deposit));
                    slots.push(Some(triples.len() - 1));
                }
            }
        }

        if triples.is_empty() {
            return Ok(BatchCreation {
                outcomes: existing.into_iter().flatten().map(ClaimCreation::RedirectToVote).collect(),
                txs: Vec::new(),
            });
        }

        let mut labels: Vec<&str> = Vec::new();
        for (request, slot) in requests.iter().zip(&slots) {
            if slot.is_none() {
                continue;
            }
            for term in request.claim.terms() {
                if let TermRef::Pending(label) = term {
                    if !labels.contains(&label.as_str()) {
                        labels.push(label);
                    }
                }
            }
        }

        let mut missing = Vec::new();
        for label in labels {
            match self.lookup_atom(label).await? {
                Some(id) => {
                    debug!(atom = %id, label, "Reusing existing atom");
                    self.emit(EngineEvent::AtomReused { atom_id: id, label: label.to_string() });
                }
                None => missing.push(label.to_string()),
            }
        }

        let items = triples.len() as u32;
        self.emit(EngineEvent::PhaseStarted { phase: Phase::Creation, items });
        let mut txs = Vec::with_capacity(2);
        let (tx, minted) = match self.submit_creation(&missing, &triples, &mut txs).await {
            Ok(committed) => committed,
            Err(e) => {
                self.emit(EngineEvent::PhaseFailed { phase: Phase::Creation, code: e.code().to_string() });
                return Err(e);
            }
        };

        let mut claims = Vec::with_capacity(triples.len());
        for (triple, _) in &triples {
            claims.push(self.read_claim(*triple).await?);
        }

        let created_atoms: Vec<TermId> = missing.iter().map(|label| TermId::atom(label)).collect();
        let mut outcomes = Vec::with_capacity(requests.len());
        for ((request, found), slot) in requests.iter().zip(existing).zip(slots) {
            if let Some(existing) = found {
                outcomes.push(ClaimCreation::RedirectToVote(existing));
                continue;
            }
            let Some(slot) = slot else { continue };
            let triple = triples[slot].0;
            outcomes.push(ClaimCreation::Created(CreatedClaim {
                claim: claims[slot].clone(),
                tx,
                created_atoms: [triple.subject, triple.predicate, triple.object]
                    .into_iter()
                    .filter(|id| created_atoms.contains(id))
                    .collect(),
                // Shares go to the request that carried the deposit
                genesis_shares: if request.deposit > 0 {
                    minted.get(slot).copied().unwrap_or_default()
                } else {
                    0
                },
            }));
        }

        Ok(BatchCreation { outcomes, txs })
    }

    /// Submit the atom call (if any atom is missing) and the triple call
    ///
    /// # Returns
    /// The triple transaction and the shares minted per triple by its
    /// genesis deposit
    async fn submit_creation(
        &self,
        labels: &[String],
        triples: &[(Triple, Amount)],
        txs: &mut Vec<TxHash>,
    ) -> EngineResult<(TxHash, Vec<Shares>)> {
        if !labels.is_empty() {
            let receipt = self
                .session
                .execute(
                    ContractCall::CreateAtoms {
                        labels: labels.to_vec(),
                        assets: vec![self.config.atom_creation_cost; labels.len()],
                    },
                    self.confirmation_timeout,
                )
                .await?;
            txs.push(receipt.tx);

            for label in labels {
                let id = TermId::atom(label);
                info!(atom = %id, label = %label, tx = %receipt.tx, "Atom created");
                self.emit(EngineEvent::AtomCreated { atom_id: id, label: label.clone(), tx: receipt.tx });
            }
        }

        let assets = triples
            .iter()
            .map(|(_, deposit)| safe_add(self.config.triple_creation_cost, *deposit))
            .collect::<EngineResult<Vec<_>>>()?;
        let receipt = self
            .session
            .execute(
                ContractCall::CreateTriples {
                    subjects: triples.iter().map(|(t, _)| t.subject).collect(),
                    predicates: triples.iter().map(|(t, _)| t.predicate).collect(),
                    objects: triples.iter().map(|(t, _)| t.object).collect(),
                    assets,
                },
                self.confirmation_timeout,
            )
            .await?;
        txs.push(receipt.tx);

        let curve = self.config.genesis_curve;
        for (triple, deposit) in triples {
            info!(claim = %triple.id, curve = %curve, deposit, tx = %receipt.tx, "Claim created");
            self.emit(EngineEvent::ClaimCreated { triple_id: triple.id, curve, deposit: *deposit, tx: receipt.tx });
        }
        self.emit(EngineEvent::PhaseCommitted {
            phase: Phase::Creation,
            items: triples.len() as u32,
            tx: receipt.tx,
        });
        Ok((receipt.tx, receipt.item_amounts))
    }

    /// Find or create a triple without a deposit; returns its id and whether
    /// it was created
    pub(crate) async fn ensure_triple(&self, subject: TermId, predicate: TermId, object: TermId) -> EngineResult<(TermId, bool)> {
        if let Some(existing) = self.find_claim(&subject, &predicate, &object).await? {
            return Ok((existing.triple.id, false));
        }

        let receipt = self
            .session
            .execute(
                ContractCall::CreateTriples {
                    subjects: vec![subject],
                    predicates: vec![predicate],
                    objects: vec![object],
                    assets: vec![self.config.triple_creation_cost],
                },
                self.confirmation_timeout,
            )
            .await?;

        let id = TermId::triple(&subject, &predicate, &object);
        self.emit(EngineEvent::ClaimCreated {
            triple_id: id,
            curve: self.config.genesis_curve,
            deposit: 0,
            tx: receipt.tx,
        });
        Ok((id, true))
    }
}

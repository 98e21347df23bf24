//! Engine Events for totem claim staking
//!
//! Events are recorded while resolving claims and settling carts so that
//! callers can audit what the engine did, independent of log output.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::types::{Amount, Curve, Shares, TermId, TxHash};

/// Event types for indexing and filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
#[borsh(use_discriminant = true)]
#[repr(u8)]
pub enum EventType {
    // Resolver Events (0x01 - 0x1F)
    AtomCreated = 0x01,
    AtomReused = 0x02,
    ClaimCreated = 0x03,
    RedirectedToVote = 0x04,
    TaggingFailed = 0x05,

    // Settlement Events (0x20 - 0x3F)
    PhaseStarted = 0x20,
    PhaseCommitted = 0x21,
    PhaseFailed = 0x22,
    RedeemDowngraded = 0x23,
}

/// Settlement phase an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum Phase {
    /// Claim creation ahead of the deposit batch
    Creation,
    /// Batched redeem
    Withdraw,
    /// Batched deposit
    Deposit,
}

/// Main event enum containing every recorded engine event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum EngineEvent {
    // ============ Resolver Events ============

    /// A creating call produced a new atom
    AtomCreated {
        atom_id: TermId,
        label: String,
        tx: TxHash,
    },

    /// Lookup found an existing atom; nothing was written
    AtomReused { atom_id: TermId, label: String },

    /// A creating call produced a new claim with its genesis deposit
    ClaimCreated {
        triple_id: TermId,
        curve: Curve,
        deposit: Amount,
        tx: TxHash,
    },

    /// Creation hit an existing claim and became a vote
    RedirectedToVote { triple_id: TermId },

    /// Best-effort category tagging did not complete
    TaggingFailed { object_id: TermId, code: String },

    // ============ Settlement Events ============

    /// A settlement phase is about to submit its call
    PhaseStarted { phase: Phase, items: u32 },

    /// A settlement phase was confirmed on chain
    PhaseCommitted { phase: Phase, items: u32, tx: TxHash },

    /// A settlement phase failed; later phases were not attempted
    PhaseFailed { phase: Phase, code: String },

    /// A redeem request was lowered to the vault's redeemable maximum
    RedeemDowngraded {
        term_id: TermId,
        curve: Curve,
        requested: Shares,
        available: Shares,
    },
}

impl EngineEvent {
    /// Get the event type for filtering
    pub fn event_type(&self) -> EventType {
        match self {
            Self::AtomCreated { .. } => EventType::AtomCreated,
            Self::AtomReused { .. } => EventType::AtomReused,
            Self::ClaimCreated { .. } => EventType::ClaimCreated,
            Self::RedirectedToVote { .. } => EventType::RedirectedToVote,
            Self::TaggingFailed { .. } => EventType::TaggingFailed,
            Self::PhaseStarted { .. } => EventType::PhaseStarted,
            Self::PhaseCommitted { .. } => EventType::PhaseCommitted,
            Self::PhaseFailed { .. } => EventType::PhaseFailed,
            Self::RedeemDowngraded { .. } => EventType::RedeemDowngraded,
        }
    }

    /// Transaction the event refers to, if any
    pub fn tx(&self) -> Option<TxHash> {
        match self {
            Self::AtomCreated { tx, .. }
            | Self::ClaimCreated { tx, .. }
            | Self::PhaseCommitted { tx, .. } => Some(*tx),
            _ => None,
        }
    }

    /// Serialize event to bytes for storage/transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).unwrap_or_default()
    }

    /// Deserialize event from bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        borsh::from_slice(bytes).ok()
    }
}

/// Event log for collecting multiple events during execution
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<EngineEvent>,
}

impl EventLog {
    /// Create a new empty event log
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Emit an event (add to log)
    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Get all events
    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    /// Take ownership of all events
    pub fn into_events(self) -> Vec<EngineEvent> {
        self.events
    }

    /// Append every event of another log
    pub fn extend(&mut self, other: EventLog) {
        self.events.extend(other.events);
    }

    /// Filter events by type
    pub fn filter_by_type(&self, event_type: EventType) -> Vec<&EngineEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }

    /// Number of events of one type
    pub fn count(&self, event_type: EventType) -> usize {
        self.events.iter().filter(|e| e.event_type() == event_type).count()
    }

    /// Check if any events were emitted
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Get number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if nothing was emitted
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Clear all events
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type() {
        let event = EngineEvent::ClaimCreated {
            triple_id: TermId::atom("claim"),
            curve: Curve::Stable,
            deposit: 1_000,
            tx: TxHash([7u8; 32]),
        };

        assert_eq!(event.event_type(), EventType::ClaimCreated);
        assert_eq!(event.tx(), Some(TxHash([7u8; 32])));
    }

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::RedeemDowngraded {
            term_id: TermId::atom("wing"),
            curve: Curve::Conviction,
            requested: 500,
            available: 400,
        };

        let bytes = event.to_bytes();
        assert!(!bytes.is_empty());
        assert_eq!(EngineEvent::from_bytes(&bytes), Some(event));
        assert_eq!(EngineEvent::from_bytes(&[0xFF]), None);
    }

    #[test]
    fn test_event_log() {
        let mut log = EventLog::new();
        assert!(!log.has_events());

        log.emit(EngineEvent::AtomReused { atom_id: TermId::atom("wolf"), label: "wolf".into() });
        log.emit(EngineEvent::PhaseStarted { phase: Phase::Deposit, items: 2 });
        log.emit(EngineEvent::AtomReused { atom_id: TermId::atom("has totem"), label: "has totem".into() });

        assert_eq!(log.len(), 3);
        assert_eq!(log.filter_by_type(EventType::AtomReused).len(), 2);
        assert_eq!(log.count(EventType::PhaseStarted), 1);
        assert_eq!(log.count(EventType::PhaseFailed), 0);

        log.clear();
        assert!(log.is_empty());
    }
}

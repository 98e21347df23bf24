//! Best-effort category tagging
//!
//! After a claim is created its object can be classified with two auxiliary
//! triples:
//!
//! ```text
//! (object, "has category", category)
//! (category, "tagged with", "totem category")
//! ```
//!
//! Tagging runs after the primary claim is committed. A failure is logged
//! and recorded but never undoes or fails the primary claim, and it is not
//! retried.

use tracing::{info, warn};

use totem_common::{
    constants::tagging::{HAS_CATEGORY, SYSTEM_TAG, TAGGED_WITH},
    errors::{EngineError, EngineResult},
    events::EngineEvent,
    types::{Amount, NewClaim, TermId},
};

use crate::{ClaimResolver, CreatedClaim};

/// A created claim plus the outcome of its category tagging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedClaim {
    /// The primary claim
    pub created: CreatedClaim,
    /// Auxiliary triple ids, existing or created, in tagging order
    pub tags: Vec<TermId>,
    /// Why tagging stopped early, if it did
    pub tagging_error: Option<EngineError>,
}

impl TaggedClaim {
    /// Returns true if both auxiliary triples are in place
    pub fn fully_tagged(&self) -> bool {
        self.tagging_error.is_none() && self.tags.len() == 2
    }
}

impl ClaimResolver {
    /// Create a claim, then attach its object to `category`
    ///
    /// Errors from the primary creation propagate (including `ClaimExists`).
    /// Errors from tagging are reported in [`TaggedClaim::tagging_error`].
    pub async fn create_claim_with_category_tagging(
        &self,
        claim: &NewClaim,
        deposit: Amount,
        category: &str,
    ) -> EngineResult<TaggedClaim> {
        let created = self.create_claim(claim, deposit).await?;
        let object = created.claim.triple.object;

        let mut tags = Vec::with_capacity(2);
        let tagging_error = match self.tag_object(object, category, &mut tags).await {
            Ok(()) => None,
            Err(e) => {
                warn!(object = %object, category, error = %e, "Category tagging failed");
                self.emit(EngineEvent::TaggingFailed { object_id: object, code: e.code().to_string() });
                Some(e)
            }
        };

        Ok(TaggedClaim { created, tags, tagging_error })
    }

    async fn tag_object(&self, object: TermId, category: &str, tags: &mut Vec<TermId>) -> EngineResult<()> {
        let category_id = self.resolve_or_create_atom(category).await?.id;
        let has_category = self.resolve_or_create_atom(HAS_CATEGORY).await?.id;
        let (first, created) = self.ensure_triple(object, has_category, category_id).await?;
        tags.push(first);
        if created {
            info!(triple = %first, category, "Object tagged with category");
        }

        let tagged_with = self.resolve_or_create_atom(TAGGED_WITH).await?.id;
        let system_tag = self.resolve_or_create_atom(SYSTEM_TAG).await?.id;
        let (second, _) = self.ensure_triple(category_id, tagged_with, system_tag).await?;
        tags.push(second);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use totem_common::config::ProtocolConfig;
    use totem_common::constants::token::ONE;
    use totem_common::events::EventType;
    use totem_common::ledger::{CallKind, WalletSession};
    use totem_common::testkit::{InMemoryLedger, DEFAULT_ACCOUNT};
    use totem_common::types::TermRef;

    fn setup() -> (InMemoryLedger, ClaimResolver) {
        let config = ProtocolConfig::default();
        let ledger = InMemoryLedger::new(config.clone());
        ledger.fund(DEFAULT_ACCOUNT, 100 * ONE);
        let session = Arc::new(WalletSession::new(Arc::new(ledger.clone())));
        let resolver = ClaimResolver::new(config, Arc::new(ledger.clone()), Arc::new(ledger.clone()), session);
        (ledger, resolver)
    }

    fn claim() -> NewClaim {
        NewClaim::new(TermRef::label("me"), TermRef::label("has totem"), TermRef::label("wolf"))
    }

    #[tokio::test]
    async fn test_tagging_creates_both_triples() {
        let (ledger, resolver) = setup();

        let tagged = resolver.create_claim_with_category_tagging(&claim(), ONE, "animal").await.unwrap();

        assert!(tagged.fully_tagged());
        assert_eq!(tagged.tags[0], TermId::triple(&TermId::atom("wolf"), &TermId::atom(HAS_CATEGORY), &TermId::atom("animal")));
        assert_eq!(ledger.triple_count(), 3);
    }

    #[tokio::test]
    async fn test_tagging_reuses_existing_triples() {
        let (ledger, resolver) = setup();
        ledger.seed_claim("wolf", HAS_CATEGORY, "animal");
        ledger.seed_claim("animal", TAGGED_WITH, SYSTEM_TAG);

        let tagged = resolver.create_claim_with_category_tagging(&claim(), ONE, "animal").await.unwrap();

        assert!(tagged.fully_tagged());
        // Only the primary claim was written
        assert_eq!(ledger.call_count(CallKind::CreateTriples), 1);
    }

    #[tokio::test]
    async fn test_tagging_failure_keeps_primary_claim() {
        let (ledger, resolver) = setup();
        // Primary atoms exist, so the first atom creation is the category's
        ledger.seed_atom("me");
        ledger.seed_atom("has totem");
        ledger.seed_atom("wolf");
        ledger.revert_next(CallKind::CreateAtoms);

        let tagged = resolver.create_claim_with_category_tagging(&claim(), ONE, "animal").await.unwrap();

        assert!(!tagged.fully_tagged());
        assert!(tagged.tags.is_empty());
        assert!(tagged.tagging_error.is_some());
        assert!(tagged.created.claim.support.stable.total_shares > 0);
        assert_eq!(ledger.triple_count(), 1);
        assert_eq!(resolver.take_events().count(EventType::TaggingFailed), 1);
    }

    #[tokio::test]
    async fn test_primary_failure_propagates() {
        let (ledger, resolver) = setup();
        ledger.seed_claim("me", "has totem", "wolf");

        let err = resolver.create_claim_with_category_tagging(&claim(), ONE, "animal").await.unwrap_err();
        assert_eq!(err.code(), "CLAIM_EXISTS");
        assert!(ledger.calls().is_empty());
    }
}

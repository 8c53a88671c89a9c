//! Stage 5: predicate governance.
//!
//! Free-text predicate surfaces never reach the graph. A surface is mapped
//! through the configured `surface → canonical` table first; unmatched
//! surfaces fall through to an embedding synonym lookup against the
//! whitelist; anything still unresolved is OTHER and the triple goes to
//! the review queue instead of the store. Mapped triples are then checked
//! against the ontology's `(subject_type, object_type)` constraints;
//! a surface can map and still be rejected.
//!
//! The governor never writes; it returns decisions Stage 6 consumes.
//! Feedback extends the tables through [`GovernorState`], copy-on-write,
//! so changes take effect on the next ingestion, never mid-build.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::GovernorConfig;
use crate::context::PipelineContext;
use crate::model::{ConceptTriple, EntityLink, Predicate, ProposedTriple};
use crate::text::cosine_similarity;
use crate::types::LoomError;

/// The mutable-across-builds tables: whitelist and surface map.
#[derive(Debug, Clone)]
pub struct GovernorTables {
    pub whitelist: BTreeSet<String>,
    pub surface_map: BTreeMap<String, String>,
    pub synonym_threshold: f32,
}

/// Shared handle; ingestions snapshot it once, feedback swaps in updates.
#[derive(Debug, Clone)]
pub struct GovernorState {
    inner: Arc<RwLock<Arc<GovernorTables>>>,
}

impl GovernorState {
    pub fn from_config(config: &GovernorConfig) -> Self {
        let tables = GovernorTables {
            whitelist: config.whitelist.iter().cloned().collect(),
            surface_map: config.surface_map.clone(),
            synonym_threshold: config.synonym_threshold,
        };
        GovernorState {
            inner: Arc::new(RwLock::new(Arc::new(tables))),
        }
    }

    pub fn snapshot(&self) -> Arc<GovernorTables> {
        self.inner.read().clone()
    }

    /// Feedback (a): add a surface→canonical row.
    pub fn add_surface(&self, surface: impl Into<String>, canonical: &Predicate) {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        next.surface_map
            .insert(surface.into(), canonical.as_str().to_string());
        *guard = Arc::new(next);
    }

    /// Feedback (c): extend the whitelist itself.
    pub fn add_whitelist_entry(&self, predicate: &Predicate) {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        next.whitelist.insert(predicate.as_str().to_string());
        *guard = Arc::new(next);
    }
}

/// Why a triple did not make it into the graph.
#[derive(Debug, Clone)]
pub enum ReviewItem {
    /// Surface mapped to OTHER; a human decides its canonical predicate.
    OtherPredicate { triple: ProposedTriple },
    /// A link scored inside the review band.
    LinkReview { chunk_id: String, link: EntityLink },
}

/// Review items accumulated over one ingestion.
#[derive(Debug, Clone, Default)]
pub struct ReviewQueue {
    items: Vec<ReviewItem>,
}

impl ReviewQueue {
    pub fn push(&mut self, item: ReviewItem) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[ReviewItem] {
        &self.items
    }

    /// Only the unmapped-predicate entries (the OTHER share numerator).
    pub fn other_predicate_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, ReviewItem::OtherPredicate { .. }))
            .count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outcome of governing one proposed triple.
#[derive(Debug, Clone)]
pub enum GovernedOutcome {
    Approved(ConceptTriple),
    /// Unmappable surface: park it for review.
    Review { reason: String },
    /// Ontology violation: reject outright.
    Rejected { reason: String },
}

/// The per-build governor: an immutable snapshot of the tables plus the
/// whitelist embeddings used by the synonym fallback.
pub struct PredicateGovernor {
    tables: Arc<GovernorTables>,
    whitelist_embeddings: Vec<(Predicate, Vec<f32>)>,
}

impl PredicateGovernor {
    /// Snapshot the tables and pre-embed the whitelist for this build.
    pub async fn prepare(ctx: &PipelineContext) -> Result<Self, LoomError> {
        let tables = ctx.governor_state.snapshot();
        let display: Vec<String> = tables
            .whitelist
            .iter()
            .map(|p| p.to_lowercase().replace('_', " "))
            .collect();
        let whitelist_embeddings = if ctx.config.enable_vector_search {
            let vectors = ctx.embed(&display).await?;
            tables
                .whitelist
                .iter()
                .map(Predicate::new)
                .zip(vectors)
                .collect()
        } else {
            Vec::new()
        };
        Ok(PredicateGovernor {
            tables,
            whitelist_embeddings,
        })
    }

    /// Normalize a free-text surface to a whitelisted predicate, or OTHER.
    pub async fn normalize(
        &self,
        ctx: &PipelineContext,
        surface: &str,
    ) -> Result<Predicate, LoomError> {
        let trimmed = surface.trim();
        if let Some(canonical) = self.tables.surface_map.get(trimmed) {
            return Ok(Predicate::new(canonical));
        }
        // Case-insensitive pass for Latin surfaces.
        let lowered = trimmed.to_lowercase();
        if let Some((_, canonical)) = self
            .tables
            .surface_map
            .iter()
            .find(|(k, _)| k.to_lowercase() == lowered)
        {
            return Ok(Predicate::new(canonical));
        }
        // A surface that IS a whitelist entry is already canonical.
        let as_predicate = Predicate::new(trimmed);
        if self.tables.whitelist.contains(as_predicate.as_str()) {
            return Ok(as_predicate);
        }

        if !self.whitelist_embeddings.is_empty() {
            let surface_vec = ctx.embed_one(trimmed).await?;
            let best = self
                .whitelist_embeddings
                .iter()
                .map(|(p, v)| (p, cosine_similarity(&surface_vec, v)))
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            if let Some((predicate, score)) = best
                && score >= self.tables.synonym_threshold
            {
                tracing::debug!(surface, predicate = predicate.as_str(), score, "synonym mapping");
                return Ok(predicate.clone());
            }
        }
        Ok(Predicate::other())
    }

    /// Govern one proposed triple. `subject_type`/`object_type` are the
    /// categories of the already-resolved concepts.
    pub async fn govern(
        &self,
        ctx: &PipelineContext,
        triple: &ProposedTriple,
        subject_type: &str,
        object_type: &str,
    ) -> Result<GovernedOutcome, LoomError> {
        let predicate = self.normalize(ctx, &triple.predicate_surface).await?;
        if predicate.is_other() {
            return Ok(GovernedOutcome::Review {
                reason: format!("surface '{}' has no whitelist mapping", triple.predicate_surface),
            });
        }
        if let Err(reason) = ctx.ontology.check_triple(&predicate, subject_type, object_type) {
            return Ok(GovernedOutcome::Rejected { reason });
        }
        Ok(GovernedOutcome::Approved(ConceptTriple {
            subject: triple.subject.clone(),
            predicate,
            object: triple.object.clone(),
            confidence: triple.confidence,
            evidence: triple.evidence.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphLoomConfig;
    use crate::model::Evidence;
    use crate::providers::{MockChatProvider, MockEmbeddingProvider};
    use crate::store::MemoryGraphStore;

    async fn context() -> PipelineContext {
        let mut config = GraphLoomConfig::default();
        config.providers.embed_dim = 32;
        PipelineContext::builder()
            .config(config)
            .chat_provider(Arc::new(MockChatProvider::new()))
            .embedder(Arc::new(MockEmbeddingProvider::new(32)))
            .store(Arc::new(MemoryGraphStore::new()))
            .build()
            .unwrap()
    }

    fn triple(surface: &str) -> ProposedTriple {
        ProposedTriple {
            subject: "con-a".to_string(),
            predicate_surface: surface.to_string(),
            object: "con-b".to_string(),
            confidence: 0.7,
            evidence: Evidence {
                doc_id: "doc-1".to_string(),
                chunk_id: "chk-1".to_string(),
                section_path: vec![],
                sentence_ids: vec!["s0".to_string()],
            },
        }
    }

    #[tokio::test]
    async fn configured_surfaces_map_to_uses() {
        let ctx = context().await;
        let governor = PredicateGovernor::prepare(&ctx).await.unwrap();
        assert_eq!(
            governor.normalize(&ctx, "基于").await.unwrap().as_str(),
            "USES"
        );
        assert_eq!(
            governor.normalize(&ctx, "采用").await.unwrap().as_str(),
            "USES"
        );
    }

    #[tokio::test]
    async fn unknown_surface_is_other_and_parked_for_review() {
        let ctx = context().await;
        let governor = PredicateGovernor::prepare(&ctx).await.unwrap();
        let normalized = governor.normalize(&ctx, "随机词").await.unwrap();
        assert!(normalized.is_other());

        let outcome = governor
            .govern(&ctx, &triple("随机词"), "technology", "method")
            .await
            .unwrap();
        assert!(matches!(outcome, GovernedOutcome::Review { .. }));
    }

    #[tokio::test]
    async fn synonym_fallback_maps_near_whitelist_phrases() {
        let ctx = context().await;
        let governor = PredicateGovernor::prepare(&ctx).await.unwrap();
        // "to similar" is not a configured surface, but its token bag equals
        // the whitelist display "similar to", so the embedding route maps it.
        let normalized = governor.normalize(&ctx, "to similar").await.unwrap();
        assert_eq!(normalized.as_str(), "SIMILAR_TO");
    }

    #[tokio::test]
    async fn type_violations_reject_even_mapped_surfaces() {
        let mut config = GraphLoomConfig::default();
        config.providers.embed_dim = 32;
        config.ontology.constraints.push(crate::config::PredicateConstraint {
            predicate: "USES".to_string(),
            pairs: vec![crate::config::TypePair {
                subject: "technology".to_string(),
                object: "method".to_string(),
            }],
        });
        let ctx = PipelineContext::builder()
            .config(config)
            .chat_provider(Arc::new(MockChatProvider::new()))
            .embedder(Arc::new(MockEmbeddingProvider::new(32)))
            .store(Arc::new(MemoryGraphStore::new()))
            .build()
            .unwrap();
        let governor = PredicateGovernor::prepare(&ctx).await.unwrap();

        let approved = governor
            .govern(&ctx, &triple("基于"), "technology", "method")
            .await
            .unwrap();
        assert!(matches!(approved, GovernedOutcome::Approved(_)));

        let rejected = governor
            .govern(&ctx, &triple("基于"), "person", "method")
            .await
            .unwrap();
        assert!(matches!(rejected, GovernedOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn feedback_rows_take_effect_on_next_snapshot() {
        let ctx = context().await;
        let governor = PredicateGovernor::prepare(&ctx).await.unwrap();
        assert!(governor.normalize(&ctx, "invokes").await.unwrap().is_other());

        ctx.governor_state
            .add_surface("invokes", &Predicate::new("USES"));
        // The running governor's snapshot is unchanged...
        assert!(governor.normalize(&ctx, "invokes").await.unwrap().is_other());
        // ...but the next build sees the new row.
        let next_build = PredicateGovernor::prepare(&ctx).await.unwrap();
        assert_eq!(
            next_build.normalize(&ctx, "invokes").await.unwrap().as_str(),
            "USES"
        );
    }
}

//! The eight-stage ingestion pipeline.
//!
//! ```text
//! ParsedDocument
//!   └► 0 chunker ─► 1 coref ─► 2 linker ─┬► 3 claims ─┐
//!                                        └► 4 themes ─┤
//!                                                     ├► 5 governor
//!                                                     └► 6 graph service
//! ```
//!
//! One document runs as plain sequential code; the only suspension points
//! are provider and store calls, and every one of them polls the job's
//! cancellation token. Distinct documents may ingest concurrently; they
//! race only at Stage 6, where the store's uniqueness constraints
//! arbitrate.
//!
//! Stage outputs are immutable values ([`ChunkArtifacts`] accretes by
//! construction, not mutation) collected into a [`DocumentArtifacts`] that
//! Stage 6 commits in one transaction. Per-chunk failures downgrade to
//! diagnostics; only document-level failures (input rejection, store
//! exhaustion, cancellation) surface as errors.

pub mod chunker;
pub mod claims;
pub mod coref;
pub mod linker;
pub mod themes;

use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Duration;

use crate::aliases::AliasEntry;
use crate::context::PipelineContext;
use crate::diagnostics::{JobCounts, JobDiagnostics, StageName, StatusHandle};
use crate::governor::{GovernedOutcome, PredicateGovernor, ReviewItem, ReviewQueue};
use crate::graph::PersistReport;
use crate::model::{
    BuildVersion, Chunk, Claim, ClaimRelation, Concept, ConceptTriple, Document, DocumentKind,
    DocumentStatus, EntityLink, ParsedDocument,
};
use crate::types::LoomError;

pub use chunker::chunk_document;
pub use claims::{ClaimDedupIndex, ClaimExtraction};
pub use coref::{CorefMode, CorefOutcome};
pub use linker::LinkerOutput;
pub use themes::{ThemeArtifact, ThemeSeed};

/// Everything one chunk produced on its way through stages 0–3.
#[derive(Debug, Clone)]
pub struct ChunkArtifacts {
    pub chunk: Chunk,
    pub coref: CorefOutcome,
    pub links: Vec<EntityLink>,
    pub proposed_concepts: Vec<Concept>,
    pub claims: Vec<Claim>,
    pub claim_relations: Vec<ClaimRelation>,
}

/// The complete input to Stage 6 for one document.
#[derive(Debug, Clone)]
pub struct DocumentArtifacts {
    pub document: Document,
    pub chunks: Vec<ChunkArtifacts>,
    pub themes: Vec<ThemeArtifact>,
    pub triples: Vec<ConceptTriple>,
}

/// Summary returned to the caller after a successful ingestion.
#[derive(Debug)]
pub struct IngestReport {
    pub document_id: String,
    pub build_version: BuildVersion,
    pub counts: JobCounts,
    pub review_queue: ReviewQueue,
    pub diagnostics: JobDiagnostics,
    pub persist: PersistReport,
}

/// Drives one document through all stages.
pub struct IngestPipeline {
    ctx: PipelineContext,
}

impl IngestPipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        IngestPipeline { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Ingest with a fresh build version and a throwaway status handle.
    pub async fn ingest(
        &self,
        parsed: ParsedDocument,
        kind: DocumentKind,
    ) -> Result<IngestReport, LoomError> {
        let status = StatusHandle::new();
        self.ingest_with_status(parsed, kind, &status, None).await
    }

    /// Full-control entry point: caller-supplied status handle and an
    /// optional pinned build version (re-runs and idempotence tests).
    pub async fn ingest_with_status(
        &self,
        parsed: ParsedDocument,
        kind: DocumentKind,
        status: &StatusHandle,
        version: Option<BuildVersion>,
    ) -> Result<IngestReport, LoomError> {
        let result = self
            .run_stages(parsed, kind, status, version)
            .await;
        if let Err(err) = &result {
            status.record_failure(err);
        }
        result
    }

    async fn run_stages(
        &self,
        parsed: ParsedDocument,
        kind: DocumentKind,
        status: &StatusHandle,
        version: Option<BuildVersion>,
    ) -> Result<IngestReport, LoomError> {
        let ctx = &self.ctx;
        let config = ctx.config.clone();

        // Input errors reject before Stage 0.
        if parsed.text.trim().is_empty() {
            return Err(LoomError::Input("document text is empty".to_string()));
        }

        let mut document = Document::from_text(&parsed.text, kind);
        document.status = DocumentStatus::Ingesting;
        let version =
            version.unwrap_or_else(|| BuildVersion::generate(&config.build_version_prefix));
        let mut diagnostics = JobDiagnostics::new();
        let mut review_queue = ReviewQueue::default();
        let stage_budget = Duration::from_millis(config.providers.stage_budget_ms);

        tracing::info!(
            doc_id = %document.id,
            build_version = %version,
            "starting ingestion"
        );

        // ── Stage 0: chunking ──────────────────────────────────────
        status.set_stage(StageName::Chunking);
        let mut chunks = chunker::chunk_document(&document, &parsed, &config.chunking, &version);
        status.update_counts(|counts| counts.chunks = chunks.len());

        // Embedding is the one batched computation in the pipeline.
        if config.enable_vector_search && !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = ctx.embed(&texts).await?;
            for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                chunk.embedding = Some(vector);
            }
        }

        // ── Stage 1: coreference ───────────────────────────────────
        status.set_stage(StageName::Coref);
        let mut resolved: Vec<(Chunk, CorefOutcome)> = Vec::with_capacity(chunks.len());
        let chunk_total = chunks.len().max(1);
        for (i, mut chunk) in chunks.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let outcome = coref::resolve_chunk(&chunk, &config.coref);
            if let Some(text) = &outcome.resolved_text {
                chunk.resolved_text = Some(text.clone());
            }
            status.set_progress((i + 1) as f32 / chunk_total as f32);
            resolved.push((chunk, outcome));
        }

        // ── Stage 2: entity linking ────────────────────────────────
        status.set_stage(StageName::Linking);
        let mut artifacts: Vec<ChunkArtifacts> = Vec::with_capacity(resolved.len());
        let mut proposed_names: FxHashSet<String> = FxHashSet::default();
        let mut proposed_triples = Vec::new();
        for (i, (chunk, coref_outcome)) in resolved.into_iter().enumerate() {
            ctx.check_cancelled()?;
            let output = match tokio::time::timeout(
                stage_budget,
                linker::link_chunk(ctx, &chunk, &coref_outcome),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    diagnostics.record(
                        &chunk.id,
                        StageName::Linking,
                        "linking exceeded the stage budget; chunk skipped",
                    );
                    LinkerOutput::default()
                }
            };
            status.update_counts(|counts| counts.links += output.links.len());
            for link in output.links.iter().filter(|l| l.is_review) {
                review_queue.push(ReviewItem::LinkReview {
                    chunk_id: chunk.id.clone(),
                    link: link.clone(),
                });
            }
            // The same canonical name can be proposed by several chunks;
            // one node suffices (ids are deterministic on the name).
            let proposed_concepts: Vec<Concept> = output
                .proposed_concepts
                .into_iter()
                .filter(|c| proposed_names.insert(c.name.clone()))
                .collect();
            proposed_triples.extend(output.triples);
            status.set_progress((i + 1) as f32 / chunk_total as f32);
            artifacts.push(ChunkArtifacts {
                chunk,
                coref: coref_outcome,
                links: output.links,
                proposed_concepts,
                claims: Vec::new(),
                claim_relations: Vec::new(),
            });
        }

        // ── Stage 3: claims ────────────────────────────────────────
        status.set_stage(StageName::Claims);
        let mut dedup = ClaimDedupIndex::default();
        for i in 0..artifacts.len() {
            ctx.check_cancelled()?;
            let (chunk, links) = (&artifacts[i].chunk, &artifacts[i].links);
            let extraction = match tokio::time::timeout(
                stage_budget,
                claims::extract_claims(ctx, chunk, links, &mut dedup, &mut diagnostics),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    diagnostics.record(
                        &artifacts[i].chunk.id,
                        StageName::Claims,
                        "claim extraction exceeded the stage budget; chunk skipped",
                    );
                    ClaimExtraction::default()
                }
            };
            status.update_counts(|counts| counts.claims += extraction.claims.len());
            status.set_progress((i + 1) as f32 / chunk_total as f32);
            artifacts[i].claims = extraction.claims;
            artifacts[i].claim_relations = extraction.relations;
        }

        // Claim embeddings, batched like chunk embeddings.
        if config.enable_vector_search {
            let mut positions = Vec::new();
            let mut texts = Vec::new();
            for (ci, chunk_artifacts) in artifacts.iter().enumerate() {
                for (li, claim) in chunk_artifacts.claims.iter().enumerate() {
                    positions.push((ci, li));
                    texts.push(claim.text.clone());
                }
            }
            if !texts.is_empty() {
                let vectors = ctx.embed(&texts).await?;
                for ((ci, li), vector) in positions.into_iter().zip(vectors) {
                    artifacts[ci].claims[li].embedding = Some(vector);
                }
            }
        }

        // ── Stage 4: themes ────────────────────────────────────────
        status.set_stage(StageName::Themes);
        let seeds = self.theme_seeds(&artifacts).await?;
        let all_claims: Vec<Claim> = artifacts
            .iter()
            .flat_map(|a| a.claims.iter().cloned())
            .collect();
        let themes = themes::build_themes(ctx, &seeds, &all_claims, &mut diagnostics).await?;
        status.update_counts(|counts| counts.themes = themes.len());

        // ── Stage 5: predicate governance ──────────────────────────
        status.set_stage(StageName::Governance);
        let governor = PredicateGovernor::prepare(ctx).await?;
        let categories = self.concept_categories(&artifacts).await?;
        let mut triples = Vec::new();
        for proposed in proposed_triples {
            ctx.check_cancelled()?;
            let subject_type = categories.get(&proposed.subject).cloned().unwrap_or_default();
            let object_type = categories.get(&proposed.object).cloned().unwrap_or_default();
            match governor
                .govern(ctx, &proposed, &subject_type, &object_type)
                .await?
            {
                GovernedOutcome::Approved(triple) => triples.push(triple),
                GovernedOutcome::Review { reason } => {
                    tracing::debug!(
                        surface = %proposed.predicate_surface,
                        %reason,
                        "triple parked for review"
                    );
                    review_queue.push(ReviewItem::OtherPredicate { triple: proposed });
                }
                GovernedOutcome::Rejected { reason } => {
                    diagnostics.record(
                        &proposed.evidence.chunk_id,
                        StageName::Governance,
                        format!("rejected triple: {reason}"),
                    );
                }
            }
        }
        status.set_review_queue_size(review_queue.len());

        // ── Stage 6: persistence ───────────────────────────────────
        status.set_stage(StageName::Persistence);
        ctx.check_cancelled()?;
        document.status = DocumentStatus::Ready;
        let document_artifacts = DocumentArtifacts {
            document,
            chunks: artifacts,
            themes,
            triples,
        };
        let persist = ctx
            .graph
            .persist_document(&document_artifacts, &version)
            .await?;

        // Aliases discovered in this build become dictionary entries only
        // after the commit, so failed documents never pollute the map.
        self.record_aliases(&document_artifacts);

        status.finish();
        let report = IngestReport {
            document_id: document_artifacts.document.id.clone(),
            build_version: version,
            counts: status.snapshot().counts,
            review_queue,
            diagnostics,
            persist,
        };
        tracing::info!(
            doc_id = %report.document_id,
            chunks = report.counts.chunks,
            links = report.counts.links,
            claims = report.counts.claims,
            themes = report.counts.themes,
            "ingestion committed"
        );
        Ok(report)
    }

    /// Projection seeds for the theme builder: every concept this document
    /// touched, with label text from the proposal or the store.
    async fn theme_seeds(
        &self,
        artifacts: &[ChunkArtifacts],
    ) -> Result<Vec<themes::ThemeSeed>, LoomError> {
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut seeds = Vec::new();
        for chunk_artifacts in artifacts {
            for concept in &chunk_artifacts.proposed_concepts {
                if seen.insert(concept.id.clone()) {
                    seeds.push(themes::ThemeSeed {
                        id: concept.id.clone(),
                        text: format!("{} {}", concept.name, concept.description),
                    });
                }
            }
            for link in &chunk_artifacts.links {
                let Some(id) = link.concept_id.as_deref() else {
                    continue;
                };
                if seen.contains(id) {
                    continue;
                }
                if let Some(node) = self.ctx.store().get_node(id).await? {
                    seen.insert(id.to_string());
                    seeds.push(themes::ThemeSeed {
                        id: id.to_string(),
                        text: format!(
                            "{} {}",
                            node.prop_str("name").unwrap_or_default(),
                            node.prop_str("description").unwrap_or_default()
                        ),
                    });
                }
            }
        }
        Ok(seeds)
    }

    /// Categories for every concept a triple might reference: proposed
    /// concepts first, then whatever the store knows.
    async fn concept_categories(
        &self,
        artifacts: &[ChunkArtifacts],
    ) -> Result<FxHashMap<String, String>, LoomError> {
        let mut categories: FxHashMap<String, String> = FxHashMap::default();
        for chunk_artifacts in artifacts {
            for concept in &chunk_artifacts.proposed_concepts {
                categories.insert(concept.id.clone(), concept.category.clone());
            }
            for link in &chunk_artifacts.links {
                let Some(id) = link.concept_id.as_deref() else {
                    continue;
                };
                if categories.contains_key(id) {
                    continue;
                }
                if let Some(node) = self.ctx.store().get_node(id).await? {
                    categories.insert(
                        id.to_string(),
                        node.prop_str("category").unwrap_or_default().to_string(),
                    );
                }
            }
        }
        Ok(categories)
    }

    fn record_aliases(&self, artifacts: &DocumentArtifacts) {
        let doc_id = &artifacts.document.id;
        let mut entries = Vec::new();
        for chunk_artifacts in &artifacts.chunks {
            for (surface, canonical) in &chunk_artifacts.coref.alias_map {
                entries.push(AliasEntry::local(surface, canonical, doc_id, 0.9));
            }
            for link in &chunk_artifacts.links {
                if let Some(name) = &link.proposed_name
                    && name != &link.mention
                {
                    entries.push(AliasEntry::local(&link.mention, name, doc_id, 0.8));
                }
            }
        }
        if !entries.is_empty() {
            self.ctx.aliases.insert_all(entries);
        }
    }
}

//! The graph service: the single writer to the property graph.
//!
//! Stage 6. Everything a document ingestion produces is assembled into one
//! [`WriteBatch`] in dependency order (Document → Chunks → Concepts +
//! MENTIONS → Claims → inter-Claim relations → Themes → memberships →
//! governed predicates) and committed atomically. Readers never observe a
//! half-ingested document.
//!
//! Upsert discipline per entity kind:
//! - Documents and Chunks merge by deterministic id.
//! - Concepts merge by unique `name` after alias canonicalization; NIL
//!   proposals only materialize when no existing name claims them; the
//!   store's uniqueness constraint arbitrates races between documents.
//! - Claims merge by their `(doc_id, normalized_text_hash)`-derived id,
//!   unioning `sentence_ids` and accreting `EVIDENCE_FROM` edges.
//! - Edges merge by `(src, kind, dst)` plus a disambiguator where two edges
//!   of the same kind can legitimately coexist (MENTIONS sentence spans).
//!
//! Transient store failures are retried with exponential backoff; after the
//! budget the document transaction fails with no partial writes.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreRetryConfig;
use crate::model::{
    BuildVersion, Chunk, Concept, JsonMap, NodeLabel, edge,
};
use crate::pipeline::DocumentArtifacts;
use crate::store::{
    BatchOutcome, EdgeRecord, GraphStore, NodeRecord, PurgeReport, WriteBatch,
};
use crate::types::LoomError;

/// Serialize a model value into a node property map, dropping the embedding
/// (backends keep vectors in their own index).
fn to_props<T: serde::Serialize>(value: &T) -> Result<JsonMap, LoomError> {
    let serde_json::Value::Object(mut map) = serde_json::to_value(value)? else {
        return Err(LoomError::Io("model value did not serialize to an object".to_string()));
    };
    map.remove("embedding");
    Ok(map)
}

/// What one committed document ingestion wrote.
#[derive(Debug, Clone, Default)]
pub struct PersistReport {
    pub outcome: BatchOutcome,
    pub concepts_created: usize,
    pub mentions_written: usize,
    pub claims_written: usize,
    pub themes_written: usize,
    pub predicates_written: usize,
}

#[derive(Clone)]
pub struct GraphService {
    store: Arc<dyn GraphStore>,
    retry: StoreRetryConfig,
}

impl GraphService {
    pub fn new(store: Arc<dyn GraphStore>, retry: StoreRetryConfig) -> Self {
        GraphService { store, retry }
    }

    /// Read access for retrieval and metrics; mutation stays in here.
    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    async fn apply_with_retry(&self, batch: WriteBatch) -> Result<BatchOutcome, LoomError> {
        let mut attempt = 0;
        loop {
            match self.store.apply(batch.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.base_delay_ms.saturating_mul(1 << attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay,
                        "transient store error, backing off: {err}"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Persist one document's full artifact set in a single transaction.
    pub async fn persist_document(
        &self,
        artifacts: &DocumentArtifacts,
        version: &BuildVersion,
    ) -> Result<PersistReport, LoomError> {
        let v = version.as_str();
        let mut batch = WriteBatch::new();
        let mut report = PersistReport::default();

        // 1. Document.
        let doc = &artifacts.document;
        batch.merge_node(
            NodeRecord {
                id: doc.id.clone(),
                label: NodeLabel::Document,
                props: to_props(doc)?,
                build_version: v.to_string(),
            },
            None,
        );

        // 2. Chunks and containment.
        for chunk_artifacts in &artifacts.chunks {
            let chunk = &chunk_artifacts.chunk;
            batch.merge_node(
                NodeRecord {
                    id: chunk.id.clone(),
                    label: NodeLabel::Chunk,
                    props: to_props(chunk)?,
                    build_version: v.to_string(),
                },
                chunk.embedding.clone(),
            );
            batch.merge_edge(EdgeRecord::new(
                doc.id.clone(),
                edge::CONTAINS,
                chunk.id.clone(),
                None,
                JsonMap::new(),
                v,
            ));
        }

        // 3. Concepts (NIL proposals) and MENTIONS with evidence.
        for chunk_artifacts in &artifacts.chunks {
            let chunk = &chunk_artifacts.chunk;
            for concept in &chunk_artifacts.proposed_concepts {
                batch.merge_node(
                    NodeRecord {
                        id: concept.id.clone(),
                        label: NodeLabel::Concept,
                        props: to_props(concept)?,
                        build_version: v.to_string(),
                    },
                    concept.embedding.clone(),
                );
                report.concepts_created += 1;
            }
            for link in &chunk_artifacts.links {
                let Some(concept_id) = link.concept_id.as_deref() else {
                    continue;
                };
                let mut props = JsonMap::new();
                props.insert("evidence".to_string(), json!(link.mention));
                props.insert(
                    "offset".to_string(),
                    json!([link.span.start, link.span.end]),
                );
                props.insert("confidence".to_string(), json!(link.confidence));
                props.insert("is_review".to_string(), json!(link.is_review));
                let disambiguator = format!(
                    "{}:{}-{}",
                    link.span.sentence_id, link.span.start, link.span.end
                );
                batch.merge_edge(EdgeRecord::new(
                    chunk.id.clone(),
                    edge::MENTIONS,
                    concept_id,
                    Some(disambiguator),
                    props,
                    v,
                ));
                report.mentions_written += 1;

                batch.merge_edge(evidence_edge(
                    concept_id,
                    chunk,
                    std::slice::from_ref(&link.span.sentence_id),
                    v,
                ));
            }
        }

        // 4. Claims: shells redirect, canonicals accrete evidence.
        for chunk_artifacts in &artifacts.chunks {
            let chunk = &chunk_artifacts.chunk;
            for claim in &chunk_artifacts.claims {
                batch.merge_node_union(
                    NodeRecord {
                        id: claim.id.clone(),
                        label: NodeLabel::Claim,
                        props: to_props(claim)?,
                        build_version: v.to_string(),
                    },
                    vec!["sentence_ids".to_string()],
                    claim.embedding.clone(),
                );
                batch.merge_edge(EdgeRecord::new(
                    chunk.id.clone(),
                    edge::CONTAINS_CLAIM,
                    claim.id.clone(),
                    None,
                    JsonMap::new(),
                    v,
                ));
                // Evidence lands on the live claim, so redirect shells union
                // their chunk into the canonical target.
                let evidence_target = claim.canonical_id.as_deref().unwrap_or(&claim.id);
                batch.merge_edge(evidence_edge(evidence_target, chunk, &claim.sentence_ids, v));
                if let Some(canonical) = claim.canonical_id.as_deref() {
                    let mut union_props = JsonMap::new();
                    union_props.insert("sentence_ids".to_string(), json!(claim.sentence_ids));
                    batch.merge_node_union(
                        NodeRecord {
                            id: canonical.to_string(),
                            label: NodeLabel::Claim,
                            props: union_props,
                            build_version: v.to_string(),
                        },
                        vec!["sentence_ids".to_string()],
                        None,
                    );
                }
                report.claims_written += 1;
            }
        }

        // 5. Inter-claim relations.
        for chunk_artifacts in &artifacts.chunks {
            for relation in &chunk_artifacts.claim_relations {
                let mut props = JsonMap::new();
                props.insert("confidence".to_string(), json!(relation.confidence));
                batch.merge_edge(EdgeRecord::new(
                    relation.src_claim_id.clone(),
                    relation.kind.as_str(),
                    relation.dst_claim_id.clone(),
                    None,
                    props,
                    v,
                ));
            }
        }

        // 6. Themes and memberships.
        for theme_artifact in &artifacts.themes {
            let theme = &theme_artifact.theme;
            batch.merge_node(
                NodeRecord {
                    id: theme.id.clone(),
                    label: NodeLabel::Theme,
                    props: to_props(theme)?,
                    build_version: v.to_string(),
                },
                theme.embedding.clone(),
            );
            for member_id in &theme_artifact.members {
                batch.merge_edge(EdgeRecord::new(
                    member_id.clone(),
                    edge::BELONGS_TO_THEME,
                    theme.id.clone(),
                    None,
                    JsonMap::new(),
                    v,
                ));
            }
            report.themes_written += 1;
        }

        // 7. Governed concept-concept predicates, last.
        for triple in &artifacts.triples {
            let mut props = JsonMap::new();
            props.insert("confidence".to_string(), json!(triple.confidence));
            props.insert(
                "evidence_chunk".to_string(),
                json!(triple.evidence.chunk_id),
            );
            batch.merge_edge(EdgeRecord::new(
                triple.subject.clone(),
                triple.predicate.as_str(),
                triple.object.clone(),
                None,
                props,
                v,
            ));
            report.predicates_written += 1;
        }

        report.outcome = self.apply_with_retry(batch).await?;
        Ok(report)
    }

    /// Standalone concept upsert used by feedback and maintenance paths.
    /// Returns the surviving node id, which may differ from `concept.id`
    /// when the unique name already exists.
    pub async fn upsert_concept(
        &self,
        concept: &Concept,
        evidence_chunk: Option<&Chunk>,
        version: &BuildVersion,
    ) -> Result<String, LoomError> {
        let v = version.as_str();
        let mut batch = WriteBatch::new();
        batch.merge_node(
            NodeRecord {
                id: concept.id.clone(),
                label: NodeLabel::Concept,
                props: to_props(concept)?,
                build_version: v.to_string(),
            },
            concept.embedding.clone(),
        );
        if let Some(chunk) = evidence_chunk {
            let mut props = JsonMap::new();
            props.insert("evidence".to_string(), json!(concept.name));
            props.insert("confidence".to_string(), json!(1.0));
            batch.merge_edge(EdgeRecord::new(
                chunk.id.clone(),
                edge::MENTIONS,
                concept.id.clone(),
                None,
                props,
                v,
            ));
            batch.merge_edge(evidence_edge(&concept.id, chunk, &chunk.sentence_ids, v));
        }
        let outcome = self.apply_with_retry(batch).await?;
        Ok(outcome
            .remapped
            .get(&concept.id)
            .cloned()
            .unwrap_or_else(|| concept.id.clone()))
    }

    /// Delete everything stamped with `version` (compensating rollback).
    pub async fn rollback(&self, version: &BuildVersion) -> Result<PurgeReport, LoomError> {
        Ok(self.store.delete_build_version(version.as_str()).await?)
    }

    /// Maintenance: remove concepts nothing references anymore.
    pub async fn orphan_cleanup(&self) -> Result<usize, LoomError> {
        let concepts = self.store.nodes_by_label(NodeLabel::Concept).await?;
        let mut orphans = Vec::new();
        for concept in concepts {
            if self.store.degree(&concept.id).await? == 0 {
                orphans.push(concept.id);
            }
        }
        if orphans.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = orphans.len(), "removing orphaned concepts");
        Ok(self.store.delete_nodes(&orphans).await?)
    }

    /// Feedback: fold `source` into `target`. Edges move to the target and
    /// the source becomes a redirect shell (`merged_into`).
    pub async fn merge_concepts(&self, source_id: &str, target_id: &str) -> Result<usize, LoomError> {
        use crate::store::Direction;
        let Some(_target) = self.store.get_node(target_id).await? else {
            return Err(LoomError::Input(format!("merge target {target_id} not found")));
        };
        let Some(source) = self.store.get_node(source_id).await? else {
            return Err(LoomError::Input(format!("merge source {source_id} not found")));
        };

        let incident = self
            .store
            .neighbors(source_id, &[], Direction::Both)
            .await?;
        let mut batch = WriteBatch::new();
        let mut moved = 0;
        for (old_edge, _) in &incident {
            let (src, dst) = if old_edge.src == source_id {
                (target_id.to_string(), old_edge.dst.clone())
            } else {
                (old_edge.src.clone(), target_id.to_string())
            };
            if src == dst {
                continue;
            }
            batch.merge_edge(EdgeRecord::new(
                src,
                old_edge.kind.clone(),
                dst,
                old_edge.disambiguator.clone(),
                old_edge.props.clone(),
                old_edge.build_version.clone(),
            ));
            moved += 1;
        }
        let mut redirect = JsonMap::new();
        redirect.insert("merged_into".to_string(), json!(target_id));
        batch.set_node_props(source.id.clone(), redirect);
        self.apply_with_retry(batch).await?;

        for (old_edge, _) in &incident {
            self.store.delete_edge(&old_edge.key).await?;
        }
        Ok(moved)
    }

    /// Feedback: replace one edge's predicate or endpoint.
    pub async fn reassign_edge(
        &self,
        edge_key: &str,
        new_kind: Option<&str>,
        new_dst: Option<&str>,
    ) -> Result<String, LoomError> {
        let Some(old) = self.store.get_edge(edge_key).await? else {
            return Err(LoomError::Input(format!("edge {edge_key} not found")));
        };
        let replacement = EdgeRecord::new(
            old.src.clone(),
            new_kind.unwrap_or(&old.kind),
            new_dst.unwrap_or(&old.dst),
            old.disambiguator.clone(),
            old.props.clone(),
            old.build_version.clone(),
        );
        let new_key = replacement.key.clone();
        if new_key == edge_key {
            return Ok(new_key);
        }
        let mut batch = WriteBatch::new();
        batch.merge_edge(replacement);
        self.apply_with_retry(batch).await?;
        self.store.delete_edge(edge_key).await?;
        Ok(new_key)
    }
}

/// EVIDENCE_FROM edge carrying the four-level locator.
fn evidence_edge(node_id: &str, chunk: &Chunk, sentence_ids: &[String], version: &str) -> EdgeRecord {
    let mut props = JsonMap::new();
    props.insert("doc_id".to_string(), json!(chunk.doc_id));
    props.insert("section_path".to_string(), json!(chunk.section_path));
    props.insert("sentence_ids".to_string(), json!(sentence_ids));
    EdgeRecord::new(
        node_id,
        edge::EVIDENCE_FROM,
        chunk.id.clone(),
        None,
        props,
        version,
    )
}

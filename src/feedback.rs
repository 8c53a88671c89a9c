//! Stage 8: quality metrics and the feedback write surface.
//!
//! Metrics run read-only over one build version: provenance completeness
//! (every concept and claim resolves to a chunk through EVIDENCE_FROM),
//! the predicate distribution with its OTHER share, entity-link accuracy
//! against an optional labeled set, theme NMI against an optional ground
//! truth, and a sampled claim-relation precision using the model as judge
//! (falling back to the extraction rules when the model is unavailable).
//!
//! The three write operations route through the graph service and the
//! copy-on-write dictionaries, so a running ingestion never observes a
//! half-applied correction:
//! - `merge` folds one concept into another and re-points its aliases.
//! - `correct` replaces an edge's predicate or object; a correction seen
//!   often enough is promoted into the governor's surface map.
//! - `unlink` adds a negative alias entry scoped to one document.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::PipelineContext;
use crate::model::{ClaimRelationKind, NodeLabel, Predicate, edge};
use crate::providers::ChatMessage;
use crate::store::{Direction, GraphCounts};
use crate::types::LoomError;

/// A held-out labeled mention for link-accuracy measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledMention {
    pub surface: String,
    pub doc_id: String,
    pub expected_concept_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub build_version: String,
    pub provenance_complete: bool,
    /// Concept/claim ids with no resolvable evidence path.
    pub provenance_violations: Vec<String>,
    /// Whitelisted predicate → edge count, for this build.
    pub predicate_distribution: BTreeMap<String, usize>,
    /// OTHER triples parked for review / all proposed predicates.
    pub other_share: f32,
    pub link_accuracy: Option<f32>,
    pub theme_nmi: Option<f32>,
    pub claim_relation_precision: Option<f32>,
    pub counts: GraphCounts,
}

/// What to change about an edge.
#[derive(Debug, Clone)]
pub enum EdgeCorrection {
    Predicate(Predicate),
    Object(String),
}

#[derive(Debug, Clone)]
pub struct CorrectionOutcome {
    pub new_edge_key: String,
    /// True when this correction recurred often enough to update the
    /// governor's surface map for future builds.
    pub promoted: bool,
}

pub struct FeedbackService {
    ctx: PipelineContext,
    /// (old predicate, new predicate) → recurrence count.
    correction_counts: Arc<Mutex<FxHashMap<(String, String), usize>>>,
}

impl FeedbackService {
    pub fn new(ctx: PipelineContext) -> Self {
        FeedbackService {
            ctx,
            correction_counts: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    // ── Metrics ────────────────────────────────────────────────────

    pub async fn metrics(
        &self,
        build_version: &str,
        review_other_count: usize,
        labeled: Option<&[LabeledMention]>,
        theme_ground_truth: Option<&FxHashMap<String, String>>,
    ) -> Result<MetricsReport, LoomError> {
        let ctx = &self.ctx;
        let whitelist = ctx.governor_state.snapshot().whitelist.clone();

        // Provenance completeness over this build's concepts and claims.
        let mut violations = Vec::new();
        for label in [NodeLabel::Concept, NodeLabel::Claim] {
            for node in ctx.store().nodes_by_label(label).await? {
                if node.build_version != build_version {
                    continue;
                }
                // Redirect shells delegate their provenance to the target.
                if node.prop_str("merged_into").is_some() {
                    continue;
                }
                let evidence_target = node.prop_str("canonical_id").unwrap_or(&node.id).to_string();
                let hits = ctx
                    .store()
                    .neighbors(
                        &evidence_target,
                        &[edge::EVIDENCE_FROM.to_string()],
                        Direction::Out,
                    )
                    .await?;
                let resolvable = hits.iter().any(|(e, chunk)| {
                    e.props.get("doc_id").is_some()
                        && e.props.get("sentence_ids").is_some()
                        && chunk.label == NodeLabel::Chunk
                });
                if !resolvable {
                    violations.push(node.id.clone());
                }
            }
        }

        // Predicate distribution for whitelisted kinds.
        let mut distribution: BTreeMap<String, usize> = BTreeMap::new();
        for kind in &whitelist {
            let count = ctx
                .store()
                .edges_by_kind(kind)
                .await?
                .into_iter()
                .filter(|e| e.build_version == build_version)
                .count();
            if count > 0 {
                distribution.insert(kind.clone(), count);
            }
        }
        let whitelisted_total: usize = distribution.values().sum();
        let proposed_total = whitelisted_total + review_other_count;
        let other_share = if proposed_total == 0 {
            0.0
        } else {
            review_other_count as f32 / proposed_total as f32
        };
        if other_share >= 0.1 {
            tracing::warn!(
                other_share,
                "OTHER share exceeds the 10% budget; surface map needs curation"
            );
        }

        let link_accuracy = match labeled {
            Some(set) if !set.is_empty() => Some(self.link_accuracy(set).await?),
            _ => None,
        };
        let theme_nmi = match theme_ground_truth {
            Some(truth) if !truth.is_empty() => Some(self.theme_nmi(truth).await?),
            _ => None,
        };
        let claim_relation_precision = self.claim_relation_precision(build_version).await?;

        Ok(MetricsReport {
            build_version: build_version.to_string(),
            provenance_complete: violations.is_empty(),
            provenance_violations: violations,
            predicate_distribution: distribution,
            other_share,
            link_accuracy,
            theme_nmi,
            claim_relation_precision,
            counts: ctx.store().counts().await?,
        })
    }

    async fn link_accuracy(&self, labeled: &[LabeledMention]) -> Result<f32, LoomError> {
        let snapshot = self.ctx.aliases.snapshot();
        let mut correct = 0_usize;
        for example in labeled {
            let resolved = snapshot
                .resolve(&example.surface, Some(&example.doc_id))
                .map(|entry| entry.canonical.clone());
            let resolved = match resolved {
                Some(name) => Some(name),
                None => self
                    .ctx
                    .store()
                    .find_node(NodeLabel::Concept, "name", &example.surface)
                    .await?
                    .and_then(|node| node.prop_str("name").map(str::to_string)),
            };
            if resolved.as_deref() == Some(example.expected_concept_name.as_str()) {
                correct += 1;
            }
        }
        Ok(correct as f32 / labeled.len() as f32)
    }

    /// Normalized mutual information between theme membership and a ground
    /// truth classification.
    async fn theme_nmi(&self, truth: &FxHashMap<String, String>) -> Result<f32, LoomError> {
        let mut predicted: FxHashMap<String, String> = FxHashMap::default();
        for theme in self.ctx.store().nodes_by_label(NodeLabel::Theme).await? {
            for (_, member) in self
                .ctx
                .store()
                .neighbors(&theme.id, &[edge::BELONGS_TO_THEME.to_string()], Direction::In)
                .await?
            {
                predicted.entry(member.id.clone()).or_insert(theme.id.clone());
            }
        }
        let pairs: Vec<(&String, &String)> = truth
            .iter()
            .filter_map(|(node, class)| predicted.get(node).map(|theme| (theme, class)))
            .collect();
        Ok(normalized_mutual_information(&pairs))
    }

    /// Sample this build's inter-claim relations and ask the model whether
    /// each holds; extraction rules are the fallback judge.
    async fn claim_relation_precision(
        &self,
        build_version: &str,
    ) -> Result<Option<f32>, LoomError> {
        const SAMPLE: usize = 8;
        let mut relations = Vec::new();
        for kind in [
            ClaimRelationKind::Supports,
            ClaimRelationKind::Contradicts,
            ClaimRelationKind::Causes,
            ClaimRelationKind::ComparesWith,
            ClaimRelationKind::Conditions,
        ] {
            for rel_edge in self.ctx.store().edges_by_kind(kind.as_str()).await? {
                if rel_edge.build_version == build_version {
                    relations.push((kind, rel_edge));
                }
            }
        }
        if relations.is_empty() {
            return Ok(None);
        }
        relations.truncate(SAMPLE);

        let mut held = 0_usize;
        let total = relations.len();
        for (kind, rel_edge) in relations {
            let (Some(src), Some(dst)) = (
                self.ctx.store().get_node(&rel_edge.src).await?,
                self.ctx.store().get_node(&rel_edge.dst).await?,
            ) else {
                continue;
            };
            let src_text = src.prop_str("text").unwrap_or_default();
            let dst_text = dst.prop_str("text").unwrap_or_default();
            let prompt = format!(
                "Claim A: {src_text}\nClaim B: {dst_text}\n\
                 Does the relation \"A {} B\" hold? Answer yes or no.",
                kind.as_str()
            );
            match self.ctx.chat(vec![ChatMessage::user(prompt)]).await {
                Ok(reply) => {
                    if reply.to_lowercase().contains("yes") {
                        held += 1;
                    }
                }
                Err(LoomError::Cancelled) => return Err(LoomError::Cancelled),
                Err(_) => {
                    // Judge unavailable: fall back to the extraction rules.
                    if crate::pipeline::claims::relation_plausible(kind, src_text, dst_text) {
                        held += 1;
                    }
                }
            }
        }
        Ok(Some(held as f32 / total as f32))
    }

    // ── Feedback writes ────────────────────────────────────────────

    /// Fold `source_id` into `target_id`: edges move, aliases re-point, the
    /// source becomes a redirect shell.
    pub async fn merge(&self, source_id: &str, target_id: &str) -> Result<usize, LoomError> {
        let source = self
            .ctx
            .store()
            .get_node(source_id)
            .await?
            .ok_or_else(|| LoomError::Input(format!("merge source {source_id} not found")))?;
        let target = self
            .ctx
            .store()
            .get_node(target_id)
            .await?
            .ok_or_else(|| LoomError::Input(format!("merge target {target_id} not found")))?;

        let moved = self.ctx.graph.merge_concepts(source_id, target_id).await?;
        if let (Some(source_name), Some(target_name)) =
            (source.prop_str("name"), target.prop_str("name"))
        {
            self.ctx.aliases.repoint_canonical(source_name, target_name);
        }
        tracing::info!(source_id, target_id, moved, "concepts merged");
        Ok(moved)
    }

    /// Replace an edge's predicate or object. The same predicate correction
    /// recurring `correction_promotion_threshold` times updates the governor
    /// map for the next ingestion.
    pub async fn correct(
        &self,
        edge_key: &str,
        correction: EdgeCorrection,
    ) -> Result<CorrectionOutcome, LoomError> {
        let old = self
            .ctx
            .store()
            .get_edge(edge_key)
            .await?
            .ok_or_else(|| LoomError::Input(format!("edge {edge_key} not found")))?;

        let (new_kind, new_dst, promoted) = match &correction {
            EdgeCorrection::Predicate(predicate) => {
                let key = (old.kind.clone(), predicate.as_str().to_string());
                let threshold = self.ctx.config.governor.correction_promotion_threshold;
                let count = {
                    let mut counts = self.correction_counts.lock();
                    let count = counts.entry(key).or_insert(0);
                    *count += 1;
                    *count
                };
                let promoted = count >= threshold;
                if promoted {
                    let surface = old.kind.to_lowercase().replace('_', " ");
                    self.ctx.governor_state.add_surface(surface, predicate);
                    tracing::info!(
                        old_kind = %old.kind,
                        new_kind = %predicate,
                        "recurring correction promoted into the governor map"
                    );
                }
                (Some(predicate.as_str().to_string()), None, promoted)
            }
            EdgeCorrection::Object(object_id) => (None, Some(object_id.clone()), false),
        };

        let new_edge_key = self
            .ctx
            .graph
            .reassign_edge(edge_key, new_kind.as_deref(), new_dst.as_deref())
            .await?;
        Ok(CorrectionOutcome {
            new_edge_key,
            promoted,
        })
    }

    /// Block a surface form from resolving to a concept within one
    /// document's context.
    pub async fn unlink(
        &self,
        surface: &str,
        concept_id: &str,
        doc_id: &str,
    ) -> Result<(), LoomError> {
        let concept = self
            .ctx
            .store()
            .get_node(concept_id)
            .await?
            .ok_or_else(|| LoomError::Input(format!("concept {concept_id} not found")))?;
        let name = concept
            .prop_str("name")
            .ok_or_else(|| LoomError::Input(format!("node {concept_id} has no name")))?;
        self.ctx
            .aliases
            .insert(crate::aliases::AliasEntry::negative(surface, name, doc_id));
        tracing::info!(surface, concept_id, doc_id, "negative alias recorded");
        Ok(())
    }
}

/// NMI over (predicted cluster, true class) pairs, in [0, 1].
fn normalized_mutual_information(pairs: &[(&String, &String)]) -> f32 {
    if pairs.is_empty() {
        return 0.0;
    }
    let n = pairs.len() as f32;
    let mut joint: FxHashMap<(&str, &str), f32> = FxHashMap::default();
    let mut clusters: FxHashMap<&str, f32> = FxHashMap::default();
    let mut classes: FxHashMap<&str, f32> = FxHashMap::default();
    for (cluster, class) in pairs {
        *joint.entry((cluster.as_str(), class.as_str())).or_insert(0.0) += 1.0;
        *clusters.entry(cluster.as_str()).or_insert(0.0) += 1.0;
        *classes.entry(class.as_str()).or_insert(0.0) += 1.0;
    }
    let mut mutual = 0.0_f32;
    for ((cluster, class), count) in &joint {
        let p_joint = count / n;
        let p_cluster = clusters[cluster] / n;
        let p_class = classes[class] / n;
        mutual += p_joint * (p_joint / (p_cluster * p_class)).ln();
    }
    let entropy = |counts: &FxHashMap<&str, f32>| -> f32 {
        counts
            .values()
            .map(|count| {
                let p = count / n;
                -p * p.ln()
            })
            .sum()
    };
    let h_cluster = entropy(&clusters);
    let h_class = entropy(&classes);
    if h_cluster == 0.0 && h_class == 0.0 {
        // Both partitions are single clusters: perfect agreement.
        return 1.0;
    }
    let denominator = (h_cluster * h_class).sqrt();
    if denominator == 0.0 {
        0.0
    } else {
        (mutual / denominator).clamp(0.0, 1.0)
    }
}

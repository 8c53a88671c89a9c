//! Stage 7: theme-first hybrid retrieval with anchored generation.
//!
//! ```text
//! question ─► theme recall ──► member expansion ─┐
//!          ─► vector recall (chunks, claims) ────┼─► ≤2-hop graph walk
//!                                                └─► evidence assembly
//!                                                      └─► scoped generation
//! ```
//!
//! Three modes: `local` skips theme recall, `global` answers from theme
//! summaries alone, `hybrid` (default) does both. The generation step is
//! strict about anchoring: every sentence of the answer must cite an
//! `[E«n»]` anchor from the returned evidence list; unanchored sentences
//! force a retry, and when retries run out the service returns
//! "insufficient evidence" with whatever reasoning chain it assembled.
//! The answer never throws for lack of evidence.
//!
//! Failure posture: if the store is unreachable the service serves the
//! last-known-good themes as a best effort; if the model times out it
//! returns the structured retrieval result without prose.

use parking_lot::RwLock;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::LazyLock;

use crate::context::PipelineContext;
use crate::model::{ClaimRelationKind, NodeLabel, edge};
use crate::providers::ChatMessage;
use crate::store::{Direction, NodeRecord};
use crate::text::split_sentences;
use crate::types::LoomError;

static ANCHOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[E(\d+)\]").unwrap());

/// Claim-relation kinds the argument-chain walk follows.
const CHAIN_KINDS: [ClaimRelationKind; 4] = [
    ClaimRelationKind::Supports,
    ClaimRelationKind::Causes,
    ClaimRelationKind::Contradicts,
    ClaimRelationKind::ComparesWith,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Local,
    Global,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub question: String,
    pub mode: QueryMode,
    /// Overrides `retrieval.top_k` when set.
    pub top_k: Option<usize>,
}

impl QueryRequest {
    pub fn hybrid(question: impl Into<String>) -> Self {
        QueryRequest {
            question: question.into(),
            mode: QueryMode::Hybrid,
            top_k: None,
        }
    }
}

/// A theme surfaced to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeSummary {
    pub id: String,
    pub label: String,
    pub summary: String,
}

/// One cited evidence tuple; `anchor` is what the answer text references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub anchor: String,
    pub doc_id: String,
    pub chunk_id: String,
    pub section_path: Vec<String>,
    pub sentence_ids: Vec<String>,
    pub snippet: String,
}

/// One step of the reasoning chain, as a first-class value for the caller
/// to render (never smuggled through the answer text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub claim_id: String,
    pub text: String,
    pub relation_to_parent: Option<ClaimRelationKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// None when generation was unavailable (timeout) or rejected.
    pub answer: Option<String>,
    pub themes: Vec<ThemeSummary>,
    pub evidence: Vec<EvidenceItem>,
    pub reasoning_chain: Vec<ReasoningStep>,
    pub insufficient_evidence: bool,
}

/// A recalled or traversed claim with its rank score.
#[derive(Debug, Clone)]
struct RankedClaim {
    node: NodeRecord,
    score: f32,
    relation_to_parent: Option<ClaimRelationKind>,
}

pub struct QueryService {
    ctx: PipelineContext,
    last_good_themes: Arc<RwLock<Vec<ThemeSummary>>>,
}

impl QueryService {
    pub fn new(ctx: PipelineContext) -> Self {
        QueryService {
            ctx,
            last_good_themes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, LoomError> {
        let ctx = &self.ctx;
        ctx.check_cancelled()?;
        let retrieval = &ctx.config.retrieval;
        let top_k = request.top_k.unwrap_or(retrieval.top_k).max(1);
        let question_vec = ctx.embed_one(&request.question).await?;

        // ── Theme-first recall ─────────────────────────────────────
        let themes = if request.mode == QueryMode::Local {
            Vec::new()
        } else {
            match ctx
                .store()
                .vector_search(NodeLabel::Theme, &question_vec, retrieval.theme_top_n)
                .await
            {
                Ok(hits) => {
                    let themes: Vec<ThemeSummary> = hits
                        .iter()
                        .map(|(node, _)| ThemeSummary {
                            id: node.id.clone(),
                            label: node.prop_str("label").unwrap_or_default().to_string(),
                            summary: node.prop_str("summary").unwrap_or_default().to_string(),
                        })
                        .collect();
                    *self.last_good_themes.write() = themes.clone();
                    themes
                }
                Err(err) => {
                    // Store unreachable: serve the cached themes best-effort.
                    tracing::warn!("theme recall failed, serving cached themes: {err}");
                    self.last_good_themes.read().clone()
                }
            }
        };

        if request.mode == QueryMode::Global {
            return self.answer_global(&request.question, themes).await;
        }

        // ── Vector recall ──────────────────────────────────────────
        let mut ranked: FxHashMap<String, RankedClaim> = FxHashMap::default();
        let chunk_hits = ctx
            .store()
            .vector_search(NodeLabel::Chunk, &question_vec, top_k)
            .await?;
        for (node, score) in ctx
            .store()
            .vector_search(NodeLabel::Claim, &question_vec, top_k)
            .await?
        {
            let node = self.follow_redirect(node).await?;
            ranked
                .entry(node.id.clone())
                .and_modify(|r| r.score = r.score.max(score))
                .or_insert(RankedClaim {
                    node,
                    score,
                    relation_to_parent: None,
                });
        }

        // Theme members join the frontier with a mild score; member
        // concepts seed the definitional-context walk below.
        let mut context_concepts: Vec<String> = Vec::new();
        for theme in &themes {
            for (_, member) in ctx
                .store()
                .neighbors(&theme.id, &[edge::BELONGS_TO_THEME.to_string()], Direction::In)
                .await?
            {
                match member.label {
                    NodeLabel::Claim => {
                        let member = self.follow_redirect(member).await?;
                        ranked.entry(member.id.clone()).or_insert(RankedClaim {
                            node: member,
                            score: 0.5,
                            relation_to_parent: None,
                        });
                    }
                    NodeLabel::Concept => context_concepts.push(member.id.clone()),
                    _ => {}
                }
            }
        }

        // ── Graph expansion ────────────────────────────────────────
        let chain_kinds: Vec<String> = CHAIN_KINDS.iter().map(|k| k.as_str().to_string()).collect();
        let mut frontier: Vec<String> = ranked.keys().cloned().collect();
        frontier.sort();
        for _hop in 0..retrieval.max_hops {
            let mut next_frontier = Vec::new();
            for id in &frontier {
                let origin_score = ranked.get(id).map(|r| r.score).unwrap_or(0.3);
                for (rel_edge, neighbor) in ctx
                    .store()
                    .neighbors(id, &chain_kinds, Direction::Both)
                    .await?
                {
                    if neighbor.label != NodeLabel::Claim {
                        continue;
                    }
                    let neighbor = self.follow_redirect(neighbor).await?;
                    let confidence = rel_edge
                        .props
                        .get("confidence")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.5) as f32;
                    let score = origin_score * confidence * 0.7;
                    let kind = ClaimRelationKind::parse(&rel_edge.kind);
                    match ranked.get_mut(&neighbor.id) {
                        Some(existing) => existing.score = existing.score.max(score),
                        None => {
                            next_frontier.push(neighbor.id.clone());
                            ranked.insert(
                                neighbor.id.clone(),
                                RankedClaim {
                                    node: neighbor,
                                    score,
                                    relation_to_parent: kind,
                                },
                            );
                        }
                    }
                }
            }
            next_frontier.sort();
            frontier = next_frontier;
            if frontier.is_empty() {
                break;
            }
        }

        // ── Evidence assembly ──────────────────────────────────────
        let mut chain: Vec<RankedClaim> = ranked.into_values().collect();
        chain.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        chain.truncate(top_k);

        let mut evidence: Vec<EvidenceItem> = Vec::new();
        let mut cited_chunks: FxHashSet<String> = FxHashSet::default();
        for claim in &chain {
            if let Some(item) = self.evidence_for(&claim.node).await? {
                cited_chunks.insert(item.chunk_id.clone());
                evidence.push(item);
            }
        }
        // Definitional context: walk whitelisted concept-concept predicates
        // from the theme's member concepts and cite their source chunks.
        let whitelist: Vec<String> = ctx
            .governor_state
            .snapshot()
            .whitelist
            .iter()
            .cloned()
            .collect();
        context_concepts.sort();
        context_concepts.dedup();
        let mut concept_frontier = context_concepts;
        let mut seen_concepts: FxHashSet<String> = concept_frontier.iter().cloned().collect();
        for _hop in 0..retrieval.max_hops {
            let mut next = Vec::new();
            for concept_id in &concept_frontier {
                for (_, neighbor) in ctx
                    .store()
                    .neighbors(concept_id, &whitelist, Direction::Both)
                    .await?
                {
                    if neighbor.label == NodeLabel::Concept && seen_concepts.insert(neighbor.id.clone())
                    {
                        next.push(neighbor.id);
                    }
                }
            }
            next.sort();
            concept_frontier = next;
            if concept_frontier.is_empty() {
                break;
            }
        }
        let mut sorted_concepts: Vec<String> = seen_concepts.into_iter().collect();
        sorted_concepts.sort();
        for concept_id in sorted_concepts {
            if evidence.len() >= top_k * 2 {
                break;
            }
            let Some(concept) = ctx.store().get_node(&concept_id).await? else {
                continue;
            };
            if let Some(item) = self.evidence_for(&concept).await?
                && !cited_chunks.contains(&item.chunk_id)
            {
                cited_chunks.insert(item.chunk_id.clone());
                evidence.push(item);
            }
        }

        // Recalled chunks complete the picture where no claim cites them.
        for (node, _) in chunk_hits {
            if cited_chunks.contains(&node.id) || evidence.len() >= top_k * 2 {
                continue;
            }
            evidence.push(chunk_evidence(&node));
        }
        for (i, item) in evidence.iter_mut().enumerate() {
            item.anchor = format!("E{}", i + 1);
        }

        let reasoning_chain: Vec<ReasoningStep> = chain
            .iter()
            .map(|claim| ReasoningStep {
                claim_id: claim.node.id.clone(),
                text: claim.node.prop_str("text").unwrap_or_default().to_string(),
                relation_to_parent: claim.relation_to_parent,
            })
            .collect();

        if evidence.is_empty() {
            return Ok(QueryResponse {
                answer: None,
                themes,
                evidence,
                reasoning_chain,
                insufficient_evidence: true,
            });
        }

        // ── Scoped generation ──────────────────────────────────────
        self.answer_anchored(&request.question, themes, evidence, reasoning_chain)
            .await
    }

    /// A claim with a `canonical_id` is a redirect shell; readers follow it
    /// (the chain is at most one hop by construction).
    async fn follow_redirect(&self, node: NodeRecord) -> Result<NodeRecord, LoomError> {
        let Some(canonical_id) = node.prop_str("canonical_id") else {
            return Ok(node);
        };
        match self.ctx.store().get_node(canonical_id).await? {
            Some(target) => Ok(target),
            None => Ok(node),
        }
    }

    /// Resolve a node's EVIDENCE_FROM edge into a citable item.
    async fn evidence_for(&self, node: &NodeRecord) -> Result<Option<EvidenceItem>, LoomError> {
        let hits = self
            .ctx
            .store()
            .neighbors(&node.id, &[edge::EVIDENCE_FROM.to_string()], Direction::Out)
            .await?;
        let Some((evidence_edge, chunk)) = hits.first() else {
            return Ok(None);
        };
        let sentence_ids: Vec<String> = evidence_edge
            .props
            .get("sentence_ids")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(EvidenceItem {
            anchor: String::new(),
            doc_id: evidence_edge
                .props
                .get("doc_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            chunk_id: chunk.id.clone(),
            section_path: evidence_edge
                .props
                .get("section_path")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            snippet: minimal_snippet(chunk, &sentence_ids),
            sentence_ids,
        }))
    }

    async fn answer_global(
        &self,
        question: &str,
        themes: Vec<ThemeSummary>,
    ) -> Result<QueryResponse, LoomError> {
        if themes.is_empty() {
            return Ok(QueryResponse {
                answer: None,
                themes,
                evidence: Vec::new(),
                reasoning_chain: Vec::new(),
                insufficient_evidence: true,
            });
        }
        let theme_text = themes
            .iter()
            .map(|t| format!("{}: {}", t.label, t.summary))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Answer the question from these theme summaries only, coarsely.\n\
             Question: {question}\nThemes:\n{theme_text}"
        );
        let answer = match self.ctx.chat(vec![ChatMessage::user(prompt)]).await {
            Ok(text) => Some(text),
            Err(LoomError::Timeout { .. }) => None,
            Err(err) => return Err(err),
        };
        Ok(QueryResponse {
            answer,
            themes,
            evidence: Vec::new(),
            reasoning_chain: Vec::new(),
            insufficient_evidence: false,
        })
    }

    async fn answer_anchored(
        &self,
        question: &str,
        themes: Vec<ThemeSummary>,
        evidence: Vec<EvidenceItem>,
        reasoning_chain: Vec<ReasoningStep>,
    ) -> Result<QueryResponse, LoomError> {
        let ctx = &self.ctx;
        let theme_text = themes
            .iter()
            .map(|t| format!("{}: {}", t.label, t.summary))
            .collect::<Vec<_>>()
            .join("\n");
        let claim_text = reasoning_chain
            .iter()
            .map(|step| match step.relation_to_parent {
                Some(kind) => format!("- ({}) {}", kind.as_str(), step.text),
                None => format!("- {}", step.text),
            })
            .collect::<Vec<_>>()
            .join("\n");
        let evidence_text = evidence
            .iter()
            .map(|item| format!("[{}] {}", item.anchor, item.snippet))
            .collect::<Vec<_>>()
            .join("\n");

        let base_prompt = ctx
            .config
            .prompts
            .answer
            .replace("{question}", question)
            .replace("{themes}", &theme_text)
            .replace("{claims}", &claim_text)
            .replace("{evidence}", &evidence_text);

        let mut attempt = 0;
        let mut prompt = base_prompt;
        loop {
            let reply = match ctx.chat(vec![ChatMessage::user(prompt.clone())]).await {
                Ok(text) => text,
                Err(LoomError::Timeout { .. }) => {
                    // Model unavailable: structured retrieval result only.
                    return Ok(QueryResponse {
                        answer: None,
                        themes,
                        evidence,
                        reasoning_chain,
                        insufficient_evidence: false,
                    });
                }
                Err(err) => return Err(err),
            };

            if reply.trim().eq_ignore_ascii_case("insufficient evidence") {
                return Ok(QueryResponse {
                    answer: None,
                    themes,
                    evidence,
                    reasoning_chain,
                    insufficient_evidence: true,
                });
            }

            let rejected = unanchored_sentences(&reply, evidence.len());
            if rejected.is_empty() {
                return Ok(QueryResponse {
                    answer: Some(reply),
                    themes,
                    evidence,
                    reasoning_chain,
                    insufficient_evidence: false,
                });
            }
            if attempt >= ctx.config.retrieval.anchor_retries {
                tracing::warn!(
                    rejected = rejected.len(),
                    "anchor retries exhausted, returning insufficient evidence"
                );
                return Ok(QueryResponse {
                    answer: None,
                    themes,
                    evidence,
                    reasoning_chain,
                    insufficient_evidence: true,
                });
            }
            attempt += 1;
            prompt = ctx
                .config
                .prompts
                .answer_retry
                .replace("{question}", question)
                .replace("{themes}", &theme_text)
                .replace("{claims}", &claim_text)
                .replace("{evidence}", &evidence_text)
                .replace("{rejected}", &rejected.join(" | "));
        }
    }
}

/// Sentences of the reply that cite no valid anchor. Valid means `[E«n»]`
/// with 1 ≤ n ≤ evidence count.
fn unanchored_sentences(reply: &str, evidence_count: usize) -> Vec<String> {
    split_sentences(reply)
        .into_iter()
        .filter(|span| {
            let mut anchors = ANCHOR.captures_iter(&span.text).peekable();
            if anchors.peek().is_none() {
                return true;
            }
            !anchors.all(|captures| {
                captures
                    .get(1)
                    .and_then(|m| m.as_str().parse::<usize>().ok())
                    .is_some_and(|n| n >= 1 && n <= evidence_count)
            })
        })
        .map(|span| span.text)
        .collect()
}

/// Minimal sentence window of a chunk covering `sentence_ids`.
fn minimal_snippet(chunk: &NodeRecord, sentence_ids: &[String]) -> String {
    let text = chunk.prop_str("text").unwrap_or_default();
    let all_ids = chunk.prop_strings("sentence_ids");
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return text.to_string();
    }
    let positions: Vec<usize> = sentence_ids
        .iter()
        .filter_map(|id| all_ids.iter().position(|candidate| candidate == id))
        .filter(|&p| p < sentences.len())
        .collect();
    let (Some(&first), Some(&last)) = (positions.iter().min(), positions.iter().max()) else {
        return text.to_string();
    };
    sentences[first..=last]
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

fn chunk_evidence(chunk: &NodeRecord) -> EvidenceItem {
    let sentence_ids = chunk.prop_strings("sentence_ids");
    let text = chunk.prop_str("text").unwrap_or_default();
    let snippet = split_sentences(text)
        .into_iter()
        .take(2)
        .map(|s| s.text)
        .collect::<Vec<_>>()
        .join(" ");
    EvidenceItem {
        anchor: String::new(),
        doc_id: chunk.prop_str("doc_id").unwrap_or_default().to_string(),
        chunk_id: chunk.id.clone(),
        section_path: chunk.prop_strings("section_path"),
        sentence_ids,
        snippet: if snippet.is_empty() {
            text.to_string()
        } else {
            snippet
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchored_sentences_pass_validation() {
        let rejected = unanchored_sentences("Transformers use attention [E1]. They scale well [E2].", 2);
        assert!(rejected.is_empty());
    }

    #[test]
    fn missing_anchor_is_rejected() {
        let rejected = unanchored_sentences("Transformers use attention [E1]. They scale well.", 2);
        assert_eq!(rejected, vec!["They scale well.".to_string()]);
    }

    #[test]
    fn out_of_range_anchor_is_rejected() {
        let rejected = unanchored_sentences("Attention is enough [E7].", 2);
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn snippet_covers_minimal_window() {
        let mut props = crate::model::JsonMap::new();
        props.insert(
            "text".to_string(),
            serde_json::json!("One here. Two here. Three here. Four here."),
        );
        props.insert(
            "sentence_ids".to_string(),
            serde_json::json!(["s4", "s5", "s6", "s7"]),
        );
        let chunk = NodeRecord {
            id: "chk-1".to_string(),
            label: NodeLabel::Chunk,
            props,
            build_version: "v1".to_string(),
        };
        let snippet = minimal_snippet(&chunk, &["s5".to_string(), "s6".to_string()]);
        assert_eq!(snippet, "Two here. Three here.");
    }
}

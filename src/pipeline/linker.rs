//! Stage 2: multi-retrieval entity linking with ontology gating.
//!
//! For every mention found in a chunk's (resolved) text, three candidate
//! routes are unioned (alias-dictionary lookup, lexical recall over
//! concept names/descriptions, vector recall over concept embeddings),
//! then a weighted rerank picks a winner:
//!
//! ```text
//! mention ──► alias dict ─┐
//!         ──► lexical    ─┼─► rerank(text, vector, context, co-occurrence,
//!         ──► vector     ─┘          prior, type) ─► accept | review | NIL
//! ```
//!
//! Scores at or above `high_threshold` link outright; the band down to
//! `low_threshold` links with `is_review`; below that the mention is NIL
//! and a new concept is proposed under its canonical form (materialized
//! only at persistence, where the unique-name constraint dedups it).
//! Candidates whose ontology type hard-conflicts with the mention context
//! are dropped before scoring.

use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::LazyLock;

use crate::config::LinkingConfig;
use crate::context::PipelineContext;
use crate::model::{
    Chunk, Concept, EntityLink, Evidence, MentionSpan, NodeLabel, ProposedTriple,
};
use crate::ontology::TypeCompatibility;
use crate::pipeline::coref::CorefOutcome;
use crate::store::{Direction, NodeRecord};
use crate::text::{split_sentences, text_similarity, token_overlap};
use crate::types::LoomError;

/// ASCII mention shapes: acronyms with optional digits ("XYZ123", "GPT"),
/// capitalized phrases ("Vision Transformer").
static ASCII_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][A-Z0-9]{1,15}\b|\b[A-Z][a-z][A-Za-z0-9\-]*(?:\s[A-Z][A-Za-z0-9\-]+)*\b")
        .unwrap()
});

/// Unsegmented CJK runs; split on functional characters afterwards.
static HAN_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\p{Han}]{2,24}").unwrap());

/// Functional characters that separate CJK noun fragments.
const HAN_SPLIT_CHARS: &[char] = &[
    '的', '了', '是', '在', '这', '那', '一', '个', '种', '为', '与', '和', '或', '及', '对',
    '从', '被', '比', '等', '也', '很', '中', '可', '以', '能', '将', '于', '把', '有',
];

/// Generic nouns and determiners that are never useful mentions.
const MENTION_STOPWORDS: &[&str] = &[
    "The", "This", "That", "These", "Those", "It", "They", "We", "An", "In", "On", "At", "For",
    "But", "And", "Not", "All", "Its", "Our", "His", "Her", "概念", "技术", "方法", "系统",
    "问题", "东西", "方面", "情况", "全新", "重要", "研究", "内容", "部分", "可以", "处理",
];

/// A detected mention before linking.
#[derive(Debug, Clone)]
struct Mention {
    surface: String,
    canonical: String,
    sentence_index: usize,
    sentence_id: String,
    start: usize,
    end: usize,
}

/// A candidate concept pulled from one of the retrieval routes.
#[derive(Debug, Clone)]
struct Candidate {
    id: String,
    name: String,
    description: String,
    category: String,
    importance: f32,
    vector_score: Option<f32>,
    from_alias: bool,
}

impl Candidate {
    fn from_node(node: &NodeRecord) -> Self {
        Candidate {
            id: node.id.clone(),
            name: node.prop_str("name").unwrap_or_default().to_string(),
            description: node.prop_str("description").unwrap_or_default().to_string(),
            category: node.prop_str("category").unwrap_or_default().to_string(),
            importance: node.prop_f64("importance").unwrap_or(0.5) as f32,
            vector_score: None,
            from_alias: false,
        }
    }
}

/// Stage output: links with evidence, NIL concept proposals, and predicate
/// triples deferred to the governor.
#[derive(Debug, Clone, Default)]
pub struct LinkerOutput {
    pub links: Vec<EntityLink>,
    pub proposed_concepts: Vec<Concept>,
    pub triples: Vec<ProposedTriple>,
}

/// Link every mention in the chunk.
pub async fn link_chunk(
    ctx: &PipelineContext,
    chunk: &Chunk,
    coref: &CorefOutcome,
) -> Result<LinkerOutput, LoomError> {
    ctx.check_cancelled()?;
    let config = &ctx.config.linking;
    let text = chunk.effective_text().to_string();
    let sentences = split_sentences(&text);
    if sentences.is_empty() {
        return Ok(LinkerOutput::default());
    }

    let alias_snapshot = ctx.aliases.snapshot();
    let mentions = detect_mentions(&text, &sentences, chunk, coref, &alias_snapshot);
    if mentions.is_empty() {
        return Ok(LinkerOutput::default());
    }

    // One concept fetch per chunk feeds the lexical route.
    let all_concepts = ctx.store().nodes_by_label(NodeLabel::Concept).await?;
    let live_concepts: Vec<Candidate> = all_concepts
        .iter()
        .filter(|node| node.prop_str("merged_into").is_none())
        .map(Candidate::from_node)
        .collect();

    // Batch-embed the distinct canonical forms for the vector route.
    let distinct: Vec<String> = {
        let mut seen = FxHashSet::default();
        mentions
            .iter()
            .filter(|m| seen.insert(m.canonical.clone()))
            .map(|m| m.canonical.clone())
            .collect()
    };
    let mention_vectors: FxHashMap<String, Vec<f32>> = if ctx.config.enable_vector_search {
        let vectors = ctx.embed(&distinct).await?;
        distinct.iter().cloned().zip(vectors).collect()
    } else {
        FxHashMap::default()
    };

    let mut output = LinkerOutput::default();
    // canonical form → resolved concept id, shared across the chunk so
    // mentions that normalize identically link identically.
    let mut resolved_in_chunk: FxHashMap<String, String> = FxHashMap::default();
    let mut linked_ids: Vec<String> = Vec::new();
    let mut proposed_names: FxHashSet<String> = FxHashSet::default();

    for mention in &mentions {
        ctx.check_cancelled()?;
        let span = MentionSpan {
            sentence_id: mention.sentence_id.clone(),
            start: mention.start,
            end: mention.end,
        };

        if let Some(existing) = resolved_in_chunk.get(&mention.canonical) {
            output.links.push(EntityLink {
                mention: mention.surface.clone(),
                concept_id: Some(existing.clone()),
                is_nil: false,
                proposed_name: None,
                confidence: 1.0,
                is_review: false,
                span,
            });
            continue;
        }

        let candidates = gather_candidates(
            ctx,
            mention,
            &live_concepts,
            mention_vectors.get(&mention.canonical),
            config,
        )
        .await?;

        let sentence_text = &sentences[mention.sentence_index].text;
        let mention_type = ctx.ontology.infer_type(sentence_text);
        let mut scored: Vec<(Candidate, f32)> = Vec::new();
        for candidate in candidates {
            let Some(score) = rerank(
                ctx,
                mention,
                &candidate,
                mention_type,
                chunk.embedding.as_deref(),
                &linked_ids,
                config,
            )
            .await?
            else {
                continue;
            };
            scored.push((candidate, score));
        }
        // Ties break by id so reruns link identically.
        scored.sort_by(|(ca, sa), (cb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ca.id.cmp(&cb.id))
        });
        let best = scored.into_iter().next();

        match best {
            Some((candidate, score)) if score >= config.low_threshold => {
                let is_review = score < config.high_threshold;
                resolved_in_chunk.insert(mention.canonical.clone(), candidate.id.clone());
                linked_ids.push(candidate.id.clone());
                output.links.push(EntityLink {
                    mention: mention.surface.clone(),
                    concept_id: Some(candidate.id),
                    is_nil: false,
                    proposed_name: None,
                    confidence: score,
                    is_review,
                    span,
                });
            }
            _ => {
                // NIL: propose a new concept under the canonical form.
                let mut proposed = Concept::proposed(&mention.canonical, "general");
                proposed.description = sentence_text.clone();
                if let Some(vector) = mention_vectors.get(&mention.canonical) {
                    proposed.embedding = Some(vector.clone());
                }
                let proposed_id = proposed.id.clone();
                if proposed_names.insert(mention.canonical.clone()) {
                    output.proposed_concepts.push(proposed);
                }
                resolved_in_chunk.insert(mention.canonical.clone(), proposed_id.clone());
                linked_ids.push(proposed_id.clone());
                output.links.push(EntityLink {
                    mention: mention.surface.clone(),
                    concept_id: Some(proposed_id),
                    is_nil: true,
                    proposed_name: Some(mention.canonical.clone()),
                    confidence: 0.0,
                    is_review: false,
                    span,
                });
            }
        }
    }

    output.triples = extract_triples(ctx, chunk, &text, &sentences, &mentions, &resolved_in_chunk);
    tracing::debug!(
        chunk_id = %chunk.id,
        mentions = mentions.len(),
        links = output.links.len(),
        nils = output.links.iter().filter(|l| l.is_nil).count(),
        "entity linking finished"
    );
    Ok(output)
}

fn detect_mentions(
    text: &str,
    sentences: &[crate::text::SentenceSpan],
    chunk: &Chunk,
    coref: &CorefOutcome,
    aliases: &crate::aliases::AliasSnapshot,
) -> Vec<Mention> {
    let mut raw: Vec<(String, usize, usize)> = Vec::new();

    for m in ASCII_MENTION.find_iter(text) {
        let surface = m.as_str();
        if MENTION_STOPWORDS.contains(&surface) {
            continue;
        }
        raw.push((surface.to_string(), m.start(), m.end()));
    }
    for run in HAN_RUN.find_iter(text) {
        let run_str = run.as_str();
        let mut cursor = 0_usize;
        for fragment in run_str.split(HAN_SPLIT_CHARS) {
            let position = run_str[cursor..]
                .find(fragment)
                .map_or(cursor, |i| cursor + i);
            cursor = position + fragment.len();
            if let Some(separator) = run_str[cursor..].chars().next() {
                cursor += separator.len_utf8();
            }
            if fragment.chars().count() >= 2 && !MENTION_STOPWORDS.contains(&fragment) {
                let start = run.start() + position;
                raw.push((fragment.to_string(), start, start + fragment.len()));
            }
        }
    }
    // Known alias surfaces are guaranteed mentions even when the shape
    // heuristics would miss them.
    let mut known_surfaces: Vec<&str> = coref.alias_map.iter().map(|(s, _)| s.as_str()).collect();
    known_surfaces.extend(aliases.surfaces());
    for surface in known_surfaces {
        if surface.chars().count() < 2 {
            continue;
        }
        for (start, _) in text.match_indices(surface) {
            let end = start + surface.len();
            if !raw.iter().any(|(_, s, e)| *s == start && *e == end) {
                raw.push((surface.to_string(), start, end));
            }
        }
    }

    raw.sort_by_key(|(_, start, _)| *start);
    raw.dedup_by(|(_, s1, e1), (_, s2, e2)| s1 == s2 && e1 == e2);
    // Drop mentions nested inside a longer one.
    let spans: Vec<(usize, usize)> = raw.iter().map(|(_, s, e)| (*s, *e)).collect();
    raw.retain(|(_, start, end)| {
        !spans
            .iter()
            .any(|(s, e)| (s < start && end <= e) || (s <= start && end < e))
    });

    raw.into_iter()
        .map(|(surface, start, end)| {
            let sentence_index = sentences
                .iter()
                .position(|s| start < s.end)
                .unwrap_or(sentences.len() - 1);
            let canonical = coref
                .alias_map
                .iter()
                .find(|(s, _)| s == &surface)
                .map(|(_, c)| c.clone())
                .or_else(|| {
                    aliases
                        .resolve(&surface, Some(&chunk.doc_id))
                        .map(|entry| entry.canonical.clone())
                })
                .unwrap_or_else(|| surface.clone());
            Mention {
                surface,
                canonical,
                sentence_index,
                sentence_id: chunk
                    .sentence_ids
                    .get(sentence_index)
                    .cloned()
                    .unwrap_or_else(|| format!("s{sentence_index}")),
                start,
                end,
            }
        })
        .collect()
}

async fn gather_candidates(
    ctx: &PipelineContext,
    mention: &Mention,
    live_concepts: &[Candidate],
    mention_vector: Option<&Vec<f32>>,
    config: &LinkingConfig,
) -> Result<Vec<Candidate>, LoomError> {
    let mut by_id: FxHashMap<String, Candidate> = FxHashMap::default();

    // Route 1: alias dictionary / exact name. Redirect shells left behind
    // by merges never come back as candidates.
    for name in [&mention.canonical, &mention.surface] {
        if let Some(node) = ctx.store().find_node(NodeLabel::Concept, "name", name).await?
            && node.prop_str("merged_into").is_none()
        {
            let mut candidate = Candidate::from_node(&node);
            candidate.from_alias = true;
            by_id.insert(candidate.id.clone(), candidate);
        }
    }

    // Route 2: lexical recall over names and descriptions.
    let mut lexical: Vec<(f32, &Candidate)> = live_concepts
        .iter()
        .map(|c| {
            let name_score = token_overlap(&mention.canonical, &c.name)
                .max(text_similarity(&mention.canonical, &c.name));
            let description_score = token_overlap(&mention.canonical, &c.description);
            (name_score * 0.8 + description_score * 0.2, c)
        })
        .filter(|(score, _)| *score > 0.1)
        .collect();
    lexical.sort_by(|(a, ca), (b, cb)| {
        b.partial_cmp(a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ca.id.cmp(&cb.id))
    });
    for (_, candidate) in lexical.into_iter().take(config.candidate_top_k) {
        by_id.entry(candidate.id.clone()).or_insert_with(|| candidate.clone());
    }

    // Route 3: vector recall.
    if let Some(vector) = mention_vector {
        let hits = ctx
            .store()
            .vector_search(NodeLabel::Concept, vector, config.candidate_top_k)
            .await?;
        for (node, score) in hits {
            if node.prop_str("merged_into").is_some() {
                continue;
            }
            let entry = by_id
                .entry(node.id.clone())
                .or_insert_with(|| Candidate::from_node(&node));
            entry.vector_score = Some(score);
        }
    }

    Ok(by_id.into_values().collect())
}

/// Blend the rerank features. Returns `None` when the ontology hard-rejects
/// the candidate.
async fn rerank(
    ctx: &PipelineContext,
    mention: &Mention,
    candidate: &Candidate,
    mention_type: Option<&str>,
    chunk_embedding: Option<&[f32]>,
    linked_ids: &[String],
    config: &LinkingConfig,
) -> Result<Option<f32>, LoomError> {
    let type_score = match ctx.ontology.compatibility(mention_type, &candidate.category) {
        TypeCompatibility::HardViolation => return Ok(None),
        TypeCompatibility::Score(score) => score,
    };

    let text_score = text_similarity(&mention.canonical, &candidate.name)
        .max(text_similarity(&mention.surface, &candidate.name));
    let vector_score = candidate.vector_score.unwrap_or(0.0).clamp(0.0, 1.0);
    let context_score = match (chunk_embedding, ctx.store().node_embedding(&candidate.id).await?) {
        (Some(chunk_vec), Some(concept_vec)) => {
            crate::text::cosine_similarity(chunk_vec, &concept_vec).clamp(0.0, 1.0)
        }
        _ => 0.5,
    };
    let cooccurrence = if linked_ids.is_empty() {
        0.0
    } else {
        let neighbors = ctx
            .store()
            .neighbors(&candidate.id, &[], Direction::Both)
            .await?;
        let neighbor_ids: FxHashSet<&str> = neighbors
            .iter()
            .map(|(_, node)| node.id.as_str())
            .collect();
        let shared = linked_ids
            .iter()
            .filter(|id| neighbor_ids.contains(id.as_str()))
            .count();
        shared as f32 / linked_ids.len() as f32
    };

    let w = &config.weights;
    let weight_sum =
        w.text + w.vector + w.context + w.cooccurrence + w.prior + w.type_compatibility;
    if weight_sum <= 0.0 {
        return Ok(Some(0.0));
    }
    let mut score = (w.text * text_score
        + w.vector * vector_score
        + w.context * context_score
        + w.cooccurrence * cooccurrence
        + w.prior * candidate.importance.clamp(0.0, 1.0)
        + w.type_compatibility * type_score)
        / weight_sum;

    // The alias dictionary and exact name equality are authoritative: alias
    // canonicalization guarantees one concept per canonical entity.
    if candidate.from_alias && candidate.name == mention.canonical {
        score = score.max(0.95);
    } else if candidate.name.eq_ignore_ascii_case(&mention.canonical) {
        score = score.max(0.9);
    }
    Ok(Some(score.clamp(0.0, 1.0)))
}

/// Pull `(subject, predicate_surface, object)` triples where both sides are
/// linked mentions in the same sentence and a known predicate surface sits
/// between them. Everything else is deferred to claim extraction.
fn extract_triples(
    ctx: &PipelineContext,
    chunk: &Chunk,
    text: &str,
    sentences: &[crate::text::SentenceSpan],
    mentions: &[Mention],
    resolved: &FxHashMap<String, String>,
) -> Vec<ProposedTriple> {
    let surfaces: Vec<&String> = ctx.config.governor.surface_map.keys().collect();
    let mut triples = Vec::new();

    for (sentence_index, _) in sentences.iter().enumerate() {
        let in_sentence: Vec<&Mention> = mentions
            .iter()
            .filter(|m| m.sentence_index == sentence_index)
            .collect();
        for pair in in_sentence.windows(2) {
            let (subject, object) = (pair[0], pair[1]);
            if subject.end >= object.start {
                continue;
            }
            let between = &text[subject.end..object.start];
            let Some(surface) = surfaces
                .iter()
                .find(|s| between.contains(s.as_str()))
                .map(|s| s.to_string())
            else {
                continue;
            };
            let (Some(subject_id), Some(object_id)) = (
                resolved.get(&subject.canonical),
                resolved.get(&object.canonical),
            ) else {
                continue;
            };
            if subject_id == object_id {
                continue;
            }
            triples.push(ProposedTriple {
                subject: subject_id.clone(),
                predicate_surface: surface,
                object: object_id.clone(),
                confidence: 0.6,
                evidence: Evidence {
                    doc_id: chunk.doc_id.clone(),
                    chunk_id: chunk.id.clone(),
                    section_path: chunk.section_path.clone(),
                    sentence_ids: vec![subject.sentence_id.clone()],
                },
            });
        }
    }
    triples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aliases::AliasEntry;
    use crate::config::GraphLoomConfig;
    use crate::model::BuildVersion;
    use crate::providers::{MockChatProvider, MockEmbeddingProvider};
    use crate::store::MemoryGraphStore;
    use std::sync::Arc;

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

    fn chunk_of(text: &str) -> Chunk {
        let count = split_sentences(text).len().max(1);
        Chunk {
            id: "chk-1".to_string(),
            doc_id: "doc-1".to_string(),
            text: text.to_string(),
            resolved_text: None,
            section_path: vec![],
            page_num: None,
            sentence_ids: (0..count).map(|n| format!("s{n}")).collect(),
            window_start: 0,
            window_end: count,
            embedding: None,
        }
    }

    fn no_coref() -> CorefOutcome {
        CorefOutcome::skip()
    }

    #[tokio::test]
    async fn unknown_mention_with_empty_store_is_nil() {
        let ctx = context().await;
        let chunk = chunk_of("这是一个全新的概念 XYZ123。");
        let output = link_chunk(&ctx, &chunk, &no_coref()).await.unwrap();

        assert_eq!(output.links.len(), 1, "exactly one link expected");
        let link = &output.links[0];
        assert!(link.is_nil);
        assert_eq!(link.mention, "XYZ123");
        assert_eq!(link.proposed_name.as_deref(), Some("XYZ123"));
        assert_eq!(output.proposed_concepts.len(), 1);
        assert_eq!(output.proposed_concepts[0].name, "XYZ123");
    }

    #[tokio::test]
    async fn alias_resolved_mention_links_with_high_confidence() {
        let ctx = context().await;
        let version = BuildVersion::from_tag("v1");
        let mut concept = Concept::proposed("人工智能", "general");
        concept.description = "Artificial intelligence technology.".to_string();
        let concept_id = ctx
            .graph
            .upsert_concept(&concept, None, &version)
            .await
            .unwrap();
        ctx.aliases
            .insert(AliasEntry::global("AI", "人工智能", 0.95));

        let chunk = chunk_of("AI systems learn from data.");
        let output = link_chunk(&ctx, &chunk, &no_coref()).await.unwrap();

        let link = output
            .links
            .iter()
            .find(|l| l.mention == "AI")
            .expect("alias surface must be a mention");
        assert!(!link.is_nil);
        assert_eq!(link.concept_id.as_deref(), Some(concept_id.as_str()));
        assert!(link.confidence >= ctx.config.linking.high_threshold);
        assert!(!link.is_review);
    }

    #[tokio::test]
    async fn identical_mentions_share_one_link_target() {
        let ctx = context().await;
        let chunk = chunk_of("GraphBolt is new. We like GraphBolt a lot.");
        let output = link_chunk(&ctx, &chunk, &no_coref()).await.unwrap();

        let ids: FxHashSet<_> = output
            .links
            .iter()
            .filter(|l| l.mention == "GraphBolt")
            .map(|l| l.concept_id.clone().unwrap())
            .collect();
        assert_eq!(ids.len(), 1, "same surface links to one concept");
        assert_eq!(output.proposed_concepts.len(), 1);
    }

    #[tokio::test]
    async fn predicate_surface_between_linked_mentions_yields_triple() {
        let ctx = context().await;
        let chunk = chunk_of("Transformer 基于 Attention。");
        let output = link_chunk(&ctx, &chunk, &no_coref()).await.unwrap();

        assert_eq!(output.triples.len(), 1);
        let triple = &output.triples[0];
        assert_eq!(triple.predicate_surface, "基于");
        assert_ne!(triple.subject, triple.object);
        assert_eq!(triple.evidence.chunk_id, "chk-1");
    }

    #[tokio::test]
    async fn mention_evidence_carries_sentence_and_offsets() {
        let ctx = context().await;
        let chunk = chunk_of("First sentence here. BERT appears in the second sentence.");
        let output = link_chunk(&ctx, &chunk, &no_coref()).await.unwrap();

        let link = output
            .links
            .iter()
            .find(|l| l.mention == "BERT")
            .expect("BERT is a mention");
        assert_eq!(link.span.sentence_id, "s1");
        assert_eq!(
            &chunk.text[link.span.start..link.span.end],
            "BERT"
        );
    }
}

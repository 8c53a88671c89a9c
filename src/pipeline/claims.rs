//! Stage 3: claim extraction with inter-claim relations.
//!
//! A window of sentences (wider than the chunking window, so argumentation
//! that spans sentences stays visible) goes to the model with the prompt
//! template from configuration. The reply must match the JSON schema below;
//! a malformed reply gets exactly one repair round-trip, and a second
//! failure drops the window, never the chunk and never the document.
//!
//! Modality is detected lexically before the call and passed as a hint;
//! the model's answer still wins. Claims dedup within a document by
//! normalized-text hash: a repeat becomes a redirect shell pointing at the
//! first occurrence (`canonical_id`), and relation endpoints are eagerly
//! rewritten onto canonical ids so redirect chains never exceed length one.
//!
//! Proposed CAUSES/CONTRADICTS relations pass a rule check standing in for
//! a full NLI scorer: CAUSES needs an explicit causal or temporal marker,
//! CONTRADICTS needs a polarity or negation asymmetry. Failing relations
//! are dropped and recorded in diagnostics.

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::context::PipelineContext;
use crate::diagnostics::{JobDiagnostics, StageName};
use crate::model::{
    Chunk, Claim, ClaimRelation, ClaimRelationKind, ClaimType, EntityLink, Modality, Polarity,
};
use crate::providers::ChatMessage;
use crate::text::{normalize_for_hash, sha256_hex, short_hash, split_sentences, token_overlap};
use crate::types::LoomError;

const HEDGE_MARKERS: &[&str] = &[
    "可能", "或许", "大概", "似乎", "perhaps", "may", "might", "could", "seems", "likely",
    "suggests", "suggest",
];
const SPECULATIVE_MARKERS: &[&str] = &[
    "猜测", "推测", "假设", "假如", "speculate", "hypothesize", "would", "imagine", "if",
];
const CAUSAL_MARKERS: &[&str] = &[
    "因为", "由于", "导致", "因此", "所以", "使得", "引起", "because", "cause", "causes",
    "caused", "causing", "leads to", "led to", "therefore", "due to", "as a result", "results in",
    "after", "then",
];
const NEGATION_MARKERS: &[&str] = &[
    "not", "no", "never", "cannot", "n't", "without", "不", "没有", "不是", "并非", "无法",
];

/// What the model must return for one window.
#[derive(Debug, Deserialize)]
struct LlmClaimsPayload {
    #[serde(default)]
    claims: Vec<LlmClaim>,
    #[serde(default)]
    relations: Vec<LlmRelation>,
}

#[derive(Debug, Deserialize)]
struct LlmClaim {
    text: String,
    claim_type: ClaimType,
    modality: Modality,
    polarity: Polarity,
    certainty: f32,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    sentence_indices: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct LlmRelation {
    src: usize,
    kind: String,
    dst: usize,
    #[serde(default = "default_relation_confidence")]
    confidence: f32,
}

fn default_relation_confidence() -> f32 {
    0.5
}

/// Stage output for one chunk.
#[derive(Debug, Clone, Default)]
pub struct ClaimExtraction {
    pub claims: Vec<Claim>,
    pub relations: Vec<ClaimRelation>,
}

/// Document-scoped dedup state: normalized hash → canonical claim id.
pub type ClaimDedupIndex = FxHashMap<String, String>;

/// Extract claims and relations from one chunk.
pub async fn extract_claims(
    ctx: &PipelineContext,
    chunk: &Chunk,
    links: &[EntityLink],
    dedup: &mut ClaimDedupIndex,
    diagnostics: &mut JobDiagnostics,
) -> Result<ClaimExtraction, LoomError> {
    ctx.check_cancelled()?;
    let sentences = split_sentences(chunk.effective_text());
    if sentences.is_empty() {
        return Ok(ClaimExtraction::default());
    }

    let window_size = ctx.config.claims.window_sentences.max(1);
    let mut extraction = ClaimExtraction::default();

    let mut window_start = 0_usize;
    while window_start < sentences.len() {
        let window_end = (window_start + window_size).min(sentences.len());
        let window = &sentences[window_start..window_end];

        match extract_window(ctx, chunk, links, window, window_start, dedup, diagnostics).await {
            Ok(mut window_output) => {
                extraction.claims.append(&mut window_output.claims);
                extraction.relations.append(&mut window_output.relations);
            }
            Err(LoomError::Cancelled) => return Err(LoomError::Cancelled),
            Err(err) => {
                // Parse/provider failure after the repair retry: the window
                // contributes nothing, the chunk survives.
                diagnostics.record(&chunk.id, StageName::Claims, err.to_string());
            }
        }

        if window_end == sentences.len() {
            break;
        }
        window_start = window_end;
    }
    Ok(extraction)
}

async fn extract_window(
    ctx: &PipelineContext,
    chunk: &Chunk,
    links: &[EntityLink],
    window: &[crate::text::SentenceSpan],
    window_offset: usize,
    dedup: &mut ClaimDedupIndex,
    diagnostics: &mut JobDiagnostics,
) -> Result<ClaimExtraction, LoomError> {
    let window_text = window
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{i}] {}", s.text))
        .collect::<Vec<_>>()
        .join("\n");
    let entity_hints = links
        .iter()
        .filter(|link| !link.is_nil)
        .map(|link| link.mention.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let modality_hint = lexical_modality(&window_text);

    let prompt = ctx
        .config
        .prompts
        .claim_extraction
        .replace("{window_text}", &window_text)
        .replace("{entity_hints}", &entity_hints)
        .replace("{modality_hint}", modality_hint.as_hint());

    let first_reply = ctx.chat(vec![ChatMessage::user(prompt.clone())]).await?;
    let payload = match parse_payload(&first_reply) {
        Ok(payload) => payload,
        Err(parse_err) => {
            // One repair round-trip with the error and the previous output.
            let repair = ctx
                .config
                .prompts
                .claim_repair
                .replace("{previous_output}", &first_reply)
                .replace("{error}", &parse_err);
            let second_reply = ctx
                .chat(vec![ChatMessage::user(prompt), ChatMessage::user(repair)])
                .await?;
            parse_payload(&second_reply).map_err(LoomError::Parse)?
        }
    };

    build_claims(ctx, chunk, window, window_offset, payload, dedup, diagnostics)
}

/// Pull the JSON object out of the reply (models love prose and fences)
/// and validate it against the schema. Never silently coerces.
fn parse_payload(reply: &str) -> Result<LlmClaimsPayload, String> {
    let start = reply.find('{').ok_or("no JSON object in reply")?;
    let end = reply.rfind('}').ok_or("unterminated JSON object")?;
    if end < start {
        return Err("unterminated JSON object".to_string());
    }
    serde_json::from_str(&reply[start..=end]).map_err(|err| err.to_string())
}

fn build_claims(
    ctx: &PipelineContext,
    chunk: &Chunk,
    window: &[crate::text::SentenceSpan],
    window_offset: usize,
    payload: LlmClaimsPayload,
    dedup: &mut ClaimDedupIndex,
    diagnostics: &mut JobDiagnostics,
) -> Result<ClaimExtraction, LoomError> {
    let mut extraction = ClaimExtraction::default();
    // Index in the payload → claim id for relation wiring (canonical when
    // the claim deduped).
    let mut payload_ids: Vec<Option<String>> = Vec::with_capacity(payload.claims.len());

    for llm_claim in payload.claims {
        let text = llm_claim.text.trim().to_string();
        if text.is_empty() {
            payload_ids.push(None);
            continue;
        }
        let normalized_hash = sha256_hex(&[&normalize_for_hash(&text)]);
        let sentence_ids: Vec<String> = {
            let mut ids: Vec<String> = llm_claim
                .sentence_indices
                .iter()
                .filter(|&&i| i < window.len())
                .filter_map(|&i| chunk.sentence_ids.get(window_offset + i).cloned())
                .collect();
            if ids.is_empty() {
                // The claim must stay anchored even when the model forgot
                // its indices; the whole window is the widest honest span.
                ids = window
                    .iter()
                    .enumerate()
                    .filter_map(|(i, _)| chunk.sentence_ids.get(window_offset + i).cloned())
                    .collect();
            }
            ids
        };
        let evidence_span = llm_claim
            .sentence_indices
            .iter()
            .filter(|&&i| i < window.len())
            .map(|&i| window[i].text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let evidence_span = if evidence_span.is_empty() {
            window
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            evidence_span
        };

        let canonical = dedup.get(&normalized_hash).cloned();
        let id = match &canonical {
            // A repeat: deterministic shell id scoped to this chunk.
            Some(_) => format!(
                "clm-{}",
                short_hash(&[&chunk.doc_id, &normalized_hash, &chunk.id])
            ),
            None => format!("clm-{}", short_hash(&[&chunk.doc_id, &normalized_hash])),
        };
        if canonical.is_none() {
            dedup.insert(normalized_hash.clone(), id.clone());
        }

        payload_ids.push(Some(canonical.clone().unwrap_or_else(|| id.clone())));
        extraction.claims.push(Claim {
            id,
            text,
            normalized_text_hash: normalized_hash,
            canonical_id: canonical,
            doc_id: chunk.doc_id.clone(),
            chunk_id: chunk.id.clone(),
            sentence_ids,
            claim_type: llm_claim.claim_type,
            modality: llm_claim.modality,
            polarity: llm_claim.polarity,
            certainty: llm_claim.certainty.clamp(0.0, 1.0),
            confidence: llm_claim.confidence.unwrap_or(0.8).clamp(0.0, 1.0),
            evidence_span,
            embedding: None,
        });
    }

    let claim_by_id = |id: &str| -> Option<&Claim> {
        extraction
            .claims
            .iter()
            .find(|c| c.id == id || c.canonical_id.as_deref() == Some(id))
    };

    for relation in payload.relations {
        let (Some(Some(src)), Some(Some(dst))) = (
            payload_ids.get(relation.src),
            payload_ids.get(relation.dst),
        ) else {
            diagnostics.record(
                &chunk.id,
                StageName::Claims,
                format!("relation references unknown claim index {}→{}", relation.src, relation.dst),
            );
            continue;
        };
        if src == dst {
            continue;
        }
        let Some(kind) = ClaimRelationKind::parse(&relation.kind) else {
            diagnostics.record(
                &chunk.id,
                StageName::Claims,
                format!("relation kind '{}' is outside the closed set", relation.kind),
            );
            continue;
        };

        if ctx.config.claims.relation_checks
            && let Some(reason) = check_relation(kind, claim_by_id(src), claim_by_id(dst))
        {
            diagnostics.record(
                &chunk.id,
                StageName::Claims,
                format!("dropped {} relation: {reason}", kind.as_str()),
            );
            continue;
        }

        extraction.relations.push(ClaimRelation {
            src_claim_id: src.clone(),
            kind,
            dst_claim_id: dst.clone(),
            confidence: relation.confidence.clamp(0.0, 1.0),
        });
    }

    Ok(extraction)
}

/// Rule-based stand-in for NLI verification. Returns a rejection reason,
/// or `None` when the relation may stand.
fn check_relation(
    kind: ClaimRelationKind,
    src: Option<&Claim>,
    dst: Option<&Claim>,
) -> Option<String> {
    let (Some(src), Some(dst)) = (src, dst) else {
        return None;
    };
    match kind {
        ClaimRelationKind::Causes => {
            let combined = format!("{} {} {}", src.text, dst.text, src.evidence_span);
            let lowered = combined.to_lowercase();
            if CAUSAL_MARKERS.iter().any(|m| lowered.contains(m)) {
                None
            } else {
                Some("no causal or temporal marker in either claim".to_string())
            }
        }
        ClaimRelationKind::Contradicts => {
            let polarity_differs = src.polarity != dst.polarity;
            let negation = |text: &str| {
                let lowered = text.to_lowercase();
                NEGATION_MARKERS.iter().any(|m| lowered.contains(m))
            };
            let negation_differs = negation(&src.text) != negation(&dst.text);
            let same_topic = token_overlap(&src.text, &dst.text) > 0.15;
            if (polarity_differs || negation_differs) && same_topic {
                None
            } else {
                Some("claims lack a polarity or negation asymmetry".to_string())
            }
        }
        _ => None,
    }
}

/// Text-only plausibility check for a relation kind; the metrics judge
/// falls back to this when the model is unavailable.
pub(crate) fn relation_plausible(kind: ClaimRelationKind, src_text: &str, dst_text: &str) -> bool {
    match kind {
        ClaimRelationKind::Causes => {
            let lowered = format!("{src_text} {dst_text}").to_lowercase();
            CAUSAL_MARKERS.iter().any(|m| lowered.contains(m))
        }
        ClaimRelationKind::Contradicts => {
            let negation = |text: &str| {
                let lowered = text.to_lowercase();
                NEGATION_MARKERS.iter().any(|m| lowered.contains(m))
            };
            negation(src_text) != negation(dst_text)
                && token_overlap(src_text, dst_text) > 0.15
        }
        _ => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexicalModality {
    Assertive,
    Hedged,
    Speculative,
}

impl LexicalModality {
    fn as_hint(&self) -> &'static str {
        match self {
            LexicalModality::Assertive => "assertive",
            LexicalModality::Hedged => "hedged",
            LexicalModality::Speculative => "speculative",
        }
    }
}

fn lexical_modality(text: &str) -> LexicalModality {
    let lowered = text.to_lowercase();
    if SPECULATIVE_MARKERS.iter().any(|m| lowered.contains(m)) {
        LexicalModality::Speculative
    } else if HEDGE_MARKERS.iter().any(|m| lowered.contains(m)) {
        LexicalModality::Hedged
    } else {
        LexicalModality::Assertive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphLoomConfig;
    use crate::providers::{MockChatProvider, MockEmbeddingProvider};
    use crate::store::MemoryGraphStore;
    use std::sync::Arc;

    fn context_with(chat: MockChatProvider) -> PipelineContext {
        let mut config = GraphLoomConfig::default();
        config.providers.embed_dim = 32;
        PipelineContext::builder()
            .config(config)
            .chat_provider(Arc::new(chat))
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
            section_path: vec!["Intro".to_string()],
            page_num: None,
            sentence_ids: (0..count).map(|n| format!("s{n}")).collect(),
            window_start: 0,
            window_end: count,
            embedding: None,
        }
    }

    fn claims_json(claims: &[(&str, &str)]) -> String {
        let claims: Vec<serde_json::Value> = claims
            .iter()
            .map(|(text, polarity)| {
                serde_json::json!({
                    "text": text,
                    "claim_type": "fact",
                    "modality": "assertive",
                    "polarity": polarity,
                    "certainty": 0.9,
                    "sentence_indices": [0]
                })
            })
            .collect();
        serde_json::json!({"claims": claims, "relations": []}).to_string()
    }

    #[tokio::test]
    async fn extracts_typed_claims_with_evidence() {
        let chat = MockChatProvider::new();
        chat.push_response(claims_json(&[(
            "Transformer is a neural-network architecture.",
            "positive",
        )]));
        let ctx = context_with(chat);
        let chunk = chunk_of("Transformer is a neural-network architecture based on attention.");
        let mut dedup = ClaimDedupIndex::default();
        let mut diagnostics = JobDiagnostics::new();

        let extraction = extract_claims(&ctx, &chunk, &[], &mut dedup, &mut diagnostics)
            .await
            .unwrap();

        assert_eq!(extraction.claims.len(), 1);
        let claim = &extraction.claims[0];
        assert_eq!(claim.claim_type, ClaimType::Fact);
        assert!(claim.canonical_id.is_none());
        assert_eq!(claim.sentence_ids, vec!["s0"]);
        assert!(!claim.evidence_span.is_empty());
        assert!(diagnostics.is_empty());
    }

    #[tokio::test]
    async fn duplicate_claim_becomes_redirect_shell() {
        let json = claims_json(&[("The sky is blue.", "positive")]);
        let chat = MockChatProvider::new();
        chat.push_response(json.clone());
        chat.push_response(json);
        let ctx = context_with(chat);
        let mut dedup = ClaimDedupIndex::default();
        let mut diagnostics = JobDiagnostics::new();

        let first = extract_claims(
            &ctx,
            &chunk_of("The sky is blue. Everyone agrees."),
            &[],
            &mut dedup,
            &mut diagnostics,
        )
        .await
        .unwrap();
        let mut second_chunk = chunk_of("The sky is blue. Again stated here.");
        second_chunk.id = "chk-2".to_string();
        let second = extract_claims(&ctx, &second_chunk, &[], &mut dedup, &mut diagnostics)
            .await
            .unwrap();

        let canonical = &first.claims[0];
        let shell = &second.claims[0];
        assert!(canonical.canonical_id.is_none());
        assert_eq!(shell.canonical_id.as_deref(), Some(canonical.id.as_str()));
        assert_ne!(shell.id, canonical.id);
        // No chains: the shell's target is live.
    }

    #[tokio::test]
    async fn malformed_json_gets_one_repair_retry() {
        let chat = MockChatProvider::new();
        chat.push_response("Sure! Here are the claims you asked for.");
        chat.push_response(claims_json(&[("Repaired claim.", "positive")]));
        let ctx = context_with(chat.clone());
        let mut dedup = ClaimDedupIndex::default();
        let mut diagnostics = JobDiagnostics::new();

        let extraction = extract_claims(
            &ctx,
            &chunk_of("A sentence worth extracting claims from."),
            &[],
            &mut dedup,
            &mut diagnostics,
        )
        .await
        .unwrap();

        assert_eq!(chat.call_count(), 2);
        assert_eq!(extraction.claims.len(), 1);
        assert_eq!(extraction.claims[0].text, "Repaired claim.");
    }

    #[tokio::test]
    async fn second_parse_failure_yields_zero_claims_not_an_error() {
        let chat = MockChatProvider::new();
        chat.push_response("still not json");
        chat.push_response("also not json");
        let ctx = context_with(chat);
        let mut dedup = ClaimDedupIndex::default();
        let mut diagnostics = JobDiagnostics::new();

        let extraction = extract_claims(
            &ctx,
            &chunk_of("Some sentence that will not parse."),
            &[],
            &mut dedup,
            &mut diagnostics,
        )
        .await
        .unwrap();

        assert!(extraction.claims.is_empty());
        assert_eq!(diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn causes_without_marker_is_dropped() {
        let reply = serde_json::json!({
            "claims": [
                {"text": "Model quality improved.", "claim_type": "fact", "modality": "assertive",
                 "polarity": "positive", "certainty": 0.9, "sentence_indices": [0]},
                {"text": "Dataset size grew.", "claim_type": "fact", "modality": "assertive",
                 "polarity": "positive", "certainty": 0.9, "sentence_indices": [1]}
            ],
            "relations": [
                {"src": 1, "kind": "CAUSES", "dst": 0, "confidence": 0.8}
            ]
        })
        .to_string();
        let chat = MockChatProvider::new();
        chat.push_response(reply);
        let ctx = context_with(chat);
        let mut dedup = ClaimDedupIndex::default();
        let mut diagnostics = JobDiagnostics::new();

        let extraction = extract_claims(
            &ctx,
            &chunk_of("Model quality improved. Dataset size grew."),
            &[],
            &mut dedup,
            &mut diagnostics,
        )
        .await
        .unwrap();

        assert!(extraction.relations.is_empty());
        assert_eq!(diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn causes_with_marker_survives() {
        let reply = serde_json::json!({
            "claims": [
                {"text": "Larger datasets lead to better models.", "claim_type": "fact",
                 "modality": "assertive", "polarity": "positive", "certainty": 0.9,
                 "sentence_indices": [0]},
                {"text": "Model quality improved because data grew.", "claim_type": "conclusion",
                 "modality": "assertive", "polarity": "positive", "certainty": 0.8,
                 "sentence_indices": [1]}
            ],
            "relations": [
                {"src": 0, "kind": "CAUSES", "dst": 1, "confidence": 0.8}
            ]
        })
        .to_string();
        let chat = MockChatProvider::new();
        chat.push_response(reply);
        let ctx = context_with(chat);
        let mut dedup = ClaimDedupIndex::default();
        let mut diagnostics = JobDiagnostics::new();

        let extraction = extract_claims(
            &ctx,
            &chunk_of("Larger datasets lead to better models. Quality improved because data grew."),
            &[],
            &mut dedup,
            &mut diagnostics,
        )
        .await
        .unwrap();

        assert_eq!(extraction.relations.len(), 1);
        assert_eq!(extraction.relations[0].kind, ClaimRelationKind::Causes);
    }

    #[tokio::test]
    async fn unknown_relation_kind_is_rejected() {
        let reply = serde_json::json!({
            "claims": [
                {"text": "A first claim.", "claim_type": "fact", "modality": "assertive",
                 "polarity": "positive", "certainty": 0.9, "sentence_indices": [0]},
                {"text": "A second claim.", "claim_type": "fact", "modality": "assertive",
                 "polarity": "positive", "certainty": 0.9, "sentence_indices": [0]}
            ],
            "relations": [
                {"src": 0, "kind": "RELATED_TO", "dst": 1, "confidence": 0.9}
            ]
        })
        .to_string();
        let chat = MockChatProvider::new();
        chat.push_response(reply);
        let ctx = context_with(chat);
        let mut dedup = ClaimDedupIndex::default();
        let mut diagnostics = JobDiagnostics::new();

        let extraction = extract_claims(
            &ctx,
            &chunk_of("A first claim. A second claim."),
            &[],
            &mut dedup,
            &mut diagnostics,
        )
        .await
        .unwrap();

        assert!(extraction.relations.is_empty());
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn modality_hints_are_lexical() {
        assert_eq!(
            lexical_modality("The result may indicate progress."),
            LexicalModality::Hedged
        );
        assert_eq!(
            lexical_modality("We hypothesize a new mechanism."),
            LexicalModality::Speculative
        );
        assert_eq!(
            lexical_modality("The system stores data."),
            LexicalModality::Assertive
        );
        assert_eq!(lexical_modality("这可能是一个进步。"), LexicalModality::Hedged);
    }
}

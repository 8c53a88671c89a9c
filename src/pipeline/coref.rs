//! Stage 1: coreference and alias resolution.
//!
//! Model-free. Three things happen per chunk: parenthesis definitions like
//! "人工智能（AI）" become alias entries; later occurrences of those
//! surfaces plus pronouns become mentions; pronouns get the best-scoring
//! antecedent within a bounded sentence window. The chunk-level coverage
//! and conflict ratios decide the outcome mode:
//!
//! - `rewrite`: coverage ≥ threshold, conflict low: alias canonical forms
//!   are substituted into `resolved_text` (applying `alias_map` to the
//!   original text reproduces it exactly).
//! - `local`: decent coverage: matches are kept, text untouched.
//! - `alias_only`: definitions found but nothing to resolve.
//! - `skip`: titles, very short chunks, or nothing found.
//!
//! This stage never introduces new concepts; it only produces the
//! surface → canonical map that Stage 2 consumes. Anything unexpected
//! downgrades the chunk to `skip`, and the chunk stays valid for linking.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::config::CorefConfig;
use crate::model::Chunk;
use crate::text::split_sentences;

/// "人工智能（AI）": CJK canonical with an ASCII alias in parens.
static PAREN_ALIAS_HAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\p{Han}]{2,16})\s*[（(]\s*([A-Za-z][A-Za-z0-9 .\-]{0,38}?)\s*[)）]").unwrap()
});

/// "Artificial Intelligence (AI)": capitalized canonical, short alias.
static PAREN_ALIAS_ASCII: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([A-Z][A-Za-z0-9\-]+(?:\s[A-Z][A-Za-z0-9\-]+){0,4})\s*[（(]\s*([A-Za-z][A-Za-z0-9.\-]{0,24}?)\s*[)）]",
    )
    .unwrap()
});

/// Candidate antecedents: CJK noun runs, capitalized phrases, acronyms.
static CANDIDATE_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Han}]{2,16}|[A-Z]{2,8}\b|[A-Z][a-z][A-Za-z0-9\-]*(?:\s[A-Z][A-Za-z0-9\-]+)*")
        .unwrap()
});

const PRONOUNS: &[&str] = &[
    "it", "its", "this", "that", "they", "them", "these", "those", "he", "she", "him", "her",
    "his", "它", "他", "她", "它们", "他们", "她们", "其", "该", "此",
];

const PERSON_PRONOUNS: &[&str] = &["he", "she", "him", "her", "his", "他", "她", "他们", "她们"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorefMode {
    Rewrite,
    Local,
    AliasOnly,
    Skip,
}

/// One resolved mention (an alias occurrence or a pronoun).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorefMatch {
    pub mention: String,
    pub antecedent: String,
    pub sentence_id: String,
    /// Byte span of the mention in the chunk text.
    pub start: usize,
    pub end: usize,
    pub score: f32,
    pub confidence: f32,
}

/// Stage output consumed by the entity linker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorefOutcome {
    pub resolved_text: Option<String>,
    /// surface → canonical, in discovery order.
    pub alias_map: Vec<(String, String)>,
    pub mode: CorefMode,
    pub coverage: f32,
    pub conflict: f32,
    pub matches: Vec<CorefMatch>,
}

impl CorefOutcome {
    pub fn skip() -> Self {
        CorefOutcome {
            resolved_text: None,
            alias_map: Vec::new(),
            mode: CorefMode::Skip,
            coverage: 0.0,
            conflict: 0.0,
            matches: Vec::new(),
        }
    }
}

/// Resolve one chunk. Infallible: anything that would be an error is a
/// `skip` outcome instead.
pub fn resolve_chunk(chunk: &Chunk, config: &CorefConfig) -> CorefOutcome {
    let text = chunk.text.as_str();
    if text.trim().len() < config.min_chunk_chars {
        return CorefOutcome::skip();
    }
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        // A heading or label with no sentence structure.
        return CorefOutcome::skip();
    }

    let sentence_id_at = |offset: usize| -> String {
        let index = sentences
            .iter()
            .position(|s| offset < s.end)
            .unwrap_or(sentences.len() - 1);
        chunk
            .sentence_ids
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("s{index}"))
    };

    // 1. Parenthesis alias definitions.
    let mut alias_map: Vec<(String, String)> = Vec::new();
    let mut definition_spans: Vec<(usize, usize)> = Vec::new();
    for re in [&*PAREN_ALIAS_HAN, &*PAREN_ALIAS_ASCII] {
        for captures in re.captures_iter(text) {
            let (Some(canonical), Some(alias)) = (captures.get(1), captures.get(2)) else {
                continue;
            };
            let surface = alias.as_str().trim().to_string();
            let canonical = canonical.as_str().trim().to_string();
            if surface.is_empty() || surface.eq_ignore_ascii_case(&canonical) {
                continue;
            }
            if !alias_map.iter().any(|(s, _)| s == &surface) {
                alias_map.push((surface, canonical));
            }
            definition_spans.push((alias.start(), alias.end()));
        }
    }

    // 2. Mentions: alias surfaces recurring outside their definitions…
    let mut matches: Vec<CorefMatch> = Vec::new();
    let mut total_mentions = 0_usize;
    let mut conflicted = 0_usize;
    for (surface, canonical) in &alias_map {
        for (start, end) in find_occurrences(text, surface) {
            if definition_spans
                .iter()
                .any(|(ds, de)| start >= *ds && end <= *de)
            {
                continue;
            }
            total_mentions += 1;
            matches.push(CorefMatch {
                mention: surface.clone(),
                antecedent: canonical.clone(),
                sentence_id: sentence_id_at(start),
                start,
                end,
                score: 1.0,
                confidence: 1.0,
            });
        }
    }

    // …and pronouns resolved against nearby candidate phrases.
    let candidates = collect_candidates(text, &sentences);
    for (sentence_index, sentence) in sentences.iter().enumerate() {
        for (pronoun, start, end) in pronouns_in(&sentence.text, sentence.start) {
            total_mentions += 1;
            let window_floor =
                sentence_index.saturating_sub(config.antecedent_window_sentences);
            let mut scored: Vec<(&CandidatePhrase, f32)> = candidates
                .iter()
                .filter(|c| {
                    c.sentence_index >= window_floor
                        && (c.sentence_index < sentence_index
                            || (c.sentence_index == sentence_index && c.end <= start))
                })
                .map(|c| {
                    let distance = sentence_index - c.sentence_index;
                    let decay = 1.0 / (1.0 + distance as f32);
                    let compatibility = head_compatibility(&pronoun, c);
                    (c, decay * compatibility)
                })
                .collect();
            scored.sort_by(|(ca, sa), (cb, sb)| {
                sb.partial_cmp(sa)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| cb.start.cmp(&ca.start))
            });
            let Some((best, best_score)) = scored.first().map(|(c, s)| (*c, *s)) else {
                continue;
            };
            let runner_up = scored.get(1).map(|(_, s)| *s).unwrap_or(0.0);
            let viable_alternative = runner_up > best_score * 0.7;
            if viable_alternative {
                conflicted += 1;
            }
            let confidence = if best_score + runner_up > 0.0 {
                best_score / (best_score + runner_up)
            } else {
                0.0
            };
            matches.push(CorefMatch {
                mention: pronoun.clone(),
                antecedent: best.phrase.clone(),
                sentence_id: sentence_id_at(start),
                start,
                end,
                score: best_score,
                confidence,
            });
        }
    }

    if total_mentions == 0 {
        if alias_map.is_empty() {
            return CorefOutcome::skip();
        }
        return CorefOutcome {
            resolved_text: None,
            alias_map,
            mode: CorefMode::AliasOnly,
            coverage: 0.0,
            conflict: 0.0,
            matches: Vec::new(),
        };
    }

    let coverage = matches.len() as f32 / total_mentions as f32;
    let conflict = conflicted as f32 / total_mentions as f32;

    let mode = if coverage >= config.rewrite_coverage && conflict <= config.rewrite_conflict {
        CorefMode::Rewrite
    } else if coverage >= config.local_coverage {
        CorefMode::Local
    } else if !alias_map.is_empty() {
        CorefMode::AliasOnly
    } else {
        CorefMode::Skip
    };

    let resolved_text = match mode {
        CorefMode::Rewrite => Some(apply_alias_map(text, &alias_map)),
        _ => None,
    };

    CorefOutcome {
        resolved_text,
        alias_map,
        mode,
        coverage,
        conflict,
        matches,
    }
}

/// Substitute every alias surface with its canonical form. Word boundaries
/// guard ASCII surfaces so "AI" never fires inside "maintain".
pub fn apply_alias_map(text: &str, alias_map: &[(String, String)]) -> String {
    let mut result = text.to_string();
    for (surface, canonical) in alias_map {
        if surface.is_ascii() {
            if let Ok(re) = Regex::new(&format!(r"\b{}\b", regex::escape(surface))) {
                result = re.replace_all(&result, canonical.as_str()).into_owned();
            }
        } else {
            result = result.replace(surface.as_str(), canonical);
        }
    }
    result
}

fn find_occurrences(text: &str, surface: &str) -> Vec<(usize, usize)> {
    if surface.is_ascii() {
        let Ok(re) = Regex::new(&format!(r"\b{}\b", regex::escape(surface))) else {
            return Vec::new();
        };
        re.find_iter(text).map(|m| (m.start(), m.end())).collect()
    } else {
        text.match_indices(surface)
            .map(|(start, _)| (start, start + surface.len()))
            .collect()
    }
}

struct CandidatePhrase {
    phrase: String,
    sentence_index: usize,
    start: usize,
    end: usize,
    looks_like_person: bool,
}

fn collect_candidates(
    text: &str,
    sentences: &[crate::text::SentenceSpan],
) -> Vec<CandidatePhrase> {
    let mut candidates = Vec::new();
    for m in CANDIDATE_PHRASE.find_iter(text) {
        let mut phrase = m.as_str().to_string();
        let mut phrase_start = m.start();
        // Determiners are not part of the antecedent.
        for determiner in ["The ", "A ", "An ", "This ", "That ", "These ", "Those "] {
            if let Some(rest) = phrase.strip_prefix(determiner) {
                phrase_start += determiner.len();
                phrase = rest.to_string();
                break;
            }
        }
        if phrase.chars().count() < 2 || PRONOUNS.contains(&phrase.to_lowercase().as_str()) {
            continue;
        }
        let sentence_index = sentences
            .iter()
            .position(|s| m.start() < s.end)
            .unwrap_or(sentences.len() - 1);
        // Heuristic: "Ada Lovelace" shapes read as person names, acronyms
        // and CJK noun runs do not.
        let looks_like_person = phrase
            .split_whitespace()
            .all(|w| w.len() > 1 && w.chars().next().is_some_and(char::is_uppercase))
            && phrase.contains(' ')
            && phrase.chars().any(char::is_lowercase);
        candidates.push(CandidatePhrase {
            phrase,
            sentence_index,
            start: phrase_start,
            end: m.end(),
            looks_like_person,
        });
    }
    candidates
}

fn pronouns_in(sentence: &str, base_offset: usize) -> Vec<(String, usize, usize)> {
    use unicode_segmentation::UnicodeSegmentation;
    let mut found = Vec::new();
    for (offset, word) in sentence.unicode_word_indices() {
        let lowered = word.to_lowercase();
        if PRONOUNS.contains(&lowered.as_str()) {
            found.push((
                word.to_string(),
                base_offset + offset,
                base_offset + offset + word.len(),
            ));
        }
    }
    found
}

fn head_compatibility(pronoun: &str, candidate: &CandidatePhrase) -> f32 {
    let person_pronoun = PERSON_PRONOUNS.contains(&pronoun.to_lowercase().as_str());
    match (person_pronoun, candidate.looks_like_person) {
        (true, true) | (false, false) => 1.0,
        (true, false) => 0.4,
        (false, true) => 0.6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(text: &str) -> Chunk {
        let sentence_count = split_sentences(text).len().max(1);
        Chunk {
            id: "chk-test".to_string(),
            doc_id: "doc-test".to_string(),
            text: text.to_string(),
            resolved_text: None,
            section_path: vec![],
            page_num: None,
            sentence_ids: (0..sentence_count).map(|n| format!("s{n}")).collect(),
            window_start: 0,
            window_end: sentence_count,
            embedding: None,
        }
    }

    fn config() -> CorefConfig {
        CorefConfig::default()
    }

    #[test]
    fn static_patterns_compile() {
        // Touch the lazies so a bad pattern fails here, not in production.
        assert!(PAREN_ALIAS_HAN.as_str().contains("Han"));
        assert!(PAREN_ALIAS_ASCII.is_match("Large Language Model (LLM)"));
        assert!(CANDIDATE_PHRASE.is_match("Transformer"));
    }

    #[test]
    fn parenthesis_alias_rewrites_both_positions() {
        let chunk = chunk_of("人工智能（AI）是一种技术。AI 可以处理自然语言。");
        let outcome = resolve_chunk(&chunk, &config());

        assert_eq!(outcome.mode, CorefMode::Rewrite);
        assert_eq!(
            outcome.alias_map,
            vec![("AI".to_string(), "人工智能".to_string())]
        );
        let resolved = outcome.resolved_text.unwrap();
        assert_eq!(resolved.matches("人工智能").count(), 3);
        assert!(!Regex::new(r"\bAI\b").unwrap().is_match(&resolved));
    }

    #[test]
    fn rewrite_law_holds() {
        let chunk = chunk_of("Large Language Model (LLM) research moves fast. An LLM can write code.");
        let outcome = resolve_chunk(&chunk, &config());
        if outcome.mode == CorefMode::Rewrite {
            assert_eq!(
                outcome.resolved_text.as_deref().unwrap(),
                apply_alias_map(&chunk.text, &outcome.alias_map)
            );
        } else {
            panic!("expected rewrite, got {:?}", outcome.mode);
        }
    }

    #[test]
    fn alias_only_when_surface_never_recurs() {
        let chunk = chunk_of("人工智能（AI）是一种重要的技术领域。");
        let outcome = resolve_chunk(&chunk, &config());
        assert_eq!(outcome.mode, CorefMode::AliasOnly);
        assert_eq!(outcome.alias_map.len(), 1);
        assert!(outcome.resolved_text.is_none());
    }

    #[test]
    fn short_chunks_are_skipped() {
        let outcome = resolve_chunk(&chunk_of("Overview"), &config());
        assert_eq!(outcome.mode, CorefMode::Skip);
        assert!(outcome.alias_map.is_empty());
    }

    #[test]
    fn pronouns_resolve_to_nearest_compatible_antecedent() {
        let chunk = chunk_of(
            "The Transformer changed machine translation. It relies on self-attention entirely.",
        );
        let outcome = resolve_chunk(&chunk, &config());
        let pronoun_match = outcome
            .matches
            .iter()
            .find(|m| m.mention.eq_ignore_ascii_case("it"))
            .expect("pronoun should be matched");
        assert_eq!(pronoun_match.antecedent, "Transformer");
        assert!(pronoun_match.score > 0.0);
    }

    #[test]
    fn word_boundary_protects_ascii_surfaces() {
        let rewritten = apply_alias_map(
            "AI helps maintain quality.",
            &[("AI".to_string(), "人工智能".to_string())],
        );
        assert_eq!(rewritten, "人工智能 helps maintain quality.");
    }

    #[test]
    fn no_mentions_and_no_aliases_is_skip() {
        let chunk = chunk_of("just some lowercase words with nothing to resolve at all.");
        let outcome = resolve_chunk(&chunk, &config());
        assert_eq!(outcome.mode, CorefMode::Skip);
    }
}

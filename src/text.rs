//! Deterministic text utilities shared across pipeline stages.
//!
//! Everything in this module is model-free: sentence segmentation, token
//! extraction, normalization for dedup hashing, and the similarity measures
//! used by the entity-linker reranker. Determinism matters because chunk
//! ids and claim hashes are derived from these outputs.

use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

/// A sentence with its byte span in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceSpan {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Split text into sentences using UAX #29 boundaries.
///
/// Handles both Latin scripts and CJK terminators (。！？) without any model
/// call. Whitespace-only segments are dropped; spans index into the input.
pub fn split_sentences(text: &str) -> Vec<SentenceSpan> {
    text.split_sentence_bound_indices()
        .filter_map(|(start, sentence)| {
            let trimmed = sentence.trim();
            if trimmed.is_empty() {
                return None;
            }
            let leading = sentence.len() - sentence.trim_start().len();
            let start = start + leading;
            Some(SentenceSpan {
                text: trimmed.to_string(),
                start,
                end: start + trimmed.len(),
            })
        })
        .collect()
}

/// Extract word tokens, lowercased. Han ideographs come out as single-char
/// tokens under UAX #29, which is what the lexical scorer expects.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(|word| word.to_lowercase())
        .collect()
}

/// Normalize text for dedup hashing: lowercase, keep only letters, digits and
/// ideographs, collapse runs of whitespace, and apply a light plural strip so
/// "transformers" and "transformer" hash identically.
pub fn normalize_for_hash(text: &str) -> String {
    let mut tokens: Vec<String> = Vec::new();
    for word in text.unicode_words() {
        let lower: String = word
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        if lower.is_empty() {
            continue;
        }
        tokens.push(strip_plural(&lower));
    }
    tokens.join(" ")
}

fn strip_plural(token: &str) -> String {
    if token.len() > 3 && token.ends_with("es") && !token.ends_with("ses") {
        token[..token.len() - 2].to_string()
    } else if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

/// SHA-256 over `parts` joined with a unit separator, hex encoded.
pub fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f_u8]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// First 16 hex chars of [`sha256_hex`]; used for deterministic node ids.
pub fn short_hash(parts: &[&str]) -> String {
    sha256_hex(parts)[..16].to_string()
}

/// Cosine similarity of two vectors. Returns 0.0 on dimension mismatch or
/// zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Normalized Levenshtein similarity in [0, 1] over chars, case-insensitive.
pub fn text_similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let distance = levenshtein(&a, &b);
    let max_len = a.len().max(b.len());
    1.0 - distance as f32 / max_len as f32
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0_usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (prev[j] + cost)
                .min(prev[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Jaccard overlap of the token sets of two strings.
pub fn token_overlap(a: &str, b: &str) -> f32 {
    let set_a: rustc_hash::FxHashSet<String> = tokenize(a).into_iter().collect();
    let set_b: rustc_hash::FxHashSet<String> = tokenize(b).into_iter().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f32 / union as f32
}

/// Top-N keywords across a set of member texts by TF-IDF.
///
/// IDF is computed over the member texts themselves; ties break
/// lexicographically so output is deterministic.
pub fn tfidf_keywords(texts: &[String], top_n: usize) -> Vec<String> {
    use rustc_hash::FxHashMap;

    if texts.is_empty() || top_n == 0 {
        return Vec::new();
    }
    let mut doc_frequency: FxHashMap<String, usize> = FxHashMap::default();
    let mut term_frequency: FxHashMap<String, usize> = FxHashMap::default();
    for text in texts {
        let tokens = tokenize(text);
        let mut seen: rustc_hash::FxHashSet<&String> = rustc_hash::FxHashSet::default();
        for token in &tokens {
            if token.chars().count() < 2 {
                continue;
            }
            *term_frequency.entry(token.clone()).or_insert(0) += 1;
            if seen.insert(token) {
                *doc_frequency.entry(token.clone()).or_insert(0) += 1;
            }
        }
    }
    let total_docs = texts.len() as f32;
    let mut scored: Vec<(String, f32)> = term_frequency
        .into_iter()
        .map(|(token, tf)| {
            let df = doc_frequency.get(&token).copied().unwrap_or(1) as f32;
            let idf = (total_docs / df).ln() + 1.0;
            let score = tf as f32 * idf;
            (token, score)
        })
        .collect();
    scored.sort_by(|(ta, sa), (tb, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ta.cmp(tb))
    });
    scored.into_iter().take(top_n).map(|(t, _)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentences_split_on_latin_and_cjk_terminators() {
        let spans = split_sentences("First sentence. Second one! 人工智能是一种技术。它很有用。");
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[0].text, "First sentence.");
        assert_eq!(spans[2].text, "人工智能是一种技术。");
        for span in &spans {
            assert!(!span.text.trim().is_empty());
        }
    }

    #[test]
    fn sentence_spans_index_source() {
        let text = "Alpha beta. Gamma delta.";
        let spans = split_sentences(text);
        for span in &spans {
            assert_eq!(&text[span.start..span.end], span.text);
        }
    }

    #[test]
    fn empty_text_yields_no_sentences() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   \n\t ").is_empty());
    }

    #[test]
    fn normalization_strips_case_punctuation_and_plurals() {
        assert_eq!(
            normalize_for_hash("Transformers use attention!"),
            normalize_for_hash("transformer uses attention")
        );
    }

    #[test]
    fn hashes_are_stable_and_distinct() {
        let a = short_hash(&["doc1", "0", "4"]);
        let b = short_hash(&["doc1", "0", "4"]);
        let c = short_hash(&["doc1", "0", "5"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn separator_prevents_part_collisions() {
        assert_ne!(sha256_hex(&["ab", "c"]), sha256_hex(&["a", "bc"]));
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn similarity_is_symmetric_and_bounded() {
        let s = text_similarity("Transformer", "transformer");
        assert!((s - 1.0).abs() < f32::EPSILON);
        let t = text_similarity("BERT", "GPT");
        assert!((0.0..=1.0).contains(&t));
        assert_eq!(
            text_similarity("abc", "abd").to_bits(),
            text_similarity("abd", "abc").to_bits()
        );
    }

    #[test]
    fn keywords_rank_frequent_distinctive_terms() {
        let texts = vec![
            "attention attention networks".to_string(),
            "attention improves networks".to_string(),
            "graph storage layer".to_string(),
        ];
        let keywords = tfidf_keywords(&texts, 2);
        assert_eq!(keywords.len(), 2);
        assert!(keywords.contains(&"attention".to_string()));
    }
}

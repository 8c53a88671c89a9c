//! Property tests for the deterministic (model-free) parts of the core.

use proptest::prelude::*;

use graphloom::config::ChunkingConfig;
use graphloom::model::{BuildVersion, Document, DocumentKind, ParsedDocument};
use graphloom::pipeline::chunk_document;
use graphloom::text::{normalize_for_hash, split_sentences, text_similarity};

fn sentences_strategy() -> impl Strategy<Value = String> {
    // Short pseudo-sentences over a small vocabulary, joined with periods.
    proptest::collection::vec("[a-z]{2,8}( [a-z]{2,8}){0,6}", 0..12)
        .prop_map(|sentences| {
            sentences
                .into_iter()
                .map(|s| format!("{s}."))
                .collect::<Vec<_>>()
                .join(" ")
        })
}

proptest! {
    #[test]
    fn chunking_is_deterministic(text in sentences_strategy()) {
        let document = Document::from_text(&text, DocumentKind::PlainText);
        let parsed = ParsedDocument::plain(text.as_str());
        let config = ChunkingConfig::default();
        let version = BuildVersion::from_tag("prop-v");

        let a = chunk_document(&document, &parsed, &config, &version);
        let b = chunk_document(&document, &parsed, &config, &version);

        prop_assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            prop_assert_eq!(&x.id, &y.id);
            prop_assert_eq!(&x.text, &y.text);
            prop_assert_eq!(&x.sentence_ids, &y.sentence_ids);
            prop_assert_eq!(&x.section_path, &y.section_path);
        }
    }

    #[test]
    fn chunking_covers_every_sentence(text in sentences_strategy()) {
        let document = Document::from_text(&text, DocumentKind::PlainText);
        let parsed = ParsedDocument::plain(text.as_str());
        let config = ChunkingConfig::default();
        let version = BuildVersion::from_tag("prop-v");

        let total = split_sentences(&text).len();
        let chunks = chunk_document(&document, &parsed, &config, &version);
        if text.trim().len() < config.min_document_chars {
            prop_assert!(chunks.is_empty());
        } else {
            let covered: std::collections::BTreeSet<&String> =
                chunks.iter().flat_map(|c| &c.sentence_ids).collect();
            prop_assert_eq!(covered.len(), total);
            // Window bounds are monotonic and sentence-aligned.
            for chunk in &chunks {
                prop_assert!(chunk.window_start < chunk.window_end);
                prop_assert_eq!(chunk.sentence_ids.len(), chunk.window_end - chunk.window_start);
            }
        }
    }

    #[test]
    fn normalization_is_idempotent(text in ".{0,120}") {
        let once = normalize_for_hash(&text);
        let twice = normalize_for_hash(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn similarity_is_symmetric_and_bounded(a in "[a-zA-Z ]{0,24}", b in "[a-zA-Z ]{0,24}") {
        let forward = text_similarity(&a, &b);
        let backward = text_similarity(&b, &a);
        prop_assert!((0.0..=1.0).contains(&forward));
        prop_assert_eq!(forward.to_bits(), backward.to_bits());
    }
}

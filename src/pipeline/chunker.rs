//! Stage 0: sentence-windowed semantic chunking.
//!
//! Deterministic and model-free. The parser's heading tree becomes a
//! section path carried on every chunk; sentences get document-wide ids
//! (`s{n}`); a window of `window_sentences` slides with `stride` inside
//! each section, capped by `max_chars` so downstream model calls stay
//! bounded. Adjacent windows overlap (stride < window), which is what lets
//! Stage 1 resolve references that straddle a window boundary.
//!
//! Chunk ids hash `(doc_id, window_start, window_end, build_version)`, so
//! re-running a build version reproduces identical chunks.

use crate::config::ChunkingConfig;
use crate::model::{BuildVersion, Chunk, Document, Heading, PageSpan, ParsedDocument};
use crate::text::{SentenceSpan, split_sentences};

/// A contiguous run of sentences under one heading path.
struct Section {
    path: Vec<String>,
    body_start: usize,
    body_end: usize,
}

/// Split a parsed document into ordered chunks. Empty or below-minimum
/// input produces an empty vector; this stage never fails.
pub fn chunk_document(
    document: &Document,
    parsed: &ParsedDocument,
    config: &ChunkingConfig,
    version: &BuildVersion,
) -> Vec<Chunk> {
    let text = parsed.text.as_str();
    if text.trim().len() < config.min_document_chars {
        return Vec::new();
    }

    let sections = build_sections(text, &parsed.headings);
    let mut chunks = Vec::new();
    let mut sentence_counter = 0_usize;

    for section in sections {
        let body = &text[section.body_start..section.body_end];
        let sentences: Vec<SentenceSpan> = split_sentences(body)
            .into_iter()
            .map(|span| SentenceSpan {
                text: span.text,
                start: span.start + section.body_start,
                end: span.end + section.body_start,
            })
            .collect();
        if sentences.is_empty() {
            continue;
        }
        let base_index = sentence_counter;
        sentence_counter += sentences.len();

        emit_windows(
            document,
            text,
            &section.path,
            &sentences,
            base_index,
            &parsed.page_map,
            config,
            version,
            &mut chunks,
        );
    }
    chunks
}

/// Turn the heading list into sections. A document without headings is one
/// section with an empty path; text before the first heading likewise.
fn build_sections(text: &str, headings: &[Heading]) -> Vec<Section> {
    let mut headings: Vec<&Heading> = headings.iter().collect();
    headings.sort_by_key(|h| h.offset);

    let mut sections = Vec::new();
    let first_heading_offset = headings.first().map_or(text.len(), |h| h.offset);
    if first_heading_offset > 0 {
        sections.push(Section {
            path: Vec::new(),
            body_start: 0,
            body_end: first_heading_offset,
        });
    }

    // Stack of (level, label) maintaining the root→leaf path.
    let mut stack: Vec<(u8, String)> = Vec::new();
    for (i, heading) in headings.iter().enumerate() {
        while let Some((level, _)) = stack.last() {
            if *level >= heading.level {
                stack.pop();
            } else {
                break;
            }
        }
        stack.push((heading.level, heading.label.clone()));

        let body_start = line_end(text, heading.offset);
        let body_end = headings
            .get(i + 1)
            .map_or(text.len(), |next| next.offset)
            .max(body_start);
        sections.push(Section {
            path: stack.iter().map(|(_, label)| label.clone()).collect(),
            body_start,
            body_end,
        });
    }
    sections
}

fn line_end(text: &str, offset: usize) -> usize {
    text[offset..]
        .find('\n')
        .map_or(text.len(), |i| offset + i + 1)
}

#[allow(clippy::too_many_arguments)]
fn emit_windows(
    document: &Document,
    text: &str,
    section_path: &[String],
    sentences: &[SentenceSpan],
    base_index: usize,
    page_map: &[PageSpan],
    config: &ChunkingConfig,
    version: &BuildVersion,
    chunks: &mut Vec<Chunk>,
) {
    let mut start = 0_usize;
    while start < sentences.len() {
        let mut end = (start + config.window_sentences).min(sentences.len());

        // Character cap: shrink the window until it fits, but always keep at
        // least one sentence; an oversized sentence becomes its own chunk.
        while end - start > 1 {
            let span = sentences[end - 1].end - sentences[start].start;
            if span <= config.max_chars {
                break;
            }
            end -= 1;
        }

        let window_start = base_index + start;
        let window_end = base_index + end;
        let chunk_text = text[sentences[start].start..sentences[end - 1].end].to_string();
        let id = format!(
            "chk-{}",
            crate::text::short_hash(&[
                &document.id,
                &window_start.to_string(),
                &window_end.to_string(),
                version.as_str(),
            ])
        );
        chunks.push(Chunk {
            id,
            doc_id: document.id.clone(),
            text: chunk_text,
            resolved_text: None,
            section_path: section_path.to_vec(),
            page_num: page_for_offset(page_map, sentences[start].start),
            sentence_ids: (window_start..window_end).map(|n| format!("s{n}")).collect(),
            window_start,
            window_end,
            embedding: None,
        });

        if end == sentences.len() {
            break;
        }
        // Never advance past the emitted window, or capped windows would
        // leave sentence gaps.
        start += config.stride.min(end - start).max(1);
    }
}

fn page_for_offset(page_map: &[PageSpan], offset: usize) -> Option<u32> {
    page_map
        .iter()
        .filter(|span| span.start_offset <= offset)
        .max_by_key(|span| span.start_offset)
        .map(|span| span.page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentKind;

    fn config() -> ChunkingConfig {
        ChunkingConfig {
            window_sentences: 3,
            stride: 2,
            max_chars: 400,
            min_document_chars: 8,
        }
    }

    fn doc(text: &str) -> Document {
        Document::from_text(text, DocumentKind::PlainText)
    }

    fn version() -> BuildVersion {
        BuildVersion::from_tag("v-test")
    }

    #[test]
    fn empty_document_yields_no_chunks() {
        let parsed = ParsedDocument::plain("");
        let chunks = chunk_document(&doc(""), &parsed, &config(), &version());
        assert!(chunks.is_empty());
    }

    #[test]
    fn short_document_is_one_chunk() {
        let text = "Only two sentences here. That is all.";
        let parsed = ParsedDocument::plain(text);
        let chunks = chunk_document(&doc(text), &parsed, &config(), &version());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sentence_ids, vec!["s0", "s1"]);
        assert_eq!(chunks[0].window_start, 0);
        assert_eq!(chunks[0].window_end, 2);
        assert!(chunks[0].section_path.is_empty());
    }

    #[test]
    fn windows_overlap_with_stride() {
        let text = "One. Two. Three. Four. Five. Six. Seven.";
        let parsed = ParsedDocument::plain(text);
        let chunks = chunk_document(&doc(text), &parsed, &config(), &version());
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            // stride 2 < window 3: adjacent chunks share a sentence.
            assert!(pair[1].window_start < pair[0].window_end);
        }
        // Every sentence is covered.
        assert_eq!(chunks.last().unwrap().window_end, 7);
    }

    #[test]
    fn oversized_sentence_becomes_its_own_chunk() {
        let long = format!("{}.", "word ".repeat(200).trim_end());
        let text = format!("Short one. {long} Short two.");
        let parsed = ParsedDocument::plain(text.as_str());
        let mut cfg = config();
        cfg.max_chars = 120;
        let chunks = chunk_document(&doc(&text), &parsed, &cfg, &version());
        assert!(
            chunks
                .iter()
                .any(|c| c.sentence_ids.len() == 1 && c.text.len() > cfg.max_chars),
            "the long sentence should be a single-sentence chunk"
        );
        // No sentence is skipped.
        let covered: std::collections::BTreeSet<&String> =
            chunks.iter().flat_map(|c| &c.sentence_ids).collect();
        assert_eq!(covered.len(), 3);
    }

    #[test]
    fn headings_carry_section_paths() {
        let text =
            "Intro text here. More intro.\nBackground\nDeep body sentence one. Deep body sentence two.\n";
        // Offset 29 points at the start of the "Background" heading line.
        let headings = vec![Heading {
            level: 1,
            label: "Background".to_string(),
            offset: 29,
        }];
        let parsed = ParsedDocument {
            text: text.to_string(),
            headings,
            page_map: vec![],
            metadata: serde_json::Value::Null,
        };
        let chunks = chunk_document(&doc(text), &parsed, &config(), &version());
        assert!(chunks.iter().any(|c| c.section_path.is_empty()));
        // Heading body starts after the heading's own line.
        let in_section: Vec<_> = chunks
            .iter()
            .filter(|c| c.section_path == ["Background".to_string()])
            .collect();
        assert!(!in_section.is_empty());
        for chunk in in_section {
            assert!(!chunk.text.contains("Intro text"));
        }
    }

    #[test]
    fn nested_headings_stack_root_to_leaf() {
        let text = "A\nfirst section body. another sentence.\nB\nsubsection body here. more words here.\n";
        let headings = vec![
            Heading {
                level: 1,
                label: "Top".to_string(),
                offset: 0,
            },
            Heading {
                level: 2,
                label: "Sub".to_string(),
                offset: 40,
            },
        ];
        let parsed = ParsedDocument {
            text: text.to_string(),
            headings,
            page_map: vec![],
            metadata: serde_json::Value::Null,
        };
        let chunks = chunk_document(&doc(text), &parsed, &config(), &version());
        assert!(
            chunks
                .iter()
                .any(|c| c.section_path == vec!["Top".to_string(), "Sub".to_string()])
        );
    }

    #[test]
    fn chunking_is_deterministic_per_version() {
        let text = "Alpha one. Beta two. Gamma three. Delta four. Epsilon five.";
        let parsed = ParsedDocument::plain(text);
        let d = doc(text);
        let a = chunk_document(&d, &parsed, &config(), &version());
        let b = chunk_document(&d, &parsed, &config(), &version());
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.text, y.text);
            assert_eq!(x.sentence_ids, y.sentence_ids);
        }
        let other = chunk_document(&d, &parsed, &config(), &BuildVersion::from_tag("v-other"));
        assert_ne!(a[0].id, other[0].id);
    }

    #[test]
    fn pages_resolve_from_the_page_map() {
        let text = "Page one sentence. Page two sentence starts later in the text.";
        let parsed = ParsedDocument {
            text: text.to_string(),
            headings: vec![],
            page_map: vec![
                PageSpan {
                    start_offset: 0,
                    page: 1,
                },
                PageSpan {
                    start_offset: 19,
                    page: 2,
                },
            ],
            metadata: serde_json::Value::Null,
        };
        let chunks = chunk_document(&doc(text), &parsed, &config(), &version());
        assert_eq!(chunks[0].page_num, Some(1));
    }
}

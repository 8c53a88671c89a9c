//! The persistent data model: labeled nodes, typed edges, and the four-level
//! evidence locator.
//!
//! Everything written to the graph store is one of the node types here
//! ([`Document`], [`Chunk`], [`Concept`], [`Claim`], [`Theme`]) or an edge
//! whose kind comes from [`edge`] / [`Predicate`] / [`ClaimRelationKind`].
//! Every node and edge carries a [`BuildVersion`]; deleting all elements of a
//! version rolls an ingestion run back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Property map stored on nodes and edges.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// ── Build version ──────────────────────────────────────────────────────

/// Opaque tag stamped on every node and edge produced by one ingestion run.
///
/// Unique per run; the only structure callers may rely on is the configured
/// prefix. Enables rollback and idempotence (re-running with the same
/// version is a no-op).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildVersion(String);

impl BuildVersion {
    /// Generate a fresh version under the given prefix.
    pub fn generate(prefix: &str) -> Self {
        BuildVersion(format!("{prefix}-{}", Uuid::new_v4().simple()))
    }

    /// Wrap an existing tag (for re-runs and rollback).
    pub fn from_tag(tag: impl Into<String>) -> Self {
        BuildVersion(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Documents ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Markdown,
    PlainText,
    Html,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Ingesting,
    Ready,
    Failed,
}

/// A source document. Created on ingest, immutable thereafter; the id is a
/// stable hash of the content so re-uploads dedup at the document level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub checksum: String,
    pub kind: DocumentKind,
    pub size: usize,
    pub created_at: DateTime<Utc>,
    pub status: DocumentStatus,
}

impl Document {
    /// Build a document record from normalized text. Id and checksum are the
    /// content hash, so the same bytes always yield the same document.
    pub fn from_text(text: &str, kind: DocumentKind) -> Self {
        let checksum = crate::text::sha256_hex(&[text]);
        Document {
            id: format!("doc-{}", &checksum[..16]),
            checksum,
            kind,
            size: text.len(),
            created_at: Utc::now(),
            status: DocumentStatus::Pending,
        }
    }
}

/// A heading extracted by the (external) document parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    /// 1-based nesting level; level 1 is a top section.
    pub level: u8,
    pub label: String,
    /// Byte offset of the heading in the normalized text.
    pub offset: usize,
}

/// Byte-offset → page mapping from the parser (present for paginated kinds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    pub start_offset: usize,
    pub page: u32,
}

/// Output contract of the external document parsers. The pipeline consumes
/// this; it never touches raw PDF/Markdown/HTML bytes itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub text: String,
    pub headings: Vec<Heading>,
    #[serde(default)]
    pub page_map: Vec<PageSpan>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ParsedDocument {
    pub fn plain(text: impl Into<String>) -> Self {
        ParsedDocument {
            text: text.into(),
            headings: Vec::new(),
            page_map: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }
}

// ── Chunks ─────────────────────────────────────────────────────────────

/// Sentence-windowed unit of a document; the smallest unit of evidence a
/// claim can resolve to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic from `(doc_id, window_start, window_end, build_version)`.
    pub id: String,
    pub doc_id: String,
    pub text: String,
    /// Coreference-resolved text, present when Stage 1 ran in rewrite mode.
    pub resolved_text: Option<String>,
    /// Ordered heading labels from root to the chunk's section.
    pub section_path: Vec<String>,
    pub page_num: Option<u32>,
    /// Document-wide sentence ids (`s{n}`), in order.
    pub sentence_ids: Vec<String>,
    /// Index of the first sentence in the document-wide sequence.
    pub window_start: usize,
    /// Exclusive index of the last sentence.
    pub window_end: usize,
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    /// Text the downstream stages should read: resolved when available.
    pub fn effective_text(&self) -> &str {
        self.resolved_text.as_deref().unwrap_or(&self.text)
    }
}

// ── Concepts & aliases ─────────────────────────────────────────────────

/// Canonical named entity; the atom of linking. `name` is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub id: String,
    pub name: String,
    pub description: String,
    pub domain: String,
    pub category: String,
    pub importance: f32,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Concept {
    /// A concept proposed by a NIL linking outcome; the node is only created
    /// at persistence time if no alias, exact, or fuzzy match exists.
    pub fn proposed(name: impl Into<String>, domain: impl Into<String>) -> Self {
        let name = name.into();
        let now = Utc::now();
        Concept {
            id: format!("con-{}", crate::text::short_hash(&[&name])),
            name,
            description: String::new(),
            domain: domain.into(),
            category: String::new(),
            importance: 0.5,
            tags: Vec::new(),
            embedding: None,
            source: "linker".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Claims ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    Fact,
    Hypothesis,
    Conclusion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Assertive,
    Hedged,
    Speculative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

/// An extracted atomic proposition with its evidence span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub text: String,
    /// Hash of the normalized text; the document-level dedup key.
    pub normalized_text_hash: String,
    /// When set, this claim is a redirect shell to the live claim.
    /// Chains are eagerly rewritten so the target never has one itself.
    pub canonical_id: Option<String>,
    pub doc_id: String,
    pub chunk_id: String,
    pub sentence_ids: Vec<String>,
    pub claim_type: ClaimType,
    pub modality: Modality,
    pub polarity: Polarity,
    pub certainty: f32,
    pub confidence: f32,
    /// The minimal source-sentence span the claim rests on.
    pub evidence_span: String,
    pub embedding: Option<Vec<f32>>,
}

/// Closed set of inter-claim relation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimRelationKind {
    Supports,
    Contradicts,
    Causes,
    ComparesWith,
    Conditions,
}

impl ClaimRelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimRelationKind::Supports => "SUPPORTS",
            ClaimRelationKind::Contradicts => "CONTRADICTS",
            ClaimRelationKind::Causes => "CAUSES",
            ClaimRelationKind::ComparesWith => "COMPARES_WITH",
            ClaimRelationKind::Conditions => "CONDITIONS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "SUPPORTS" => Some(ClaimRelationKind::Supports),
            "CONTRADICTS" => Some(ClaimRelationKind::Contradicts),
            "CAUSES" => Some(ClaimRelationKind::Causes),
            "COMPARES_WITH" => Some(ClaimRelationKind::ComparesWith),
            "CONDITIONS" => Some(ClaimRelationKind::Conditions),
            _ => None,
        }
    }
}

/// A typed edge between two claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRelation {
    pub src_claim_id: String,
    pub kind: ClaimRelationKind,
    pub dst_claim_id: String,
    pub confidence: f32,
}

// ── Predicates ─────────────────────────────────────────────────────────

/// A concept-concept relation type. Canonical form is SCREAMING_SNAKE_CASE;
/// membership in the whitelist is enforced by the predicate governor before
/// anything reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Predicate(String);

impl Predicate {
    pub fn new(canonical: impl AsRef<str>) -> Self {
        Predicate(canonical.as_ref().trim().to_uppercase().replace(' ', "_"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The catch-all for surfaces the governor could not map. Never written
    /// to the graph; triples carrying it go to the review queue.
    pub fn other() -> Self {
        Predicate("OTHER".to_string())
    }

    pub fn is_other(&self) -> bool {
        self.0 == "OTHER"
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A concept-concept triple after predicate normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptTriple {
    pub subject: String,
    pub predicate: Predicate,
    pub object: String,
    pub confidence: f32,
    pub evidence: Evidence,
}

/// A triple as proposed by extraction, before the governor has normalized
/// its free-text predicate surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedTriple {
    pub subject: String,
    pub predicate_surface: String,
    pub object: String,
    pub confidence: f32,
    pub evidence: Evidence,
}

// ── Themes ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeLevel {
    Coarse,
    Fine,
}

/// A community in the concept/claim graph plus its generated label and
/// summary; the unit of "global" retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    /// Deterministic from (sorted member-id hash, level).
    pub id: String,
    pub label: String,
    pub summary: String,
    pub level: ThemeLevel,
    pub keywords: Vec<String>,
    pub community_id: usize,
    pub member_count: usize,
    pub embedding: Option<Vec<f32>>,
}

// ── Evidence ───────────────────────────────────────────────────────────

/// The four-level locator anchoring a statement in its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub doc_id: String,
    pub chunk_id: String,
    pub section_path: Vec<String>,
    pub sentence_ids: Vec<String>,
}

// ── Entity links ───────────────────────────────────────────────────────

/// Character span of a mention inside a chunk's effective text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionSpan {
    pub sentence_id: String,
    pub start: usize,
    pub end: usize,
}

/// Outcome of linking one mention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityLink {
    pub mention: String,
    /// Resolved concept id, or the proposed concept for a NIL outcome.
    pub concept_id: Option<String>,
    pub is_nil: bool,
    /// A NIL outcome proposes a new concept under this canonical name.
    pub proposed_name: Option<String>,
    pub confidence: f32,
    /// Set when the score landed in the review band; the link is stored
    /// but flagged for a human pass.
    pub is_review: bool,
    pub span: MentionSpan,
}

// ── Edge kinds ─────────────────────────────────────────────────────────

/// Structural edge kinds (everything that is not a whitelisted predicate or
/// an inter-claim relation).
pub mod edge {
    pub const CONTAINS: &str = "CONTAINS";
    pub const CONTAINS_CLAIM: &str = "CONTAINS_CLAIM";
    pub const MENTIONS: &str = "MENTIONS";
    pub const BELONGS_TO_THEME: &str = "BELONGS_TO_THEME";
    pub const EVIDENCE_FROM: &str = "EVIDENCE_FROM";
}

/// Node labels in the property graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLabel {
    Document,
    Chunk,
    Concept,
    Claim,
    Theme,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::Document => "Document",
            NodeLabel::Chunk => "Chunk",
            NodeLabel::Concept => "Concept",
            NodeLabel::Claim => "Claim",
            NodeLabel::Theme => "Theme",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Document" => Some(NodeLabel::Document),
            "Chunk" => Some(NodeLabel::Chunk),
            "Concept" => Some(NodeLabel::Concept),
            "Claim" => Some(NodeLabel::Claim),
            "Theme" => Some(NodeLabel::Theme),
            _ => None,
        }
    }
}

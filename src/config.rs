//! Configuration for the ingestion pipeline and retriever.
//!
//! All tunables are loaded from version-controlled YAML at startup and
//! validated eagerly; a malformed or inconsistent file fails fast before any
//! document is touched. Prompt templates live here too, not in code, so a
//! deployment can tune them without rebuilding.
//!
//! The YAML field names map 1:1 onto the deployment option names:
//! `chunking.window_sentences` ↔ `CHUNK_WINDOW_SENTENCES`,
//! `linking.high_threshold` ↔ `ENTITY_LINK_HIGH_THRESHOLD`, and so on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

// ── Top level ──────────────────────────────────────────────────────────

/// Root configuration. Every section has serde defaults, so an empty YAML
/// document yields a fully working (if generic) pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphLoomConfig {
    pub chunking: ChunkingConfig,
    pub coref: CorefConfig,
    pub linking: LinkingConfig,
    pub claims: ClaimConfig,
    pub themes: ThemeConfig,
    pub governor: GovernorConfig,
    pub ontology: OntologyConfig,
    pub retrieval: RetrievalConfig,
    pub providers: ProviderConfig,
    pub store: StoreRetryConfig,
    pub prompts: PromptConfig,
    /// Prefix for generated build versions (`BUILD_VERSION_PREFIX`).
    pub build_version_prefix: String,
    /// Enable vector recall in linking and retrieval (`ENABLE_VECTOR_SEARCH`).
    pub enable_vector_search: bool,
    /// Enable community detection in the theme builder.
    pub enable_community_detection: bool,
}

impl Default for GraphLoomConfig {
    fn default() -> Self {
        GraphLoomConfig {
            chunking: ChunkingConfig::default(),
            coref: CorefConfig::default(),
            linking: LinkingConfig::default(),
            claims: ClaimConfig::default(),
            themes: ThemeConfig::default(),
            governor: GovernorConfig::default(),
            ontology: OntologyConfig::default(),
            retrieval: RetrievalConfig::default(),
            providers: ProviderConfig::default(),
            store: StoreRetryConfig::default(),
            prompts: PromptConfig::default(),
            build_version_prefix: "build".to_string(),
            enable_vector_search: true,
            enable_community_detection: true,
        }
    }
}

impl GraphLoomConfig {
    /// Load and validate a YAML config file. Any problem is fatal.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: GraphLoomConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation; called by the loaders and by
    /// [`crate::context::PipelineContext`] construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.window_sentences == 0 {
            return Err(invalid("chunking.window_sentences", "must be at least 1"));
        }
        if self.chunking.stride == 0 || self.chunking.stride > self.chunking.window_sentences {
            return Err(invalid(
                "chunking.stride",
                format!(
                    "must be in 1..={} so adjacent chunks overlap",
                    self.chunking.window_sentences
                ),
            ));
        }
        if self.chunking.max_chars < 64 {
            return Err(invalid("chunking.max_chars", "must be at least 64"));
        }
        for (field, value) in [
            ("coref.rewrite_coverage", self.coref.rewrite_coverage),
            ("coref.rewrite_conflict", self.coref.rewrite_conflict),
            ("coref.local_coverage", self.coref.local_coverage),
            ("linking.high_threshold", self.linking.high_threshold),
            ("linking.low_threshold", self.linking.low_threshold),
            ("governor.synonym_threshold", self.governor.synonym_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid("thresholds", format!("{field} must be in [0, 1]")));
            }
        }
        if self.linking.low_threshold >= self.linking.high_threshold {
            return Err(invalid(
                "linking.low_threshold",
                "must be strictly below linking.high_threshold",
            ));
        }
        if self.claims.window_sentences < self.chunking.window_sentences {
            return Err(invalid(
                "claims.window_sentences",
                "must be at least the chunk window so cross-sentence argumentation is visible",
            ));
        }
        if self.providers.embed_dim == 0 {
            return Err(invalid("providers.embed_dim", "must be nonzero"));
        }
        if self.retrieval.max_hops > 4 {
            return Err(invalid("retrieval.max_hops", "traversal beyond 4 hops is unsupported"));
        }
        if self.governor.whitelist.is_empty() {
            return Err(invalid("governor.whitelist", "must not be empty"));
        }
        let whitelist: std::collections::BTreeSet<&str> =
            self.governor.whitelist.iter().map(String::as_str).collect();
        for (surface, canonical) in &self.governor.surface_map {
            if !whitelist.contains(canonical.as_str()) {
                return Err(invalid(
                    "governor.surface_map",
                    format!("'{surface}' maps to '{canonical}' which is not in the whitelist"),
                ));
            }
        }
        for constraint in &self.ontology.constraints {
            if !whitelist.contains(constraint.predicate.as_str()) {
                return Err(invalid(
                    "ontology.constraints",
                    format!("constraint on unknown predicate '{}'", constraint.predicate),
                ));
            }
        }
        self.prompts.validate()?;
        Ok(())
    }
}

// ── Sections ───────────────────────────────────────────────────────────

/// Stage 0 options (`CHUNK_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Sentences per window (`CHUNK_WINDOW_SENTENCES`).
    pub window_sentences: usize,
    /// Window stride in sentences (`CHUNK_STRIDE`). Must not exceed the
    /// window so adjacent chunks overlap.
    pub stride: usize,
    /// Character cap per chunk (`CHUNK_MAX_CHARS`).
    pub max_chars: usize,
    /// Documents shorter than this produce no chunks.
    pub min_document_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            window_sentences: 4,
            stride: 2,
            max_chars: 1200,
            min_document_chars: 8,
        }
    }
}

/// Stage 1 mode thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorefConfig {
    pub rewrite_coverage: f32,
    pub rewrite_conflict: f32,
    pub local_coverage: f32,
    /// How many sentences back to search for an antecedent.
    pub antecedent_window_sentences: usize,
    /// Chunks shorter than this are treated as titles/noise and skipped.
    pub min_chunk_chars: usize,
}

impl Default for CorefConfig {
    fn default() -> Self {
        CorefConfig {
            rewrite_coverage: 0.8,
            rewrite_conflict: 0.15,
            local_coverage: 0.5,
            antecedent_window_sentences: 3,
            min_chunk_chars: 16,
        }
    }
}

/// Stage 2 options (`ENTITY_LINK_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkingConfig {
    /// Accept threshold (`ENTITY_LINK_HIGH_THRESHOLD`).
    pub high_threshold: f32,
    /// Review-band floor (`ENTITY_LINK_LOW_THRESHOLD`); below it the linker
    /// emits NIL.
    pub low_threshold: f32,
    /// Per-source candidate cap for the three retrieval routes.
    pub candidate_top_k: usize,
    pub weights: RerankWeights,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        LinkingConfig {
            high_threshold: 0.85,
            low_threshold: 0.65,
            candidate_top_k: 8,
            weights: RerankWeights::default(),
        }
    }
}

/// Blend weights for the linker's reranker. Normalized at use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankWeights {
    pub text: f32,
    pub vector: f32,
    pub context: f32,
    pub cooccurrence: f32,
    pub prior: f32,
    pub type_compatibility: f32,
}

impl Default for RerankWeights {
    fn default() -> Self {
        RerankWeights {
            text: 0.35,
            vector: 0.2,
            context: 0.15,
            cooccurrence: 0.1,
            prior: 0.1,
            type_compatibility: 0.1,
        }
    }
}

/// Stage 3 options (`CLAIM_WINDOW_SENTENCES`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Larger than the chunk window to capture cross-sentence argumentation.
    pub window_sentences: usize,
    /// Run the rule-based relation checks before accepting CAUSES/CONTRADICTS.
    pub relation_checks: bool,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        ClaimConfig {
            window_sentences: 6,
            relation_checks: true,
        }
    }
}

/// Stage 4 options (`THEME_MIN_COMMUNITY_SIZE`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub min_community_size: usize,
    pub keywords_per_theme: usize,
    /// Include claims as projection nodes via shared-concept co-membership.
    pub include_claims: bool,
    /// How many top-degree concepts feed the labeling prompt.
    pub label_sample_size: usize,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        ThemeConfig {
            min_community_size: 3,
            keywords_per_theme: 8,
            include_claims: true,
            label_sample_size: 6,
        }
    }
}

/// Stage 5 tables and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Closed predicate whitelist. Feedback may extend it (next build).
    pub whitelist: Vec<String>,
    /// Free-text surface → canonical predicate. Keys are matched after
    /// trimming; values must appear in the whitelist.
    pub surface_map: BTreeMap<String, String>,
    /// Minimum cosine similarity for the embedding synonym fallback.
    pub synonym_threshold: f32,
    /// A recurring correction is promoted into the surface map after this
    /// many observations.
    pub correction_promotion_threshold: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        let whitelist = [
            "USES",
            "IS_A",
            "PART_OF",
            "CREATES",
            "DERIVES_FROM",
            "RELATED_TO",
            "SIMILAR_TO",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        let surface_map = [
            ("基于", "USES"),
            ("采用", "USES"),
            ("利用", "USES"),
            ("使用", "USES"),
            ("uses", "USES"),
            ("using", "USES"),
            ("built on", "USES"),
            ("是一种", "IS_A"),
            ("is a", "IS_A"),
            ("is an", "IS_A"),
            ("属于", "PART_OF"),
            ("part of", "PART_OF"),
            ("组成部分", "PART_OF"),
            ("创建", "CREATES"),
            ("生成", "CREATES"),
            ("creates", "CREATES"),
            ("produces", "CREATES"),
            ("源于", "DERIVES_FROM"),
            ("衍生自", "DERIVES_FROM"),
            ("derives from", "DERIVES_FROM"),
            ("derived from", "DERIVES_FROM"),
            ("相关", "RELATED_TO"),
            ("related to", "RELATED_TO"),
            ("类似", "SIMILAR_TO"),
            ("similar to", "SIMILAR_TO"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        GovernorConfig {
            whitelist,
            surface_map,
            synonym_threshold: 0.8,
            correction_promotion_threshold: 3,
        }
    }
}

/// Allowed `(subject_type, object_type)` pairs for one predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateConstraint {
    pub predicate: String,
    /// Empty means unconstrained.
    #[serde(default)]
    pub pairs: Vec<TypePair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypePair {
    pub subject: String,
    pub object: String,
}

/// Ontology: the allowed node types, lexical cues for inferring a mention's
/// type from context, and per-predicate type constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OntologyConfig {
    pub node_types: Vec<String>,
    /// type → cue tokens looked up in the mention's sentence.
    pub type_cues: BTreeMap<String, Vec<String>>,
    pub constraints: Vec<PredicateConstraint>,
    /// Type pairs that can never refer to the same entity; a candidate on
    /// the wrong side of one of these is disqualified outright.
    pub disjoint: Vec<TypePair>,
}

impl Default for OntologyConfig {
    fn default() -> Self {
        let node_types = ["technology", "method", "organization", "person", "artifact", "field"]
            .into_iter()
            .map(str::to_string)
            .collect();
        let type_cues = [
            (
                "technology",
                vec!["技术", "系统", "framework", "architecture", "system", "model"],
            ),
            ("method", vec!["方法", "算法", "method", "algorithm", "approach"]),
            (
                "organization",
                vec!["公司", "机构", "university", "company", "lab", "institute"],
            ),
            ("person", vec!["博士", "教授", "dr", "professor", "researcher"]),
            ("field", vec!["领域", "学科", "field", "domain", "discipline"]),
        ]
        .into_iter()
        .map(|(k, v)| {
            (
                k.to_string(),
                v.into_iter().map(str::to_string).collect::<Vec<_>>(),
            )
        })
        .collect();
        let disjoint = [
            ("person", "technology"),
            ("person", "method"),
            ("person", "artifact"),
            ("organization", "method"),
        ]
        .into_iter()
        .map(|(s, o)| TypePair {
            subject: s.to_string(),
            object: o.to_string(),
        })
        .collect();
        OntologyConfig {
            node_types,
            type_cues,
            constraints: Vec::new(),
            disjoint,
        }
    }
}

/// Stage 7 options (`RETRIEVAL_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Result budget per recall route (`RETRIEVAL_TOP_K`).
    pub top_k: usize,
    /// Graph expansion depth (`RETRIEVAL_MAX_HOPS`).
    pub max_hops: usize,
    /// Themes considered in theme-first recall.
    pub theme_top_n: usize,
    /// Regenerations allowed when the model emits unanchored sentences.
    pub anchor_retries: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig {
            top_k: 8,
            max_hops: 2,
            theme_top_n: 4,
            anchor_retries: 1,
        }
    }
}

/// Provider deployment options (`LLM_MODEL`, `EMBED_DIM`, budgets).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub llm_model: String,
    pub embed_model: String,
    /// Fixed embedding dimensionality for this deployment (`EMBED_DIM`).
    pub embed_dim: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-request budget for one chat/embed call.
    pub request_timeout_ms: u64,
    /// Per-stage budget; exceeding it marks the affected chunks as skipped.
    pub stage_budget_ms: u64,
    /// Texts per embedding batch request.
    pub embed_batch_size: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            llm_model: "gpt-4o-mini".to_string(),
            embed_model: "text-embedding-3-small".to_string(),
            embed_dim: 1536,
            temperature: 0.1,
            max_tokens: 2048,
            request_timeout_ms: 30_000,
            stage_budget_ms: 300_000,
            embed_batch_size: 64,
        }
    }
}

/// Exponential-backoff policy for transient store failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreRetryConfig {
    pub max_retries: usize,
    pub base_delay_ms: u64,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        StoreRetryConfig {
            max_retries: 3,
            base_delay_ms: 50,
        }
    }
}

// ── Prompts ────────────────────────────────────────────────────────────

/// Prompt templates with `{placeholder}` slots. Templates are data, not
/// code; deployments tune them in the YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Slots: `{window_text}`, `{entity_hints}`, `{modality_hint}`.
    pub claim_extraction: String,
    /// Slots: `{previous_output}`, `{error}`.
    pub claim_repair: String,
    /// Slots: `{concepts}`, `{claims}`.
    pub theme_summary: String,
    /// Slots: `{question}`, `{themes}`, `{claims}`, `{evidence}`.
    pub answer: String,
    /// Slots: the same as `answer`, plus `{rejected}`.
    pub answer_retry: String,
}

impl PromptConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, template, slots) in [
            (
                "prompts.claim_extraction",
                &self.claim_extraction,
                &["{window_text}"][..],
            ),
            ("prompts.claim_repair", &self.claim_repair, &["{previous_output}"][..]),
            ("prompts.theme_summary", &self.theme_summary, &["{concepts}"][..]),
            ("prompts.answer", &self.answer, &["{question}", "{evidence}"][..]),
            ("prompts.answer_retry", &self.answer_retry, &["{question}"][..]),
        ] {
            if template.trim().is_empty() {
                return Err(invalid("prompts", format!("{field} must not be empty")));
            }
            for slot in slots {
                if !template.contains(slot) {
                    return Err(invalid(
                        "prompts",
                        format!("{field} is missing required slot {slot}"),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        PromptConfig {
            claim_extraction: "\
Extract every atomic claim from the passage below. Reply with JSON only, \
no prose, matching: {\"claims\":[{\"text\":...,\"claim_type\":\"fact|hypothesis|conclusion\",\
\"modality\":\"assertive|hedged|speculative\",\"polarity\":\"positive|negative\",\
\"certainty\":0.0,\"sentence_indices\":[0]}],\"relations\":[{\"src\":0,\"kind\":\
\"SUPPORTS|CONTRADICTS|CAUSES|COMPARES_WITH|CONDITIONS\",\"dst\":1,\"confidence\":0.0}]}\n\
Known entities: {entity_hints}\nModality hint: {modality_hint}\n\nPassage:\n{window_text}"
                .to_string(),
            claim_repair: "\
Your previous reply was not valid JSON for the claim schema.\n\
Error: {error}\nPrevious reply:\n{previous_output}\n\
Reply again with ONLY the corrected JSON object."
                .to_string(),
            theme_summary: "\
These concepts and claims form one topical community. Reply with JSON only: \
{\"label\":\"short name\",\"summary\":\"2-3 sentences\"}\n\
Concepts: {concepts}\nSample claims:\n{claims}"
                .to_string(),
            answer: "\
Answer the question using ONLY the numbered evidence below. Every sentence of \
your answer MUST end with at least one anchor like [E1]. If the evidence is \
insufficient, reply exactly: INSUFFICIENT EVIDENCE.\n\
Question: {question}\nThemes: {themes}\nReasoning claims:\n{claims}\n\
Evidence:\n{evidence}"
                .to_string(),
            answer_retry: "\
Your previous answer contained sentences without evidence anchors; they were \
rejected: {rejected}\nRewrite the full answer. Every sentence MUST cite an \
anchor like [E1] from the evidence list.\n\
Question: {question}\nThemes: {themes}\nReasoning claims:\n{claims}\n\
Evidence:\n{evidence}"
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        GraphLoomConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = GraphLoomConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.chunking.window_sentences, 4);
        assert_eq!(config.linking.high_threshold, 0.85);
        assert_eq!(config.providers.embed_dim, 1536);
    }

    #[test]
    fn stride_beyond_window_is_rejected() {
        let yaml = "chunking:\n  window_sentences: 3\n  stride: 5\n";
        let err = GraphLoomConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "chunking.stride"));
    }

    #[test]
    fn inverted_link_thresholds_are_rejected() {
        let yaml = "linking:\n  high_threshold: 0.5\n  low_threshold: 0.7\n";
        assert!(GraphLoomConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn surface_map_must_target_whitelist() {
        let yaml = r#"
governor:
  whitelist: ["USES"]
  surface_map:
    uses: "USES"
    invokes: "CALLS"
"#;
        let err = GraphLoomConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("CALLS"));
    }

    #[test]
    fn default_surface_map_covers_spec_examples() {
        let config = GraphLoomConfig::default();
        assert_eq!(config.governor.surface_map.get("基于").unwrap(), "USES");
        assert_eq!(config.governor.surface_map.get("采用").unwrap(), "USES");
    }

    #[test]
    fn prompt_missing_slot_fails_fast() {
        let yaml = "prompts:\n  answer: \"no slots here\"\n";
        assert!(GraphLoomConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = GraphLoomConfig::from_yaml_str(": not yaml :").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}

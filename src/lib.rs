//! Evidence-anchored GraphRAG core.
//!
//! graphloom ingests heterogeneous documents into a versioned, idempotent,
//! provenance-linked property graph, and answers questions over it with
//! citations down to the sentence.
//!
//! ```text
//! ParsedDocument ──► chunker ──► coref ──► linker ──┬─► claims ─┐
//!                                                   └─► themes ─┤
//!                                                               ├─► governor
//!                                                               └─► graph service ──► property graph
//!                                                                                         │
//!                          QueryService (theme-first + vector + graph walk) ◄─────────────┤
//!                          FeedbackService (metrics, merge/correct/unlink) ◄──────────────┘
//! ```
//!
//! Every node and edge carries a build version: deleting a version rolls an
//! ingestion back, and re-running one is a no-op. Every concept and claim
//! resolves through `EVIDENCE_FROM` to a `(doc, chunk, section path,
//! sentences)` locator, which is what the retriever cites.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use graphloom::config::GraphLoomConfig;
//! use graphloom::context::PipelineContext;
//! use graphloom::model::{DocumentKind, ParsedDocument};
//! use graphloom::pipeline::IngestPipeline;
//! use graphloom::providers::{MockChatProvider, MockEmbeddingProvider};
//! use graphloom::query::{QueryRequest, QueryService};
//! use graphloom::store::MemoryGraphStore;
//!
//! # async fn run() -> Result<(), graphloom::types::LoomError> {
//! let mut config = GraphLoomConfig::default();
//! config.providers.embed_dim = 64;
//! let ctx = PipelineContext::builder()
//!     .config(config)
//!     .chat_provider(Arc::new(MockChatProvider::new().with_fallback("{}")))
//!     .embedder(Arc::new(MockEmbeddingProvider::new(64)))
//!     .store(Arc::new(MemoryGraphStore::new()))
//!     .build()?;
//!
//! let pipeline = IngestPipeline::new(ctx.clone());
//! let report = pipeline
//!     .ingest(ParsedDocument::plain("Transformer is a neural architecture."), DocumentKind::PlainText)
//!     .await?;
//! println!("ingested {} chunks under {}", report.counts.chunks, report.build_version);
//!
//! let answers = QueryService::new(ctx);
//! let response = answers.query(QueryRequest::hybrid("What is a Transformer?")).await?;
//! # Ok(())
//! # }
//! ```

pub mod aliases;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod feedback;
pub mod governor;
pub mod graph;
pub mod model;
pub mod ontology;
pub mod pipeline;
pub mod providers;
pub mod query;
pub mod store;
pub mod text;
pub mod types;

pub use aliases::{AliasDictionary, AliasEntry, AliasSnapshot};
pub use config::{ConfigError, GraphLoomConfig};
pub use context::PipelineContext;
pub use diagnostics::{JobCounts, JobDiagnostics, JobStatus, StageName, StatusHandle};
pub use feedback::{FeedbackService, MetricsReport};
pub use governor::{GovernorState, PredicateGovernor, ReviewQueue};
pub use graph::GraphService;
pub use model::{BuildVersion, DocumentKind, ParsedDocument};
pub use pipeline::{IngestPipeline, IngestReport};
pub use query::{QueryRequest, QueryResponse, QueryService};
pub use store::{GraphStore, MemoryGraphStore, SqliteGraphStore};
pub use types::LoomError;

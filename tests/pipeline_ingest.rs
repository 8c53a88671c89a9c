//! End-to-end ingestion against the in-memory store with deterministic
//! mock providers.

use std::sync::Arc;

use graphloom::config::GraphLoomConfig;
use graphloom::context::PipelineContext;
use graphloom::diagnostics::{StageName, StatusHandle};
use graphloom::model::{BuildVersion, DocumentKind, NodeLabel, ParsedDocument, edge};
use graphloom::pipeline::IngestPipeline;
use graphloom::providers::{MockChatProvider, MockEmbeddingProvider};
use graphloom::store::{GraphStore, MemoryGraphStore};
use graphloom::types::LoomError;
use tokio_util::sync::CancellationToken;

const DIM: usize = 48;

fn test_config() -> GraphLoomConfig {
    let mut config = GraphLoomConfig::default();
    config.providers.embed_dim = DIM;
    config
}

fn context_with(
    chat: MockChatProvider,
    store: Arc<dyn GraphStore>,
    config: GraphLoomConfig,
) -> PipelineContext {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    PipelineContext::builder()
        .config(config)
        .chat_provider(Arc::new(chat))
        .embedder(Arc::new(MockEmbeddingProvider::new(DIM)))
        .store(store)
        .build()
        .unwrap()
}

fn claims_reply(text: &str) -> String {
    serde_json::json!({
        "claims": [{
            "text": text,
            "claim_type": "fact",
            "modality": "assertive",
            "polarity": "positive",
            "certainty": 0.9,
            "sentence_indices": [0]
        }],
        "relations": []
    })
    .to_string()
}

fn sample_document() -> ParsedDocument {
    ParsedDocument::plain(
        "人工智能（AI）是一种技术。AI 可以处理自然语言。Transformer 基于 Attention。",
    )
}

#[tokio::test]
async fn full_ingestion_commits_all_node_kinds() {
    let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    // Claim windows answer with a fixed claim; theme labeling falls back.
    let chat = MockChatProvider::new().with_fallback(claims_reply("人工智能是一种技术。"));
    let ctx = context_with(chat, store.clone(), test_config());
    let pipeline = IngestPipeline::new(ctx);

    let report = pipeline
        .ingest(sample_document(), DocumentKind::PlainText)
        .await
        .unwrap();

    assert!(report.counts.chunks >= 1);
    assert!(report.counts.links >= 1);
    assert!(report.counts.claims >= 1);

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.nodes_by_label.get("Document"), Some(&1));
    assert!(counts.nodes_by_label.get("Chunk").copied().unwrap_or(0) >= 1);
    assert!(counts.nodes_by_label.get("Concept").copied().unwrap_or(0) >= 1);
    assert!(counts.nodes_by_label.get("Claim").copied().unwrap_or(0) >= 1);

    // The document contains "Transformer 基于 Attention", and 基于 maps to
    // USES, so the governed predicate must be on disk under its canonical
    // kind.
    let uses = store.edges_by_kind("USES").await.unwrap();
    assert_eq!(uses.len(), 1);

    // Predicate closure: every concept-concept edge kind is whitelisted.
    let whitelist = &pipeline.context().config.governor.whitelist;
    let concepts: std::collections::HashSet<String> = store
        .nodes_by_label(NodeLabel::Concept)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    for kind in ["OTHER", "基于"] {
        assert!(store.edges_by_kind(kind).await.unwrap().is_empty());
    }
    for concept_id in &concepts {
        for (edge_record, neighbor) in store
            .neighbors(concept_id, &[], graphloom::store::Direction::Out)
            .await
            .unwrap()
        {
            if concepts.contains(&neighbor.id) && neighbor.label == NodeLabel::Concept {
                assert!(
                    whitelist.contains(&edge_record.kind)
                        || edge_record.kind == edge::BELONGS_TO_THEME
                        || edge_record.kind == edge::EVIDENCE_FROM,
                    "unexpected concept-concept edge kind {}",
                    edge_record.kind
                );
            }
        }
    }
}

#[tokio::test]
async fn provenance_every_concept_and_claim_resolves_to_a_chunk() {
    let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    let chat = MockChatProvider::new().with_fallback(claims_reply("AI 可以处理自然语言。"));
    let ctx = context_with(chat, store.clone(), test_config());
    let pipeline = IngestPipeline::new(ctx);

    pipeline
        .ingest(sample_document(), DocumentKind::PlainText)
        .await
        .unwrap();

    for label in [NodeLabel::Concept, NodeLabel::Claim] {
        for node in store.nodes_by_label(label).await.unwrap() {
            let target = node
                .prop_str("canonical_id")
                .unwrap_or(node.id.as_str())
                .to_string();
            let evidence = store
                .neighbors(&target, &[edge::EVIDENCE_FROM.to_string()], graphloom::store::Direction::Out)
                .await
                .unwrap();
            assert!(
                !evidence.is_empty(),
                "{} {} has no EVIDENCE_FROM path",
                label.as_str(),
                node.id
            );
            let (evidence_edge, chunk) = &evidence[0];
            assert_eq!(chunk.label, NodeLabel::Chunk);
            assert!(evidence_edge.props.contains_key("doc_id"));
            assert!(evidence_edge.props.contains_key("section_path"));
            assert!(evidence_edge.props.contains_key("sentence_ids"));
        }
    }
}

#[tokio::test]
async fn reingesting_the_same_version_changes_nothing() {
    let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    let chat = MockChatProvider::new().with_fallback(claims_reply("人工智能是一种技术。"));
    let ctx = context_with(chat, store.clone(), test_config());
    let pipeline = IngestPipeline::new(ctx);
    let version = BuildVersion::from_tag("pin-1");

    let status = StatusHandle::new();
    pipeline
        .ingest_with_status(
            sample_document(),
            DocumentKind::PlainText,
            &status,
            Some(version.clone()),
        )
        .await
        .unwrap();
    let first = store.counts().await.unwrap();

    pipeline
        .ingest_with_status(
            sample_document(),
            DocumentKind::PlainText,
            &status,
            Some(version),
        )
        .await
        .unwrap();
    let second = store.counts().await.unwrap();

    assert_eq!(first, second, "second run must be a graph no-op");
}

#[tokio::test]
async fn rollback_restores_pre_ingest_counts() {
    let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    let chat = MockChatProvider::new().with_fallback(claims_reply("人工智能是一种技术。"));
    let ctx = context_with(chat, store.clone(), test_config());
    let pipeline = IngestPipeline::new(ctx.clone());

    let before = store.counts().await.unwrap();
    let report = pipeline
        .ingest(sample_document(), DocumentKind::PlainText)
        .await
        .unwrap();
    assert!(store.counts().await.unwrap().nodes > before.nodes);

    ctx.graph.rollback(&report.build_version).await.unwrap();
    let after = store.counts().await.unwrap();
    assert_eq!(
        after, before,
        "fresh store: rollback leaves no orphans behind"
    );
}

#[tokio::test]
async fn empty_document_is_rejected_before_chunking() {
    let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    let chat = MockChatProvider::new().with_fallback("{}");
    let ctx = context_with(chat, store.clone(), test_config());
    let pipeline = IngestPipeline::new(ctx);

    let status = StatusHandle::new();
    let err = pipeline
        .ingest_with_status(
            ParsedDocument::plain("   \n  "),
            DocumentKind::PlainText,
            &status,
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LoomError::Input(_)));
    let snapshot = status.snapshot();
    assert_eq!(snapshot.stage, StageName::Failed);
    assert_eq!(snapshot.error.unwrap().kind, "input");
    assert_eq!(store.counts().await.unwrap().nodes, 0);
}

#[tokio::test]
async fn cancellation_before_commit_writes_nothing() {
    let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    let cancel = CancellationToken::new();
    let chat = MockChatProvider::new().with_fallback("{}");
    let ctx = PipelineContext::builder()
        .config(test_config())
        .chat_provider(Arc::new(chat))
        .embedder(Arc::new(MockEmbeddingProvider::new(DIM)))
        .store(store.clone())
        .cancellation(cancel.clone())
        .build()
        .unwrap();
    let pipeline = IngestPipeline::new(ctx);

    cancel.cancel();
    let err = pipeline
        .ingest(sample_document(), DocumentKind::PlainText)
        .await
        .unwrap_err();
    assert!(matches!(err, LoomError::Cancelled));
    assert_eq!(store.counts().await.unwrap().nodes, 0);
}

#[tokio::test]
async fn malformed_claim_replies_do_not_fail_the_document() {
    let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    // Every claim call (and its repair) returns garbage.
    let chat = MockChatProvider::new().with_fallback("not json at all");
    let ctx = context_with(chat, store.clone(), test_config());
    let pipeline = IngestPipeline::new(ctx);

    let report = pipeline
        .ingest(sample_document(), DocumentKind::PlainText)
        .await
        .unwrap();

    assert_eq!(report.counts.claims, 0);
    assert!(!report.diagnostics.is_empty());
    // The rest of the graph still committed.
    assert!(store.counts().await.unwrap().nodes > 0);
}

#[tokio::test]
async fn alias_definitions_enter_the_dictionary_after_commit() {
    let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    let chat = MockChatProvider::new().with_fallback("{}");
    let ctx = context_with(chat, store, test_config());
    let pipeline = IngestPipeline::new(ctx.clone());

    assert!(ctx.aliases.snapshot().is_empty());
    let report = pipeline
        .ingest(sample_document(), DocumentKind::PlainText)
        .await
        .unwrap();

    let snapshot = ctx.aliases.snapshot();
    let entry = snapshot
        .resolve("AI", Some(&report.document_id))
        .expect("parenthesis alias must be recorded");
    assert_eq!(entry.canonical, "人工智能");
}

#[tokio::test]
async fn sqlite_backend_supports_the_same_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn GraphStore> = Arc::new(
        graphloom::store::SqliteGraphStore::open(dir.path().join("graph.db"))
            .await
            .unwrap(),
    );
    let chat = MockChatProvider::new().with_fallback(claims_reply("人工智能是一种技术。"));
    let ctx = context_with(chat, store.clone(), test_config());
    let pipeline = IngestPipeline::new(ctx.clone());
    let version = BuildVersion::from_tag("sqlite-1");

    let status = StatusHandle::new();
    pipeline
        .ingest_with_status(
            sample_document(),
            DocumentKind::PlainText,
            &status,
            Some(version.clone()),
        )
        .await
        .unwrap();
    let first = store.counts().await.unwrap();
    assert!(first.nodes > 0);

    // Idempotence and rollback hold on disk too.
    pipeline
        .ingest_with_status(
            sample_document(),
            DocumentKind::PlainText,
            &status,
            Some(version.clone()),
        )
        .await
        .unwrap();
    assert_eq!(store.counts().await.unwrap(), first);

    ctx.graph.rollback(&version).await.unwrap();
    assert_eq!(store.counts().await.unwrap().nodes, 0);
}

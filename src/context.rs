//! Explicit pipeline context: configuration, provider handles, graph
//! service, alias dictionary, and the cancellation token.
//!
//! Every stage takes a `&PipelineContext` instead of reaching for globals.
//! The context also owns the two suspension-point helpers ([`chat`] and
//! [`embed`]): both poll cancellation first and enforce the per-request
//! budget, so stages stay plain sequential code.
//!
//! [`chat`]: PipelineContext::chat
//! [`embed`]: PipelineContext::embed

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::aliases::AliasDictionary;
use crate::config::GraphLoomConfig;
use crate::governor::GovernorState;
use crate::graph::GraphService;
use crate::ontology::Ontology;
use crate::providers::{
    ChatMessage, ChatProvider, ChatRequest, EmbeddingCache, EmbeddingProvider, ProviderError,
};
use crate::store::GraphStore;
use crate::types::LoomError;

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<GraphLoomConfig>,
    pub chat_provider: Arc<dyn ChatProvider>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub graph: GraphService,
    pub aliases: AliasDictionary,
    pub ontology: Arc<Ontology>,
    pub governor_state: GovernorState,
    pub embed_cache: EmbeddingCache,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("config", &self.config)
            .field("aliases", &self.aliases)
            .field("ontology", &self.ontology)
            .field("governor_state", &self.governor_state)
            .field("embed_cache", &self.embed_cache)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    pub fn builder() -> PipelineContextBuilder {
        PipelineContextBuilder::default()
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        self.graph.store()
    }

    /// Poll the cancellation token; call this at every suspension point.
    pub fn check_cancelled(&self) -> Result<(), LoomError> {
        if self.cancel.is_cancelled() {
            Err(LoomError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// One chat call under the configured model, temperature, and
    /// per-request budget.
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, LoomError> {
        self.check_cancelled()?;
        let providers = &self.config.providers;
        let request = ChatRequest {
            messages,
            model: providers.llm_model.clone(),
            max_tokens: providers.max_tokens,
            temperature: providers.temperature,
        };
        let budget_ms = providers.request_timeout_ms;
        let response = tokio::time::timeout(
            Duration::from_millis(budget_ms),
            self.chat_provider.chat_completion(request),
        )
        .await
        .map_err(|_| LoomError::Timeout {
            what: "chat completion",
            budget_ms,
        })?
        .map_err(|err| provider_error("chat", err, budget_ms))?;
        self.check_cancelled()?;
        tracing::debug!(
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "chat completion finished"
        );
        Ok(response.text)
    }

    /// Batched, cached embedding of `texts` under the per-request budget.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LoomError> {
        self.check_cancelled()?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let providers = &self.config.providers;
        let budget_ms = providers.request_timeout_ms;
        let vectors = tokio::time::timeout(
            Duration::from_millis(budget_ms),
            self.embed_cache
                .embed_all(self.embedder.as_ref(), texts, providers.embed_batch_size),
        )
        .await
        .map_err(|_| LoomError::Timeout {
            what: "embedding",
            budget_ms,
        })?
        .map_err(|err| provider_error("embedding", err, budget_ms))?;
        self.check_cancelled()?;
        Ok(vectors)
    }

    /// Single-text convenience over [`embed`](Self::embed).
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, LoomError> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        Ok(vectors.remove(0))
    }
}

fn provider_error(provider: &'static str, err: ProviderError, budget_ms: u64) -> LoomError {
    match err {
        ProviderError::Timeout => LoomError::Timeout {
            what: provider,
            budget_ms,
        },
        other => LoomError::Provider {
            provider,
            message: other.to_string(),
        },
    }
}

/// Builder for [`PipelineContext`]; validates configuration and checks the
/// embedder's dimensionality against `providers.embed_dim`.
#[derive(Default)]
pub struct PipelineContextBuilder {
    config: Option<GraphLoomConfig>,
    chat_provider: Option<Arc<dyn ChatProvider>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    store: Option<Arc<dyn GraphStore>>,
    aliases: Option<AliasDictionary>,
    cancel: Option<CancellationToken>,
}

impl PipelineContextBuilder {
    #[must_use]
    pub fn config(mut self, config: GraphLoomConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn chat_provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.chat_provider = Some(provider);
        self
    }

    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn aliases(mut self, aliases: AliasDictionary) -> Self {
        self.aliases = Some(aliases);
        self
    }

    #[must_use]
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> Result<PipelineContext, LoomError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let chat_provider = self
            .chat_provider
            .ok_or_else(|| LoomError::Input("pipeline context requires a chat provider".to_string()))?;
        let embedder = self
            .embedder
            .ok_or_else(|| LoomError::Input("pipeline context requires an embedder".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| LoomError::Input("pipeline context requires a graph store".to_string()))?;
        if embedder.dimension() != config.providers.embed_dim {
            return Err(LoomError::Input(format!(
                "embedder dimension {} does not match configured embed_dim {}",
                embedder.dimension(),
                config.providers.embed_dim
            )));
        }
        let ontology = Arc::new(Ontology::from_config(&config.ontology));
        let governor_state = GovernorState::from_config(&config.governor);
        let graph = GraphService::new(store, config.store.clone());
        Ok(PipelineContext {
            config: Arc::new(config),
            chat_provider,
            embedder,
            graph,
            aliases: self.aliases.unwrap_or_default(),
            ontology,
            governor_state,
            embed_cache: EmbeddingCache::new(),
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockChatProvider, MockEmbeddingProvider};
    use crate::store::MemoryGraphStore;

    fn builder_with(dim: usize, config: GraphLoomConfig) -> PipelineContextBuilder {
        PipelineContext::builder()
            .config(config)
            .chat_provider(Arc::new(MockChatProvider::new()))
            .embedder(Arc::new(MockEmbeddingProvider::new(dim)))
            .store(Arc::new(MemoryGraphStore::new()))
    }

    fn small_config() -> GraphLoomConfig {
        let mut config = GraphLoomConfig::default();
        config.providers.embed_dim = 16;
        config
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_fast() {
        let err = builder_with(8, small_config()).build().unwrap_err();
        assert!(err.to_string().contains("embed_dim"));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_suspension_points() {
        let cancel = CancellationToken::new();
        let ctx = builder_with(16, small_config())
            .cancellation(cancel.clone())
            .build()
            .unwrap();
        cancel.cancel();
        let err = ctx.embed(&["text".to_string()]).await.unwrap_err();
        assert!(matches!(err, LoomError::Cancelled));
        let err = ctx.chat(vec![ChatMessage::user("q")]).await.unwrap_err();
        assert!(matches!(err, LoomError::Cancelled));
    }

    #[tokio::test]
    async fn embed_goes_through_cache() {
        let ctx = builder_with(16, small_config()).build().unwrap();
        ctx.embed(&["same text".to_string()]).await.unwrap();
        ctx.embed(&["same text".to_string()]).await.unwrap();
        assert!(ctx.embed_cache.hit_count() >= 1);
    }
}

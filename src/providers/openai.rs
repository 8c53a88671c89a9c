//! OpenAI-compatible HTTP providers.
//!
//! Speaks the `/chat/completions` and `/embeddings` shapes served by OpenAI
//! and by the self-hosted gateways that imitate it. The per-request timeout
//! from [`crate::config::ProviderConfig`] is baked into the `reqwest`
//! client; per-stage budgets are enforced by the caller.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatUsage, EmbeddingProvider,
    ProviderError,
};
use async_trait::async_trait;

fn build_client(timeout_ms: u64) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|err| ProviderError::Http(err.to_string()))
}

fn classify(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Http(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        message,
    })
}

// ── Chat ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct OpenAiChatProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionReply {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsageReply>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct UsageReply {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenAiChatProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout_ms: u64,
    ) -> Result<Self, ProviderError> {
        Ok(OpenAiChatProvider {
            client: build_client(timeout_ms)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = ChatCompletionBody {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify)?;
        let reply: ChatCompletionReply = check_status(response)
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in reply".to_string()))?;
        let usage = reply.usage.unwrap_or_default();
        Ok(ChatResponse {
            text: choice.message.content,
            usage: ChatUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
        })
    }
}

// ── Embeddings ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct OpenAiEmbeddingProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingReply {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        timeout_ms: u64,
    ) -> Result<Self, ProviderError> {
        Ok(OpenAiEmbeddingProvider {
            client: build_client(timeout_ms)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingBody {
            model: &self.model,
            input: texts,
        };
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify)?;
        let reply: EmbeddingReply = check_status(response)
            .await?
            .json()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))?;
        if reply.data.len() != texts.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                reply.data.len()
            )));
        }
        let mut rows = reply.data;
        rows.sort_by_key(|row| row.index);
        for row in &rows {
            if row.embedding.len() != self.dimension {
                return Err(ProviderError::InvalidResponse(format!(
                    "embedding dimension {} does not match configured {}",
                    row.embedding.len(),
                    self.dimension
                )));
            }
        }
        Ok(rows.into_iter().map(|row| row.embedding).collect())
    }
}

//! Model-provider contracts and implementations.
//!
//! The pipeline talks to two external services: a chat-completion model and
//! an embedding model. Both are behind traits so every stage is testable
//! with the deterministic mocks in [`mock`]; the [`openai`] module speaks
//! the OpenAI-compatible HTTP shape most deployments expose.
//!
//! Embedding calls are the only place the pipeline batches; the
//! [`cache::EmbeddingCache`] sits in front of the provider and dedups by
//! text hash so re-ingesting unchanged text costs nothing.

pub mod cache;
pub mod mock;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::EmbeddingCache;
pub use mock::{MockChatProvider, MockEmbeddingProvider};
pub use openai::{OpenAiChatProvider, OpenAiEmbeddingProvider};

/// Errors from provider calls. `Timeout` is retry-safe; the rest surface to
/// the stage, which decides between skipping the chunk and failing the job.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http transport error: {0}")]
    Http(String),

    #[error("provider returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("provider call timed out")]
    Timeout,

    #[error("malformed provider response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Token accounting reported by the provider (zeroed for mocks).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: ChatUsage,
}

/// Parameters for one chat call; model name and budgets come from config.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// The chat-completion contract.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// The embedding contract. Implementations must return one vector per input
/// text, in order, all of [`dimension`](Self::dimension) length.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

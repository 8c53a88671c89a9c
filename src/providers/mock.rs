//! Deterministic providers for tests and offline runs.
//!
//! The mock embedder hashes tokens into buckets, so texts that share
//! vocabulary get similar vectors, enough signal for vector recall and
//! theme similarity to behave sensibly in tests without any network. The
//! mock chat provider replays a scripted queue of responses and records
//! every request it sees.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;

use super::{
    ChatProvider, ChatRequest, ChatResponse, ChatUsage, EmbeddingProvider, ProviderError,
};
use crate::text::tokenize;
use async_trait::async_trait;

// ── Embeddings ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MockEmbeddingProvider {
    dimension: usize,
}

impl MockEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        MockEmbeddingProvider { dimension }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        let tokens = tokenize(text);
        if tokens.is_empty() {
            vector[bucket(text, self.dimension)] = 1.0;
            return vector;
        }
        for token in &tokens {
            vector[bucket(token, self.dimension)] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        MockEmbeddingProvider::new(64)
    }
}

fn bucket(token: &str, dimension: usize) -> usize {
    let digest = Sha256::digest(token.as_bytes());
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(raw) % dimension as u64) as usize
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

// ── Chat ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockChatState {
    script: VecDeque<String>,
    requests: Vec<ChatRequest>,
    fallback: Option<String>,
}

/// Replays scripted responses in order. With an exhausted script and no
/// fallback, calls fail, which is usually the right way for a test to
/// notice an unexpected extra model call.
#[derive(Clone, Default)]
pub struct MockChatProvider {
    state: Arc<Mutex<MockChatState>>,
}

impl MockChatProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue the next scripted response.
    pub fn push_response(&self, text: impl Into<String>) {
        self.state.lock().script.push_back(text.into());
    }

    /// Response used whenever the script runs dry.
    pub fn with_fallback(self, text: impl Into<String>) -> Self {
        self.state.lock().fallback = Some(text.into());
        self
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.state.lock().requests.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().requests.len()
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut state = self.state.lock();
        state.requests.push(request);
        let text = state
            .script
            .pop_front()
            .or_else(|| state.fallback.clone())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("mock chat script exhausted".to_string())
            })?;
        Ok(ChatResponse {
            text,
            usage: ChatUsage::default(),
        })
    }
}

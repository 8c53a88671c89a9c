//! Process-local embedding cache keyed by text hash.
//!
//! Optional by construction: stages call [`EmbeddingCache::embed_all`] and
//! get batching plus dedup for free; a fresh cache degrades to plain
//! batched provider calls. Entries never expire: the cache lives as long
//! as the process and re-ingestion workloads repeat text heavily.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use super::{EmbeddingProvider, ProviderError};
use crate::text::sha256_hex;

#[derive(Debug, Default, Clone)]
pub struct EmbeddingCache {
    inner: Arc<Mutex<FxHashMap<String, Vec<f32>>>>,
    hits: Arc<Mutex<u64>>,
    misses: Arc<Mutex<u64>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embed `texts`, consulting the cache first and batching the misses
    /// through the provider `batch_size` texts at a time. Output order
    /// matches input order.
    pub async fn embed_all(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
        batch_size: usize,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let batch_size = batch_size.max(1);
        let keys: Vec<String> = texts.iter().map(|text| sha256_hex(&[text])).collect();

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut missing: Vec<usize> = Vec::new();
        {
            let cache = self.inner.lock();
            for (i, key) in keys.iter().enumerate() {
                if let Some(vector) = cache.get(key) {
                    results[i] = Some(vector.clone());
                } else {
                    missing.push(i);
                }
            }
        }
        *self.hits.lock() += (texts.len() - missing.len()) as u64;
        *self.misses.lock() += missing.len() as u64;

        // Dedup identical texts within the miss set so the provider sees
        // each distinct text once.
        let mut distinct: Vec<usize> = Vec::new();
        let mut first_for_key: FxHashMap<&str, usize> = FxHashMap::default();
        for &i in &missing {
            if !first_for_key.contains_key(keys[i].as_str()) {
                first_for_key.insert(keys[i].as_str(), i);
                distinct.push(i);
            }
        }

        for window in distinct.chunks(batch_size) {
            let batch: Vec<String> = window.iter().map(|&i| texts[i].clone()).collect();
            let vectors = provider.embed_batch(&batch).await?;
            if vectors.len() != batch.len() {
                return Err(ProviderError::InvalidResponse(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            let mut cache = self.inner.lock();
            for (&i, vector) in window.iter().zip(vectors) {
                cache.insert(keys[i].clone(), vector);
            }
        }

        let cache = self.inner.lock();
        for (i, key) in keys.iter().enumerate() {
            if results[i].is_none() {
                results[i] = cache.get(key).cloned();
            }
        }
        results
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| {
                    ProviderError::InvalidResponse("embedding missing after fill".to_string())
                })
            })
            .collect()
    }

    /// Convenience for a single text.
    pub async fn embed_one(
        &self,
        provider: &dyn EmbeddingProvider,
        text: &str,
    ) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self
            .embed_all(provider, std::slice::from_ref(&text.to_string()), 1)
            .await?;
        Ok(vectors.remove(0))
    }

    pub fn hit_count(&self) -> u64 {
        *self.hits.lock()
    }

    pub fn miss_count(&self) -> u64 {
        *self.misses.lock()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

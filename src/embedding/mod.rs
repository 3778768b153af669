//! Embedding port: turns text into vectors, backed by whichever provider is configured.

mod gemini;
mod openai;

pub use gemini::GeminiEmbedder;
pub use openai::OpenAiEmbedder;

use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("empty result from embedding provider")]
    EmptyResult,

    #[error("embedding provider error: {0}")]
    Provider(String),
}

/// Capability interface over whatever embedding provider is configured —
/// callers never branch on OpenAI vs. Gemini themselves.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut batch = self.embed_batch(&[text]).await?;
        batch.pop().ok_or(EmbeddingError::EmptyResult)
    }
}

/// Embeds `text` after rejecting empty/whitespace-only input (§4.1).
pub async fn embed_validated(
    embedder: &dyn Embedder,
    text: &str,
) -> Result<Vec<f32>, crate::error::KbError> {
    if text.trim().is_empty() {
        return Err(crate::error::KbError::InvalidInput(
            "embedding input must be non-empty".to_string(),
        ));
    }
    embedder
        .embed_one(text)
        .await
        .map_err(|e| crate::error::KbError::ProviderBusy(e.to_string()))
}

/// Construct the `Embedder` for the configured provider.
pub fn build_embedder(config: &crate::config::Config) -> Result<Box<dyn Embedder>, EmbeddingError> {
    match config.provider {
        crate::config::Provider::OpenAi => {
            let api_key = config
                .openai_api_key
                .clone()
                .ok_or_else(|| EmbeddingError::Provider("OPENAI_API_KEY not set".to_string()))?;
            Ok(Box::new(OpenAiEmbedder::new(
                api_key,
                config.openai_embedding_model.clone(),
            )))
        }
        crate::config::Provider::Gemini => {
            let api_key = config
                .gemini_api_key
                .clone()
                .ok_or_else(|| EmbeddingError::Provider("GEMINI_API_KEY not set".to_string()))?;
            Ok(Box::new(GeminiEmbedder::new(
                api_key,
                config.gemini_embedding_model.clone(),
            )))
        }
    }
}

/// Deterministic in-process stand-in for tests: hashes each text into a
/// fixed-dimension vector so similarity comparisons are stable across runs
/// without hitting a real provider.
pub struct MockEmbedder {
    dimension: usize,
    calls: Mutex<usize>,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    fn hash_embed(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(text.as_bytes());
        (0..self.dimension)
            .map(|i| {
                let byte = digest[i % digest.len()];
                (byte as f32 / 255.0) * 2.0 - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        *self.calls.lock().unwrap() += 1;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        Ok(texts.iter().map(|t| self.hash_embed(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(8);
        let a = embedder.embed_one("hello world").await.unwrap();
        let b = embedder.embed_one("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[tokio::test]
    async fn mock_embedder_counts_calls() {
        let embedder = MockEmbedder::new(4);
        embedder.embed_batch(&["a", "b"]).await.unwrap();
        embedder.embed_batch(&["c"]).await.unwrap();
        assert_eq!(embedder.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_embedder_empty_batch_is_empty() {
        let embedder = MockEmbedder::new(4);
        let out = embedder.embed_batch(&[]).await.unwrap();
        assert!(out.is_empty());
    }
}

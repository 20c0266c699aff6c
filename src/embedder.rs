//! Embedding service.
//!
//! OpenAI-compatible embeddings endpoint with batching, exponential backoff
//! and a zero-vector degraded fallback for batches that exhaust retries.

use crate::config::EMBEDDING_DIM;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Maximum number of texts per embedding API call.
pub const MAX_BATCH_SIZE: usize = 2048;

/// Attempts per batch before falling back to zero vectors.
pub const MAX_RETRIES: u32 = 3;

pub type Embedding = Vec<f32>;

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed a batch of texts. Partial failure is degraded, not fatal: a
    /// batch that exhausts retries contributes zero vectors.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

pub struct OpenAiEmbedder {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }

    async fn call_api(&self, input: serde_json::Value) -> Result<Vec<Embedding>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Embedding(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Embedding(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Embedding(format!("Failed to parse embedding response: {}", e)))?;

        let data = response_json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| AgentError::Embedding("No embedding data in response".to_string()))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for entry in data {
            let vector: Embedding = entry
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    AgentError::Embedding("No embedding vector in response".to_string())
                })?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            embeddings.push(vector);
        }

        Ok(embeddings)
    }

    /// Retry a batch with exponential backoff, falling back to zero vectors
    /// when retries are exhausted.
    async fn embed_batch_with_retry(&self, batch: &[String]) -> Vec<Embedding> {
        for attempt in 0..MAX_RETRIES {
            match self.call_api(serde_json::json!(batch)).await {
                Ok(embeddings) if embeddings.len() == batch.len() => return embeddings,
                Ok(embeddings) => {
                    tracing::warn!(
                        expected = batch.len(),
                        got = embeddings.len(),
                        "embedding batch returned wrong count"
                    );
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "embedding batch failed");
                }
            }
            if attempt + 1 < MAX_RETRIES {
                let wait = Duration::from_secs(2u64.pow(attempt));
                tokio::time::sleep(wait).await;
            }
        }

        tracing::error!(
            batch_size = batch.len(),
            "embedding batch exhausted retries, using zero vectors"
        );
        vec![vec![0.0; EMBEDDING_DIM]; batch.len()]
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let clean = text.replace('\n', " ");
        let embeddings = self.call_api(serde_json::json!([clean])).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Embedding("Empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH_SIZE) {
            let embeddings = self.embed_batch_with_retry(batch).await;
            all.extend(embeddings);
        }
        Ok(all)
    }
}

//! Embedding providers.
//!
//! [`EmbeddingProvider`] is the seam between the enrich stage and the
//! outside world. [`HttpEmbeddings`] talks to a real endpoint;
//! [`SimulatedEmbeddings`] produces deterministic vectors for stress
//! runs and tests without network access or rate-limit spend.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::EmbedError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
    fn dimensions(&self) -> usize;
    fn model(&self) -> &str;
}

/// Deterministic provider: the vector is a pure function of the text.
///
/// Seeded from the text's sha256 digest and expanded with xorshift, then
/// L2-normalized, so equal inputs always produce equal vectors.
pub struct SimulatedEmbeddings {
    dimensions: usize,
}

impl SimulatedEmbeddings {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for SimulatedEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let digest = Sha256::digest(text.as_bytes());
        let mut state = u64::from_le_bytes(digest[..8].try_into().unwrap_or([1; 8])).max(1);
        let mut vector = Vec::with_capacity(self.dimensions);
        for _ in 0..self.dimensions {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            // Map to [-1, 1).
            vector.push((state as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32);
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        "simulated"
    }
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// HTTP provider posting `{"model", "input"}` and reading back
/// `{"embedding": [...]}`.
pub struct HttpEmbeddings {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
}

impl HttpEmbeddings {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, EmbedError> {
        let endpoint =
            Url::parse(endpoint).map_err(|err| EmbedError::Rejected(err.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| EmbedError::Rejected(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            model: model.into(),
            dimensions,
            api_key: std::env::var("LEXGRAPH_EMBED_API_KEY").ok(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&serde_json::json!({
            "model": self.model,
            "input": text,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|err| {
            // Transport failures and timeouts are worth retrying.
            EmbedError::Transient(err.to_string())
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(EmbedError::Transient(format!(
                "provider returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Rejected(format!("{status}: {body}")));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|err| EmbedError::Rejected(err.to_string()))?;
        if parsed.embedding.len() != self.dimensions {
            return Err(EmbedError::Rejected(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                parsed.embedding.len()
            )));
        }
        Ok(parsed.embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        &self.model
    }
}

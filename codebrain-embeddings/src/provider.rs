//! Embedding providers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::debug;

use crate::error::{EmbeddingError, Result};

/// Generic embedding model seam
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Generate one embedding per input text, in input order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Number of dimensions this model produces
    fn dimensions(&self) -> usize;

    /// Model identifier
    fn model_id(&self) -> &str;
}

/// OpenAI-compatible embedding provider
///
/// Works against the OpenAI API and any server speaking the same
/// `/embeddings` shape.
#[derive(Debug)]
pub struct OpenAiEmbedding {
    model: String,
    api_key: String,
    base_url: String,
    dimensions: usize,
    client: reqwest::Client,
}

impl OpenAiEmbedding {
    /// Create a provider reading the API key from `api_key_env`
    ///
    /// # Errors
    ///
    /// Returns `EmbeddingError::Config` if the environment variable is
    /// unset.
    pub fn new(
        model: &str,
        dimensions: usize,
        api_key_env: &str,
        base_url: Option<&str>,
    ) -> Result<Self> {
        let api_key = env::var(api_key_env).map_err(|_| {
            EmbeddingError::Config(format!("API key environment variable {api_key_env} not set"))
        })?;
        Ok(Self {
            model: model.to_string(),
            api_key,
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            dimensions,
            client: reqwest::Client::new(),
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                input: texts,
                model: &self.model,
                encoding_format: "float",
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Provider(format!(
                "embedding API returned {status}: {body}"
            )));
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        // Order by index; the API does not promise input order.
        parsed.data.sort_by_key(|d| d.index);
        debug!(count = parsed.data.len(), model = %self.model, "Embedded batch");
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Deterministic offline embedding
///
/// Hashes tokens into a fixed-width vector. Not a semantic model: it
/// exists for air-gapped setups and tests, where determinism matters more
/// than quality. Identical texts always produce identical vectors.
pub struct LocalHashEmbedding {
    dimensions: usize,
}

impl LocalHashEmbedding {
    /// Create with the given dimension count
    #[must_use]
    pub const fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
            for byte in token.bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0100_0000_01b3);
            }
            let slot = (hash as usize) % self.dimensions;
            vector[slot] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingModel for LocalHashEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        "local-hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_hash_is_deterministic() {
        let model = LocalHashEmbedding::new(64);
        let a = model.embed(&["fn main() {}".to_string()]).await.unwrap();
        let b = model.embed(&["fn main() {}".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
    }

    #[tokio::test]
    async fn test_local_hash_distinguishes_texts() {
        let model = LocalHashEmbedding::new(64);
        let out = model
            .embed(&["alpha beta".to_string(), "gamma delta".to_string()])
            .await
            .unwrap();
        assert_ne!(out[0], out[1]);
    }

    #[test]
    fn test_openai_requires_api_key() {
        env::remove_var("CODEBRAIN_TEST_MISSING_KEY");
        let err = OpenAiEmbedding::new(
            "text-embedding-3-small",
            1536,
            "CODEBRAIN_TEST_MISSING_KEY",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EmbeddingError::Config(_)));
    }
}

//! Text embeddings for guideline similarity search.
//!
//! Two implementations:
//! - **HashEmbedder**: deterministic, offline. Seeds a PRNG from the text so
//!   identical input always yields the identical vector within a process.
//!   Only exact-text matches score high; it carries no semantics.
//! - **HttpEmbedder**: OpenAI-compatible `/embeddings` endpoint over reqwest.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::{ConfigError, EmbeddingError};

/// Embedding vector type.
pub type Embedding = Vec<f32>;

/// Trait for text embedding services. Inject as `Arc<dyn Embedder>`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for `text`. Empty text is rejected.
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Model identifier, for logging and persisted rows.
    fn model_name(&self) -> &str;

    /// Embedding dimension.
    fn dimension(&self) -> usize;
}

/// Cosine similarity of two vectors. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ── Hash embedder ───────────────────────────────────────────────────

/// Fixed-seed pseudo-embedder.
pub struct HashEmbedder {
    dimension: usize,
    seed: u64,
}

impl HashEmbedder {
    pub const DEFAULT_DIMENSION: usize = 256;

    pub fn new(dimension: usize, seed: u64) -> Self {
        Self {
            dimension: dimension.max(1),
            seed,
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION, 0x10D1C)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        text.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());

        let mut v: Embedding = (0..self.dimension)
            .map(|_| rng.gen_range(-1.0f32..=1.0))
            .collect();
        l2_normalize(&mut v);
        Ok(v)
    }

    fn model_name(&self) -> &str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ── HTTP embedder ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible embeddings client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::RequestFailed {
                provider: "http".to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let request_failed = |reason: String| EmbeddingError::RequestFailed {
            provider: self.model.clone(),
            reason,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({
                "model": self.model,
                "input": text,
            }))
            .send()
            .await
            .map_err(|e| request_failed(e.to_string()))?
            .error_for_status()
            .map_err(|e| request_failed(e.to_string()))?
            .json::<EmbeddingResponse>()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse {
                provider: self.model.clone(),
                reason: e.to_string(),
            })?;

        let mut embedding = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::InvalidResponse {
                provider: self.model.clone(),
                reason: "no embedding in response".to_string(),
            })?;
        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ── Configuration ───────────────────────────────────────────────────

/// Which embedder to build.
#[derive(Debug, Clone)]
pub enum EmbeddingConfig {
    Hash { dimension: usize, seed: u64 },
    Http {
        endpoint: String,
        api_key: SecretString,
        model: String,
        dimension: usize,
        timeout: Duration,
    },
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self::Hash {
            dimension: HashEmbedder::DEFAULT_DIMENSION,
            seed: 0x10D1C,
        }
    }
}

impl EmbeddingConfig {
    /// `COMPLIANCE_EMBEDDING_URL` selects the HTTP embedder (key from
    /// `COMPLIANCE_EMBEDDING_API_KEY`, falling back to `OPENAI_API_KEY`).
    /// Without it the hash embedder is used.
    pub fn from_env() -> Result<Self, ConfigError> {
        let Ok(endpoint) = std::env::var("COMPLIANCE_EMBEDDING_URL") else {
            return Ok(Self::default());
        };
        let api_key = std::env::var("COMPLIANCE_EMBEDDING_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| ConfigError::MissingEnvVar("COMPLIANCE_EMBEDDING_API_KEY".to_string()))?;
        let model = std::env::var("COMPLIANCE_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let dimension = match std::env::var("COMPLIANCE_EMBEDDING_DIMENSION") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "COMPLIANCE_EMBEDDING_DIMENSION".to_string(),
                message: format!("not a positive integer: {raw}"),
            })?,
            Err(_) => 1536,
        };
        Ok(Self::Http {
            endpoint,
            api_key: SecretString::from(api_key),
            model,
            dimension,
            timeout: Duration::from_secs(30),
        })
    }
}

/// Build an embedder from configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    match config {
        EmbeddingConfig::Hash { dimension, seed } => {
            tracing::info!(dimension, "Using hash embedder (exact-text similarity only)");
            Ok(Arc::new(HashEmbedder::new(*dimension, *seed)))
        }
        EmbeddingConfig::Http {
            endpoint,
            api_key,
            model,
            dimension,
            timeout,
        } => {
            tracing::info!(endpoint = %endpoint, model = %model, "Using HTTP embedder");
            Ok(Arc::new(HttpEmbedder::new(
                endpoint.clone(),
                api_key.clone(),
                model.clone(),
                *dimension,
                *timeout,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let e = HashEmbedder::default();
        let a = e.embed("Reply STOP to unsubscribe").await.unwrap();
        let b = e.embed("Reply STOP to unsubscribe").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), HashEmbedder::DEFAULT_DIMENSION);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hash_embedder_distinct_texts_are_dissimilar() {
        let e = HashEmbedder::default();
        let a = e.embed("carrier guidelines for retail").await.unwrap();
        let b = e.embed("carrier guidelines for healthcare").await.unwrap();
        assert!(cosine_similarity(&a, &b) < 0.5);
    }

    #[tokio::test]
    async fn empty_text_rejected() {
        let e = HashEmbedder::default();
        assert!(matches!(
            e.embed("   ").await,
            Err(EmbeddingError::EmptyInput)
        ));
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[3.0, 4.0], &[6.0, 8.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn create_embedder_defaults_to_hash() {
        let e = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(e.model_name(), "hash");
    }
}

//! Embedding providers.
//!
//! The pipeline talks to providers through [`EmbeddingProvider`]; the bundled
//! implementation speaks the OpenAI-compatible `/embeddings` HTTP shape.
//! Providers do not retry internally. Retry, backoff and throttling are
//! centralized in the pipeline so concurrent workers share one rate picture.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::IndexError;

/// How an embedding failure should be handled upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedErrorKind {
    /// Provider asked us to slow down. Retry after raising the throttle.
    RateLimited,
    /// Transient failure (5xx, connection reset). Retry with backoff.
    Transient,
    /// Will not succeed on retry (auth, bad request). Fail the batch.
    NonRetryable,
}

/// An embedding request failure, classified for retry handling.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EmbedError {
    pub kind: EmbedErrorKind,
    pub message: String,
}

impl EmbedError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: EmbedErrorKind::RateLimited,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: EmbedErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: EmbedErrorKind::NonRetryable,
            message: message.into(),
        }
    }

    /// Classify an HTTP error response. Some providers return rate-limit
    /// complaints under non-429 statuses, so the body text is checked too.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("embedding request failed ({status}): {body}");
        if status == StatusCode::TOO_MANY_REQUESTS || body.to_lowercase().contains("rate limit") {
            Self::rate_limited(message)
        } else if status.is_server_error() {
            Self::transient(message)
        } else {
            Self::non_retryable(message)
        }
    }
}

/// A single embedding with the provider's token accounting.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub tokens_used: usize,
}

/// Result of embedding a batch of texts, in input order.
#[derive(Debug, Clone)]
pub struct BatchEmbedding {
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens_used: usize,
}

/// Produces embedding vectors for text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedding, EmbedError>;

    /// Dimensionality of vectors this provider returns.
    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Per-model pacing hints for the shared throttle.
#[derive(Debug, Clone, Copy)]
pub struct ProviderLimits {
    /// Maximum concurrent in-flight requests.
    pub max_concurrency: usize,
    /// Minimum spacing between request starts.
    pub min_interval: Duration,
}

impl ProviderLimits {
    pub fn for_model(model: &str) -> Self {
        if model.starts_with("text-embedding") {
            Self {
                max_concurrency: 4,
                min_interval: Duration::from_millis(50),
            }
        } else if model.starts_with("voyage") {
            Self {
                max_concurrency: 3,
                min_interval: Duration::from_millis(100),
            }
        } else {
            Self {
                max_concurrency: 2,
                min_interval: Duration::ZERO,
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: usize,
}

/// OpenAI-compatible embedding provider over HTTP.
pub struct HttpEmbeddings {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbeddings {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, IndexError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(IndexError::Configuration(
                "embedding provider api_key is empty".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            dimensions,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<EmbeddingResponse, EmbedError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        debug!(model = %self.model, inputs = texts.len(), "sending embedding request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedError::transient(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::from_status(status, &body));
        }

        response
            .json::<EmbeddingResponse>()
            .await
            .map_err(|e| EmbedError::transient(format!("malformed embedding response: {e}")))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        let batch = self.embed_batch(&[text.to_string()]).await?;
        let vector = batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::transient("provider returned no embeddings"))?;
        Ok(Embedding {
            vector,
            tokens_used: batch.total_tokens_used,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedding, EmbedError> {
        if texts.is_empty() {
            return Ok(BatchEmbedding {
                vectors: vec![],
                total_tokens_used: 0,
            });
        }

        let response = self.request(texts).await?;
        if response.data.len() != texts.len() {
            return Err(EmbedError::transient(format!(
                "provider returned {} embeddings for {} inputs",
                response.data.len(),
                texts.len()
            )));
        }

        // Responses are not guaranteed to arrive in input order.
        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        let vectors = data.into_iter().map(|d| d.embedding).collect();

        Ok(BatchEmbedding {
            vectors,
            total_tokens_used: response.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

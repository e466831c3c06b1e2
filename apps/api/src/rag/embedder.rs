//! Text → vector collaborator.
//!
//! `OpenAiEmbedder` talks to any OpenAI-compatible `/embeddings` endpoint.
//! Callers wrap calls in `embed_with_deadline` so a slow upstream surfaces as
//! `EmbedError::Timeout` instead of hanging the request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("embedding call exceeded {0:?}")]
    Timeout(Duration),

    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("embedding response contained no vector")]
    EmptyResponse,

    #[error("cannot embed empty text")]
    EmptyInput,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Runs `embed` under a deadline. The in-flight request is dropped when the
/// deadline passes.
pub async fn embed_with_deadline(
    embedder: &dyn Embedder,
    text: &str,
    deadline: Duration,
) -> Result<Vec<f32>, EmbedError> {
    if text.trim().is_empty() {
        return Err(EmbedError::EmptyInput);
    }
    let vector = tokio::time::timeout(deadline, embedder.embed(text))
        .await
        .map_err(|_| EmbedError::Timeout(deadline))??;
    if vector.len() != embedder.dimension() {
        return Err(EmbedError::Dimension {
            expected: embedder.dimension(),
            actual: vector.len(),
        });
    }
    Ok(vector)
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    api_key: String,
    model: String,
    url: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, model: String, dimension: usize) -> Result<Self, EmbedError> {
        Ok(Self {
            client: Client::builder().build()?,
            api_key,
            model,
            url: OPENAI_EMBEDDINGS_URL.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbedError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbeddingResponse = response.json().await?;
        let vector = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or(EmbedError::EmptyResponse)?;

        debug!(model = %self.model, dims = vector.len(), "embedding generated");
        Ok(vector)
    }
}

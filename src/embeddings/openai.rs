//! OpenAI-compatible embedding API client.

use crate::embeddings::provider::EmbeddingProvider;
use crate::types::{DatabaseError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Remote embedding provider speaking the OpenAI embeddings API.
pub struct OpenAiEmbedder {
    tag: String,
    api_key: String,
    api_base: String,
    model: String,
    dim: usize,
    client: Client,
}

impl OpenAiEmbedder {
    /// Create an embedder for `model` against the default API endpoint.
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base(api_key, model, "https://api.openai.com/v1".to_string())
    }

    /// Create an embedder against a custom OpenAI-compatible endpoint.
    pub fn with_base(api_key: String, model: String, api_base: String) -> Self {
        let dim = match model.as_str() {
            "text-embedding-3-small" => 1536,
            "text-embedding-3-large" => 3072,
            "text-embedding-ada-002" => 1536,
            _ => 1536,
        };

        Self {
            tag: format!("openai:{model}"),
            api_key,
            api_base,
            model,
            dim,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.tag
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| DatabaseError::DependencyUnavailable(format!("embedding request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(DatabaseError::EmbeddingError(format!(
                "embedding API error ({status}): {body}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| DatabaseError::EmbeddingError(format!("bad embedding response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(DatabaseError::EmbeddingError(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

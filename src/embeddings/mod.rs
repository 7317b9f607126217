//! Embedding generation behind a pluggable provider registry.
//!
//! Providers are registered at startup and selected by string tag. Writes
//! never fail because a provider is down: the vector record is committed with
//! `stale = true` and retried by the re-embed sweep.

pub mod openai;
pub mod provider;

pub use openai::OpenAiEmbedder;
pub use provider::{cosine_distance, cosine_similarity, EmbeddingProvider};

use crate::schema::Schema;
use crate::types::{DatabaseError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Join the schema's embedding fields into the text that gets embedded.
///
/// Fields are joined with `\n` in schema-declared order; missing fields
/// contribute an empty line so the hash changes when a field appears.
pub fn embedding_text(schema: &Schema, properties: &serde_json::Value) -> String {
    schema
        .extensions
        .embedding_fields
        .iter()
        .map(|field| {
            crate::types::entity::property_at_path(properties, field)
                .and_then(|v| v.as_str())
                .unwrap_or("")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// BLAKE3 hash of the embedded text, hex-encoded.
///
/// Stored with the vector record so staleness is detectable without
/// re-embedding.
pub fn text_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Name-keyed registry of embedding providers with bounded concurrency.
///
/// Each `embed` call takes a pool permit; callers beyond the pool queue up to
/// a fixed depth and then fail `Overloaded`.
pub struct ProviderRegistry {
    providers: std::sync::RwLock<HashMap<String, Arc<dyn EmbeddingProvider>>>,
    default_tag: String,
    /// Permits actually running against the provider.
    pool: Arc<Semaphore>,
    /// Running + queued; beyond this, `Overloaded`.
    slots: Arc<Semaphore>,
    timeout: Duration,
}

impl ProviderRegistry {
    /// Create a registry with the given pool size and queue depth.
    pub fn new(default_tag: String, concurrency: usize, queue_depth: usize, timeout: Duration) -> Self {
        Self {
            providers: std::sync::RwLock::new(HashMap::new()),
            default_tag,
            pool: Arc::new(Semaphore::new(concurrency)),
            slots: Arc::new(Semaphore::new(concurrency + queue_depth)),
            timeout,
        }
    }

    /// Register a provider under its own tag.
    pub fn register(&self, provider: Arc<dyn EmbeddingProvider>) {
        if let Ok(mut providers) = self.providers.write() {
            providers.insert(provider.name().to_string(), provider);
        }
    }

    /// All registered tags (for schema validation).
    pub fn names(&self) -> HashSet<String> {
        self.providers
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.read().map(|p| p.is_empty()).unwrap_or(true)
    }

    /// Resolve a tag, falling back to the default.
    pub fn get(&self, tag: Option<&str>) -> Result<Arc<dyn EmbeddingProvider>> {
        let tag = tag.unwrap_or(&self.default_tag);
        self.providers
            .read()
            .ok()
            .and_then(|p| p.get(tag).cloned())
            .ok_or_else(|| DatabaseError::DependencyUnavailable(format!("no such provider: {tag}")))
    }

    /// Embed through the pool, respecting concurrency, queue depth, and the
    /// operation timeout.
    pub async fn embed(&self, tag: Option<&str>, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let provider = self.get(tag)?;

        let _slot = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| DatabaseError::Overloaded("embedding queue full".to_string()))?;
        let _permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DatabaseError::InternalError("embedding pool closed".to_string()))?;

        tokio::time::timeout(self.timeout, provider.embed(texts))
            .await
            .map_err(|_| DatabaseError::Timeout("embedding request".to_string()))?
    }
}

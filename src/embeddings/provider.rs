//! Embedding provider capability trait.

use crate::types::Result;
use async_trait::async_trait;

/// A source of fixed-dimension text embeddings.
///
/// Implementations are registered at startup and selected by tag (for
/// example `openai:text-embedding-3-small`). The core never loads models
/// itself; local model execution lives behind this trait in a collaborator
/// process or crate.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider tag, unique within the registry.
    fn name(&self) -> &str;

    /// Embedding dimensionality. Constant for the provider's lifetime.
    fn dim(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Cosine distance (1 - similarity), the metric used by the vector index.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

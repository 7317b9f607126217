//! Shared helpers for the integration suites.
#![allow(dead_code)]

use async_trait::async_trait;
use rem_db::config::{ReplicationMode, Settings};
use rem_db::embeddings::EmbeddingProvider;
use rem_db::types::Result;
use rem_db::Database;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DIM: usize = 16;

/// Deterministic bag-of-tokens embedder: each token hashes to a dimension,
/// vectors are L2-normalized. Texts sharing tokens land close in cosine
/// space, which is all the engine needs for ordering tests.
pub struct HashEmbedder;

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &str {
        "test:hash"
    }

    fn dim(&self) -> usize {
        DIM
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| embed_text(text)).collect())
    }
}

pub fn embed_text(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIM];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
    {
        let hash = blake3::hash(token.as_bytes());
        let index = (hash.as_bytes()[0] as usize) % DIM;
        vector[index] += 1.0;
    }
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

/// A provider that always fails, for staleness tests.
pub struct DownEmbedder;

#[async_trait]
impl EmbeddingProvider for DownEmbedder {
    fn name(&self) -> &str {
        "test:down"
    }

    fn dim(&self) -> usize {
        DIM
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(rem_db::DatabaseError::DependencyUnavailable(
            "provider offline".to_string(),
        ))
    }
}

pub fn settings(path: &Path, mode: ReplicationMode) -> Settings {
    Settings {
        db_path: path.to_path_buf(),
        tenant_id: "t1".to_string(),
        default_embedding_provider: "test:hash".to_string(),
        replication_mode: mode,
        replication_primary: None,
        wal_retention: Duration::from_secs(168 * 3600),
        operation_timeout: Duration::from_secs(5),
    }
}

/// Open a database with the hash embedder registered.
pub fn open_db(path: &Path, mode: ReplicationMode) -> Database {
    let db = Database::open(settings(path, mode), "t1").unwrap();
    db.register_provider(Arc::new(HashEmbedder));
    db
}

/// The article schema used across scenarios: deterministic ids by slug,
/// embeddings over title+content, an indexed category column, BM25 enabled.
pub fn article_schema() -> serde_json::Value {
    json!({
        "short_name": "article",
        "fully_qualified_name": "test.docs.Article",
        "version": "1.0.0",
        "properties": {
            "slug": {"type": "string", "description": "URL slug"},
            "title": {"type": "string", "description": "Title"},
            "content": {"type": "string", "description": "Body text"},
            "category": {"type": "string", "description": "Category tag"},
            "rating": {"type": "number", "description": "Editorial rating"}
        },
        "required": ["slug", "title"],
        "key_field": "slug",
        "embedding_fields": ["title", "content"],
        "indexed_columns": ["category", "rating"],
        "enable_bm25": true
    })
}

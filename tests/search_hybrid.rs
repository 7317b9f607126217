//! Vector search, staleness handling, and hybrid fusion.

mod common;

use common::{article_schema, embed_text, open_db, settings, DownEmbedder, HashEmbedder};
use rem_db::config::ReplicationMode;
use rem_db::embeddings::cosine_distance;
use rem_db::DatabaseError;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn search_orders_by_similarity() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    db.insert(
        "article",
        json!({"slug": "hello", "title": "Hello greetings", "content": "friendly welcome words"}),
    )
    .await
    .unwrap();
    db.insert(
        "article",
        json!({"slug": "goodbye", "title": "Goodbye", "content": "parting farewell words"}),
    )
    .await
    .unwrap();

    let hits = db.search("article", "hello greetings welcome", 2, None).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0.property("slug").unwrap(), &json!("hello"));
    // Scores are cosine similarities, descending.
    assert!(hits[0].1 >= hits[1].1);
}

#[tokio::test]
async fn unreachable_provider_fails_reads_but_not_writes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = settings(dir.path(), ReplicationMode::Primary);
    config.default_embedding_provider = "test:down".to_string();
    let db = rem_db::Database::open(config, "t1").unwrap();
    db.register_provider(Arc::new(DownEmbedder));
    db.register_schema(&article_schema()).unwrap();

    // The write commits even though the provider is down.
    let id = db
        .insert(
            "article",
            json!({"slug": "hello", "title": "Hello", "content": "World"}),
        )
        .await
        .unwrap();
    assert!(db.get(id).unwrap().is_some());

    // Search strictly requires an embedding and surfaces the dependency.
    assert!(matches!(
        db.search("article", "greetings", 2, None).await,
        Err(DatabaseError::DependencyUnavailable(_))
    ));
}

#[tokio::test]
async fn stale_vectors_backfill_when_provider_returns() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = settings(dir.path(), ReplicationMode::Primary);
    config.default_embedding_provider = "test:down".to_string();
    let db = rem_db::Database::open(config, "t1").unwrap();
    db.register_provider(Arc::new(DownEmbedder));
    db.register_schema(&article_schema()).unwrap();

    db.insert(
        "article",
        json!({"slug": "hello", "title": "Hello greetings", "content": "welcome"}),
    )
    .await
    .unwrap();

    // Provider comes back under a working default tag; reopen the store.
    drop(db);
    let mut config = settings(dir.path(), ReplicationMode::Primary);
    config.default_embedding_provider = "test:hash".to_string();
    let db = rem_db::Database::open(config, "t1").unwrap();
    db.register_provider(Arc::new(HashEmbedder));

    let repaired = db.reembed_stale(100).await.unwrap();
    assert!(repaired >= 1);

    let hits = db.search("article", "hello greetings", 1, None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.property("slug").unwrap(), &json!("hello"));
}

#[tokio::test]
async fn schema_without_embedding_fields_skips_vector_index() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&json!({
        "short_name": "plain",
        "properties": {"name": {"type": "string"}},
        "key_field": "name"
    }))
    .unwrap();

    db.insert("plain", json!({"name": "thing"})).await.unwrap();
    // No vector index is touched; search is empty, not an error.
    assert!(db.search("plain", "thing", 5, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn hybrid_ranks_literal_term_matches_no_worse_than_vector_alone() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    // Two documents carry the literal term "Rust"; decoys share the
    // surrounding vocabulary so pure vector search can confuse them.
    db.insert(
        "article",
        json!({"slug": "rust-1", "title": "Rust systems programming", "content": "memory safety without garbage collection"}),
    )
    .await
    .unwrap();
    db.insert(
        "article",
        json!({"slug": "rust-2", "title": "Learning Rust systems", "content": "ownership borrowing lifetimes programming"}),
    )
    .await
    .unwrap();
    for i in 0..50 {
        db.insert(
            "article",
            json!({
                "slug": format!("decoy-{i}"),
                "title": "systems programming notes",
                "content": format!("memory management lecture {i} garbage collection ownership")
            }),
        )
        .await
        .unwrap();
    }

    let query = "Rust systems programming";

    let vector_hits = db.search("article", query, 5, None).await.unwrap();
    let vector_slugs: HashSet<String> = vector_hits
        .iter()
        .map(|(e, _)| e.property("slug").unwrap().as_str().unwrap().to_string())
        .collect();

    let hybrid_hits = db.hybrid_search("article", query, 5).await.unwrap();
    let hybrid_slugs: HashSet<String> = hybrid_hits
        .iter()
        .map(|(e, _)| e.property("slug").unwrap().as_str().unwrap().to_string())
        .collect();

    // Every term-matching document recalled by the vector leg is also
    // recalled by hybrid, and hybrid recalls all term matches.
    for slug in ["rust-1", "rust-2"] {
        assert!(
            hybrid_slugs.contains(slug),
            "hybrid missed term match {slug}: {hybrid_slugs:?}"
        );
        if vector_slugs.contains(slug) {
            let vector_rank = rank_of(&vector_hits, slug);
            let hybrid_rank = rank_of(&hybrid_hits, slug);
            assert!(
                hybrid_rank <= vector_rank,
                "{slug}: hybrid rank {hybrid_rank} worse than vector rank {vector_rank}"
            );
        }
    }
}

fn rank_of(hits: &[(rem_db::Entity, f32)], slug: &str) -> usize {
    hits.iter()
        .position(|(e, _)| e.property("slug").unwrap() == &json!(slug))
        .unwrap_or(usize::MAX)
}

#[tokio::test]
async fn hnsw_recall_floor_through_database() {
    // Property 8 at integration scale: 200 pseudo-random documents, top-10
    // recall against exhaustive cosine scan.
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    let mut texts = Vec::new();
    for i in 0..200 {
        let text = format!(
            "document {i} topic{} subject{} theme{}",
            i % 17,
            i % 7,
            i % 29
        );
        db.insert(
            "article",
            json!({"slug": format!("doc-{i}"), "title": text, "content": ""}),
        )
        .await
        .unwrap();
        texts.push((format!("doc-{i}"), format!("{text}\n")));
    }

    let mut total_recall = 0.0;
    let queries = 10;
    for q in 0..queries {
        let query = format!("topic{} subject{} theme{}", q % 17, q % 7, q % 29);
        let query_vector = embed_text(&query);

        let mut exact: Vec<(String, f32)> = texts
            .iter()
            .map(|(slug, text)| (slug.clone(), cosine_distance(&query_vector, &embed_text(text))))
            .collect();
        exact.sort_by(|a, b| a.1.total_cmp(&b.1));
        let exact_top: HashSet<&String> = exact.iter().take(10).map(|(s, _)| s).collect();

        let hits = db.search("article", &query, 10, Some(100)).await.unwrap();
        let found = hits
            .iter()
            .filter(|(e, _)| {
                exact_top.contains(&e.property("slug").unwrap().as_str().unwrap().to_string())
            })
            .count();
        total_recall += found as f64 / 10.0;
    }

    let recall = total_recall / queries as f64;
    assert!(recall >= 0.9, "recall {recall} below floor");
}

//! End-to-end scenarios against a freshly opened database.

mod common;

use common::{article_schema, open_db};
use rem_db::config::ReplicationMode;
use rem_db::graph::TraversalDirection;
use rem_db::DatabaseError;
use serde_json::json;

#[tokio::test]
async fn key_lookup_determinism() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    let id1 = db
        .insert(
            "article",
            json!({"slug": "hello", "title": "Hello", "content": "World", "category": "tech"}),
        )
        .await
        .unwrap();
    let id2 = db
        .insert(
            "article",
            json!({"slug": "hello", "title": "Hi", "content": "There", "category": "tech"}),
        )
        .await
        .unwrap();

    // Same key, same id, one entity, latest properties win.
    assert_eq!(id1, id2);
    let found = db.lookup("article", "hello").await.unwrap().unwrap();
    assert_eq!(found.property("title").unwrap(), &json!("Hi"));
    assert_eq!(db.list("article").unwrap().len(), 1);
}

#[tokio::test]
async fn sql_with_indexed_column() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    db.insert(
        "article",
        json!({"slug": "hello", "title": "Hi", "content": "There", "category": "tech"}),
    )
    .await
    .unwrap();
    db.insert(
        "article",
        json!({"slug": "goodbye", "title": "Bye", "content": "...", "category": "life"}),
    )
    .await
    .unwrap();

    let planned = db.explain("SELECT * FROM article WHERE category = 'tech'").unwrap();
    assert_eq!(planned.plan.kind(), "SQL");
    match &planned.plan {
        rem_db::query::QueryPlan::Sql { index_column, .. } => {
            assert_eq!(index_column.as_deref(), Some("category"));
        }
        other => panic!("expected SQL plan, got {other:?}"),
    }

    let output = db
        .query("SELECT * FROM article WHERE category = 'tech'")
        .await
        .unwrap();
    assert_eq!(output.rows.len(), 1);
    assert_eq!(
        output.rows[0].entity.property("slug").unwrap(),
        &json!("hello")
    );

    let count = db.query("SELECT COUNT(*) FROM article").await.unwrap();
    assert_eq!(count.count, Some(2));
}

#[tokio::test]
async fn sql_range_order_and_limit() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    for (i, slug) in ["a", "b", "c", "d"].iter().enumerate() {
        db.insert(
            "article",
            json!({"slug": slug, "title": slug, "content": "", "category": "x", "rating": i as f64}),
        )
        .await
        .unwrap();
    }

    let output = db
        .query("SELECT * FROM article WHERE rating >= 1 ORDER BY rating DESC LIMIT 2")
        .await
        .unwrap();
    assert_eq!(output.rows.len(), 2);
    assert_eq!(output.rows[0].entity.property("slug").unwrap(), &json!("d"));
    assert_eq!(output.rows[1].entity.property("slug").unwrap(), &json!("c"));
}

#[tokio::test]
async fn edge_traversal_bfs_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    let a = db
        .insert("article", json!({"slug": "a", "title": "A"}))
        .await
        .unwrap();
    let b = db
        .insert("article", json!({"slug": "b", "title": "B"}))
        .await
        .unwrap();
    let c = db
        .insert("article", json!({"slug": "c", "title": "C"}))
        .await
        .unwrap();

    db.add_edge(a, b, "cites", None, None).unwrap();
    db.add_edge(b, c, "cites", None, None).unwrap();

    let reached = db
        .traverse(a, TraversalDirection::Out, 2, Some("cites"), None)
        .await
        .unwrap();
    let ids: Vec<_> = reached.iter().map(|e| e.system.id).collect();
    assert_eq!(ids, vec![b, c]);

    // Depth 0 returns only the start entity.
    let start_only = db
        .traverse(a, TraversalDirection::Out, 0, None, None)
        .await
        .unwrap();
    assert_eq!(start_only.len(), 1);
    assert_eq!(start_only[0].system.id, a);

    // Edge upsert law: re-adding the same edge changes nothing.
    db.add_edge(a, b, "cites", None, None).unwrap();
    let again = db
        .traverse(a, TraversalDirection::Out, 1, Some("cites"), None)
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
}

#[tokio::test]
async fn soft_delete_invisibility() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    let id = db
        .insert(
            "article",
            json!({"slug": "ghost", "title": "Ghost", "content": "story", "category": "tech"}),
        )
        .await
        .unwrap();

    db.delete(id).unwrap();

    // Invisible to every public read path.
    assert!(db.get(id).unwrap().is_none());
    assert!(db.lookup("article", "ghost").await.unwrap().is_none());
    assert!(db.list("article").unwrap().is_empty());
    let output = db
        .query("SELECT * FROM article WHERE category = 'tech'")
        .await
        .unwrap();
    assert!(output.rows.is_empty());
    let hits = db.search("article", "ghost story", 5, None).await.unwrap();
    assert!(hits.is_empty());

    // Second delete reports NotFound.
    assert!(matches!(db.delete(id), Err(DatabaseError::NotFound(_))));
}

#[tokio::test]
async fn update_and_delete_unknown_ids() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        db.update(missing, json!({"slug": "x", "title": "y"})).await,
        Err(DatabaseError::NotFound(_))
    ));
    assert!(matches!(db.delete(missing), Err(DatabaseError::NotFound(_))));
}

#[tokio::test]
async fn empty_database_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    assert!(db.list("article").unwrap().is_empty());
    assert!(db.query("SELECT * FROM article").await.unwrap().rows.is_empty());
    assert!(db.search("article", "anything", 0, None).await.unwrap().is_empty());
    assert!(db.lookup("article", "nothing").await.unwrap().is_none());
    assert_eq!(
        db.query("SELECT COUNT(*) FROM article").await.unwrap().count,
        Some(0)
    );
}

#[tokio::test]
async fn tenant_isolation() {
    let dir = tempfile::tempdir().unwrap();

    // Two handles over the same directory tree, different tenants.
    let db1 = {
        let db = rem_db::Database::open(common::settings(dir.path(), ReplicationMode::Primary), "t1")
            .unwrap();
        db.register_provider(std::sync::Arc::new(common::HashEmbedder));
        db
    };
    db1.register_schema(&article_schema()).unwrap();
    db1.insert("article", json!({"slug": "secret", "title": "Secret"}))
        .await
        .unwrap();

    let db2 = rem_db::Database::open(common::settings(dir.path(), ReplicationMode::Primary), "t2")
        .unwrap();
    db2.register_schema(&article_schema()).unwrap();

    assert!(db2.list("article").unwrap().is_empty());
    assert!(db2.lookup("article", "secret").await.unwrap().is_none());
}

#[tokio::test]
async fn moments_time_range() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);

    for (ts, class) in [
        ("2026-01-01T08:00:00Z", "question"),
        ("2026-01-01T12:00:00Z", "request"),
        ("2026-01-02T09:00:00Z", "question"),
    ] {
        db.insert(
            "moment",
            json!({"timestamp": ts, "classification": class, "summary": "interaction"}),
        )
        .await
        .unwrap();
    }

    let day_one = db
        .moments_in_range("2026-01-01T00:00:00Z", "2026-01-02T00:00:00Z", 100)
        .unwrap();
    assert_eq!(day_one.len(), 2);
    assert_eq!(
        day_one[0].property("timestamp").unwrap(),
        &json!("2026-01-01T08:00:00Z")
    );
}

#[tokio::test]
async fn vacuum_purges_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    let keep = db
        .insert("article", json!({"slug": "keep", "title": "Keep"}))
        .await
        .unwrap();
    let drop = db
        .insert("article", json!({"slug": "drop", "title": "Drop"}))
        .await
        .unwrap();
    db.delete(drop).unwrap();

    let report = db.vacuum(None).unwrap();
    assert_eq!(report.purged_entities, 1);

    assert!(db.get(keep).unwrap().is_some());
    assert!(db.get(drop).unwrap().is_none());
    assert_eq!(db.list("article").unwrap().len(), 1);
}

#[tokio::test]
async fn export_jsonl_and_csv() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    db.insert("article", json!({"slug": "a", "title": "A", "category": "x"}))
        .await
        .unwrap();
    db.insert("article", json!({"slug": "b", "title": "B", "category": "y"}))
        .await
        .unwrap();

    let jsonl = dir.path().join("out.jsonl");
    assert_eq!(
        db.export("article", rem_db::export::ExportFormat::Jsonl, &jsonl)
            .unwrap(),
        2
    );
    assert_eq!(std::fs::read_to_string(&jsonl).unwrap().lines().count(), 2);

    let csv = dir.path().join("out.csv");
    assert_eq!(
        db.export("article", rem_db::export::ExportFormat::Csv, &csv)
            .unwrap(),
        2
    );
}

#[test]
fn deterministic_id_property() {
    // Property 4: equal key fields always produce equal ids, across any mix
    // of other properties.
    use proptest::prelude::*;

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), ReplicationMode::Primary);
    db.register_schema(&article_schema()).unwrap();

    proptest!(ProptestConfig::with_cases(32), |(
        slug in "[a-z]{1,12}",
        title_a in "[A-Za-z ]{1,20}",
        title_b in "[A-Za-z ]{1,20}",
    )| {
        let id_a = runtime
            .block_on(db.insert("article", json!({"slug": slug, "title": title_a})))
            .unwrap();
        let id_b = runtime
            .block_on(db.insert("article", json!({"slug": slug, "title": title_b})))
            .unwrap();
        prop_assert_eq!(id_a, id_b);

        // Exactly one live entity per slug.
        let found = runtime.block_on(db.lookup("article", &slug)).unwrap().unwrap();
        prop_assert_eq!(found.system.id, id_a);
    });
}

#[test]
fn index_consistency_property() {
    // Property 3 (observed through the query surface): after a random op
    // sequence, the indexed-column query returns exactly the live entities
    // holding that value.
    use proptest::prelude::*;
    use std::collections::HashMap;

    let runtime = tokio::runtime::Runtime::new().unwrap();

    proptest!(ProptestConfig::with_cases(8), |(
        ops in proptest::collection::vec(
            (0u8..3, 0usize..6, prop::sample::select(vec!["red", "green", "blue"])),
            1..40
        ),
    )| {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path(), ReplicationMode::Primary);
        db.register_schema(&article_schema()).unwrap();

        // Model: slug -> category for live entities.
        let mut model: HashMap<String, String> = HashMap::new();

        for (op, slot, category) in ops {
            let slug = format!("slug-{slot}");
            match op {
                // Insert/upsert.
                0 | 1 => {
                    runtime
                        .block_on(db.insert(
                            "article",
                            json!({"slug": slug, "title": "T", "category": category}),
                        ))
                        .unwrap();
                    model.insert(slug, category.to_string());
                }
                // Delete if present.
                _ => {
                    if let Some(entity) =
                        runtime.block_on(db.lookup("article", &slug)).unwrap()
                    {
                        db.delete(entity.system.id).unwrap();
                    }
                    model.remove(&slug);
                }
            }
        }

        for category in ["red", "green", "blue"] {
            let expected: std::collections::HashSet<&String> = model
                .iter()
                .filter(|(_, c)| c.as_str() == category)
                .map(|(slug, _)| slug)
                .collect();
            let output = runtime
                .block_on(db.query(&format!(
                    "SELECT * FROM article WHERE category = '{category}'"
                )))
                .unwrap();
            let got: std::collections::HashSet<String> = output
                .rows
                .iter()
                .map(|r| r.entity.property("slug").unwrap().as_str().unwrap().to_string())
                .collect();
            let expected: std::collections::HashSet<String> =
                expected.into_iter().cloned().collect();
            prop_assert_eq!(got, expected);
        }
    });
}

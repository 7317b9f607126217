//! Primary → follower convergence over a loopback gRPC stream.

mod common;

use common::{article_schema, open_db, settings};
use rem_db::config::ReplicationMode;
use rem_db::DatabaseError;
use serde_json::json;
use std::time::Duration;

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_converges_with_primary() {
    // Primary with some history.
    let primary_dir = tempfile::tempdir().unwrap();
    let primary = open_db(primary_dir.path(), ReplicationMode::Primary);
    primary.register_schema(&article_schema()).unwrap();

    let id1 = primary
        .insert(
            "article",
            json!({"slug": "hello", "title": "Hello", "content": "World", "category": "tech"}),
        )
        .await
        .unwrap();
    primary
        .insert(
            "article",
            json!({"slug": "goodbye", "title": "Bye", "content": "...", "category": "life"}),
        )
        .await
        .unwrap();

    // Serve on an ephemeral loopback port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = primary.replication_server().unwrap();
    tokio::spawn(async move {
        let _ = server.serve_with_incoming(listener).await;
    });

    // Follower connects from sequence zero.
    let follower_dir = tempfile::tempdir().unwrap();
    let follower = open_db(follower_dir.path(), ReplicationMode::Follower);
    let replica = std::sync::Arc::new(
        follower
            .replica_node(&format!("http://{addr}"))
            .unwrap(),
    );
    {
        let replica = std::sync::Arc::clone(&replica);
        tokio::spawn(async move {
            let _ = replica.follow().await;
        });
    }

    // Historical catch-up.
    let target_seq = primary.status().unwrap().current_seq;
    assert!(
        wait_until(
            || follower.status().map(|s| s.applied_seq >= target_seq).unwrap_or(false),
            Duration::from_secs(10),
        )
        .await,
        "follower never caught up: {:?}",
        follower.status()
    );

    // Byte-for-byte equality of the replicated entity.
    let on_primary = primary.get(id1).unwrap().unwrap();
    let on_follower = follower.get(id1).unwrap().unwrap();
    assert_eq!(
        serde_json::to_vec(&on_primary).unwrap(),
        serde_json::to_vec(&on_follower).unwrap()
    );

    // Set equality of the schema's entities.
    let primary_slugs: std::collections::HashSet<String> = primary
        .list("article")
        .unwrap()
        .iter()
        .map(|e| e.property("slug").unwrap().as_str().unwrap().to_string())
        .collect();
    let follower_slugs: std::collections::HashSet<String> = follower
        .list("article")
        .unwrap()
        .iter()
        .map(|e| e.property("slug").unwrap().as_str().unwrap().to_string())
        .collect();
    assert_eq!(primary_slugs, follower_slugs);

    // Live tail: a new write arrives without reconnecting.
    let id3 = primary
        .insert(
            "article",
            json!({"slug": "fresh", "title": "Fresh", "content": "news", "category": "tech"}),
        )
        .await
        .unwrap();
    assert!(
        wait_until(
            || follower.get(id3).map(|e| e.is_some()).unwrap_or(false),
            Duration::from_secs(10),
        )
        .await,
        "live entry never arrived"
    );

    // Indexes follow: key lookup and the indexed SQL path work replicated.
    let found = follower.lookup("article", "fresh").await.unwrap().unwrap();
    assert_eq!(found.system.id, id3);
    let output = follower
        .query("SELECT * FROM article WHERE category = 'tech'")
        .await
        .unwrap();
    assert_eq!(output.rows.len(), 2);

    // The replica status reports connection state.
    let status = replica.status();
    assert!(status.connected, "status: {status:?}");
    assert!(status.local_seq >= target_seq);
}

#[tokio::test]
async fn follower_rejects_public_writes() {
    let dir = tempfile::tempdir().unwrap();
    let follower = open_db(dir.path(), ReplicationMode::Follower);

    assert!(matches!(
        follower.insert("resource", json!({})).await,
        Err(DatabaseError::ReadOnlyReplica)
    ));
    assert!(matches!(
        follower.register_schema(&article_schema()),
        Err(DatabaseError::ReadOnlyReplica)
    ));
    assert!(matches!(
        follower.delete(uuid::Uuid::new_v4()),
        Err(DatabaseError::ReadOnlyReplica)
    ));
    assert!(matches!(
        follower.add_edge(uuid::Uuid::new_v4(), uuid::Uuid::new_v4(), "cites", None, None),
        Err(DatabaseError::ReadOnlyReplica)
    ));
}

#[tokio::test]
async fn primary_refuses_follower_roles_and_vice_versa() {
    let dir = tempfile::tempdir().unwrap();
    let primary = open_db(dir.path(), ReplicationMode::Primary);
    assert!(primary.replica_node("http://localhost:1").is_err());

    let dir = tempfile::tempdir().unwrap();
    let follower = open_db(dir.path(), ReplicationMode::Follower);
    assert!(follower.replication_server().is_err());
}

#[tokio::test]
async fn unreachable_primary_backs_off_to_error() {
    let dir = tempfile::tempdir().unwrap();
    let follower = open_db(dir.path(), ReplicationMode::Follower);
    // Nothing listens here; one connect cycle must fail cleanly.
    let replica = follower.replica_node("http://127.0.0.1:1").unwrap();
    assert!(replica.follow_once().await.is_err());
    assert!(!replica.status().connected);
}

//! # rem-db
//!
//! Embedded, multi-tenant knowledge database for the REM model: Resources
//! (chunked documents with embeddings), Entities (typed records with a
//! property graph), and Moments (time-ordered interaction classifications).
//!
//! The engine layers, leaves first:
//!
//! - [`storage`]: RocksDB column families, key codecs, atomic batches.
//! - [`schema`]: JSON-Schema registry with indexing extensions.
//! - [`index`]: entity/key/column/inverted/vector/moment index managers.
//! - [`graph`]: typed directional edges and traversal.
//! - [`write`]: the write pipeline, one atomic batch per logical write.
//! - [`query`]: SQL-subset parser, planner, and executor.
//! - [`replication`]: WAL plus primary→follower streaming.
//! - [`database`]: the public handle.
//!
//! ```rust,ignore
//! let db = Database::open(Settings::from_env()?, "acme")?;
//! db.register_schema(&schema_doc)?;
//! let id = db.insert("article", json!({"slug": "intro", "title": "Intro"})).await?;
//! let hits = db.search("article", "introductions", 5, None).await?;
//! ```

pub mod config;
pub mod database;
pub mod embeddings;
pub mod export;
pub mod graph;
pub mod index;
pub mod llm;
pub mod query;
pub mod replication;
pub mod schema;
pub mod storage;
pub mod types;
pub mod write;

pub use config::{ReplicationMode, Settings};
pub use database::{Database, NodeStatus, VacuumReport};
pub use types::{DatabaseError, Edge, Entity, Result};

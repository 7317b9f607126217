//! High-level database handle: the public operations of the engine.
//!
//! A handle owns the storage for one tenant, the schema registry, every
//! index manager, the write pipeline, and the WAL. All state is reached
//! through the handle; there are no module-level singletons.

use crate::config::{InstanceMeta, ReplicationMode, Settings};
use crate::embeddings::{embedding_text, text_hash, OpenAiEmbedder, ProviderRegistry};
use crate::export::ExportFormat;
use crate::graph::TraversalDirection;
use crate::index::{MomentIndex, VectorIndexManager};
use crate::llm::{NlQueryPlanner, PlannerRegistry};
use crate::query::{PlannedQuery, QueryExecutor, QueryOutput, QueryPlan, QueryPlanner};
use crate::replication::wal::{WalEntry, WriteAheadLog};
use crate::replication::{ReplicaNode, ReplicationServer};
use crate::schema::builtin::register_builtin_schemas;
use crate::schema::{Schema, SchemaRegistry};
use crate::storage::column_families::CF_ENTITIES;
use crate::storage::{keys, Storage};
use crate::types::{DatabaseError, Edge, Entity, Result};
use crate::write::{EmbeddingOutcome, WritePipeline};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the live WAL broadcast feeding follower streams.
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Embedding pool defaults.
const EMBED_CONCURRENCY: usize = 4;
const EMBED_QUEUE_DEPTH: usize = 32;

/// Node status snapshot.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub mode: ReplicationMode,
    pub tenant: String,
    pub current_seq: u64,
    pub applied_seq: u64,
    pub schema_count: usize,
}

/// Vacuum results.
#[derive(Debug, Clone, Default)]
pub struct VacuumReport {
    pub purged_entities: usize,
    pub compacted_wal_entries: usize,
}

/// The REM database handle for one tenant.
pub struct Database {
    settings: Settings,
    tenant: String,
    mode: ReplicationMode,
    storage: Storage,
    registry: Arc<SchemaRegistry>,
    pipeline: Arc<WritePipeline>,
    executor: QueryExecutor,
    planner: QueryPlanner,
    providers: Arc<ProviderRegistry>,
    nl_planners: Arc<PlannerRegistry>,
    vectors: Arc<VectorIndexManager>,
    moments: MomentIndex,
    wal: Arc<WriteAheadLog>,
    live: broadcast::Sender<WalEntry>,
}

impl Database {
    /// Open (or create) the database for `tenant` under the settings' path.
    pub fn open(settings: Settings, tenant: &str) -> Result<Self> {
        let mode = settings.replication_mode;
        let mut meta = InstanceMeta::load_or_init(&settings.db_path, mode)?;

        let storage = Storage::open(settings.tenant_store_path(tenant))?;
        let registry = Arc::new(SchemaRegistry::new(storage.clone()));
        register_builtin_schemas(&registry, tenant)?;
        let loaded = registry.load(tenant)?;
        tracing::info!(tenant, schemas = loaded, ?mode, "opened database");

        let providers = Arc::new(ProviderRegistry::new(
            settings.default_embedding_provider.clone(),
            EMBED_CONCURRENCY,
            EMBED_QUEUE_DEPTH,
            settings.operation_timeout,
        ));
        if let Some(model) = settings.default_embedding_provider.strip_prefix("openai:") {
            if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
                providers.register(Arc::new(OpenAiEmbedder::new(api_key, model.to_string())));
            }
        }

        let vectors = Arc::new(VectorIndexManager::new(storage.clone()));
        let wal = Arc::new(WriteAheadLog::new(storage.clone())?);
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);

        let pipeline = Arc::new(WritePipeline::new(
            storage.clone(),
            Arc::clone(&registry),
            Arc::clone(&vectors),
            Arc::clone(&wal),
            (mode == ReplicationMode::Primary).then(|| live.clone()),
            mode == ReplicationMode::Follower,
        ));

        let executor = QueryExecutor::new(
            storage.clone(),
            Arc::clone(&registry),
            Arc::clone(&vectors),
            Arc::clone(&providers),
        );
        let planner = QueryPlanner::new(
            Arc::clone(&registry),
            crate::index::ColumnIndex::new(storage.clone()),
        );

        // Record registered vector indexes in the instance descriptor.
        for name in registry.list(tenant) {
            if let Ok(Some(params)) = vectors.params(tenant, &name) {
                meta.hnsw_indexes.insert(format!("{tenant}/{name}"), params);
            }
            if let Ok(schema) = registry.get(tenant, &name) {
                meta.schema_versions
                    .insert(format!("{tenant}/{name}"), schema.version.clone());
            }
        }
        meta.save(&settings.db_path)?;

        Ok(Self {
            moments: MomentIndex::new(storage.clone()),
            settings,
            tenant: tenant.to_string(),
            mode,
            storage,
            registry,
            pipeline,
            executor,
            planner,
            providers,
            nl_planners: Arc::new(PlannerRegistry::new()),
            vectors,
            wal,
            live,
        })
    }

    /// Open with settings from the environment.
    pub fn open_from_env(tenant: &str) -> Result<Self> {
        Self::open(Settings::from_env()?, tenant)
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    /// Register an embedding provider (selected by its own tag).
    pub fn register_provider(&self, provider: Arc<dyn crate::embeddings::EmbeddingProvider>) {
        self.providers.register(provider);
    }

    /// Register a natural-language query planner.
    pub fn register_planner(&self, planner: Arc<dyn NlQueryPlanner>) {
        self.nl_planners.register(planner);
    }

    // --- Schemas ---

    /// Register a schema document.
    pub fn register_schema(&self, doc: &serde_json::Value) -> Result<Arc<Schema>> {
        if self.mode == ReplicationMode::Follower {
            return Err(DatabaseError::ReadOnlyReplica);
        }
        let schema = self
            .registry
            .register(&self.tenant, doc, &self.providers.names())?;
        self.pipeline
            .log_schema(&self.tenant, doc, &schema.fully_qualified_name)?;
        Ok(schema)
    }

    /// Short names registered for this tenant.
    pub fn list_schemas(&self) -> Vec<String> {
        self.registry.list(&self.tenant)
    }

    /// Fetch a schema by short name.
    pub fn get_schema(&self, short_name: &str) -> Result<Arc<Schema>> {
        self.registry.get(&self.tenant, short_name)
    }

    // --- Writes ---

    /// Insert an entity. Returns its id (stable across re-inserts when the
    /// schema declares a key field).
    pub async fn insert(&self, schema_name: &str, properties: serde_json::Value) -> Result<Uuid> {
        let schema = self.registry.get(&self.tenant, schema_name)?;
        let embedding = self.prepare_embedding(&schema, None, &properties).await?;
        self.pipeline
            .insert(&self.tenant, schema_name, properties, embedding)
    }

    /// Update an entity by id.
    pub async fn update(&self, id: Uuid, properties: serde_json::Value) -> Result<()> {
        let old = self
            .pipeline
            .read_entity(&self.tenant, id)?
            .filter(|e| !e.is_deleted())
            .ok_or_else(|| DatabaseError::NotFound(id.to_string()))?;
        let schema = self.registry.get(&self.tenant, &old.system.schema_name)?;
        let embedding = self
            .prepare_embedding(&schema, Some(id), &properties)
            .await?;
        self.pipeline.update(&self.tenant, id, properties, embedding)
    }

    /// Soft-delete an entity.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.pipeline.delete(&self.tenant, id)
    }

    /// Resolve the embedding for a write before any lock is taken.
    ///
    /// Provider failures do not fail the write; the record commits stale and
    /// the re-embed sweep retries it.
    async fn prepare_embedding(
        &self,
        schema: &Schema,
        id: Option<Uuid>,
        properties: &serde_json::Value,
    ) -> Result<EmbeddingOutcome> {
        if !schema.has_embeddings() {
            return Ok(EmbeddingOutcome::NotApplicable);
        }

        let new_text = embedding_text(schema, properties);
        let new_hash = text_hash(&new_text);

        // Deterministic ids let inserts see their predecessor's record.
        let id = match id {
            Some(id) => Some(id),
            None => match &schema.extensions.key_field {
                Some(_) => self
                    .pipeline
                    .derive_id(&self.tenant, schema, properties)
                    .ok(),
                None => None,
            },
        };
        if let Some(id) = id {
            if let Some(record) = self.vectors.record(&self.tenant, &schema.short_name, id)? {
                if !record.stale && record.text_hash == new_hash {
                    return Ok(EmbeddingOutcome::NotApplicable);
                }
            }
        }

        let tag = schema.extensions.default_embedding_provider.as_deref();
        match self.providers.embed(tag, &[new_text]).await {
            Ok(mut vectors) if !vectors.is_empty() => {
                Ok(EmbeddingOutcome::Vector(vectors.remove(0)))
            }
            Ok(_) => Ok(EmbeddingOutcome::Unavailable),
            Err(e) => {
                tracing::warn!(error = %e, schema = %schema.short_name, "embedding unavailable, committing stale");
                Ok(EmbeddingOutcome::Unavailable)
            }
        }
    }

    // --- Reads ---

    /// Point read by id; tombstones are invisible.
    pub fn get(&self, id: Uuid) -> Result<Option<Entity>> {
        Ok(self
            .pipeline
            .read_entity(&self.tenant, id)?
            .filter(|e| !e.is_deleted()))
    }

    /// Exact key lookup with a bounded fuzzy fallback.
    pub async fn lookup(&self, schema: &str, key_value: &str) -> Result<Option<Entity>> {
        let planned = self.planner.plan(
            &self.tenant,
            QueryPlan::Lookup {
                schema: schema.to_string(),
                key: key_value.to_string(),
            },
        )?;
        let output = self.executor.execute(&self.tenant, &planned).await?;
        Ok(output.rows.into_iter().next().map(|r| r.entity))
    }

    /// Live entities of one schema, in id order.
    pub fn list(&self, schema: &str) -> Result<Vec<Entity>> {
        self.registry.get(&self.tenant, schema)?;
        let prefix = keys::entity_prefix(&self.tenant);
        let mut entities = Vec::new();
        for (_key, value) in self.storage.prefix_iter(CF_ENTITIES, &prefix)? {
            let entity: Entity = serde_json::from_slice(&value)?;
            if entity.system.schema_name == schema && !entity.is_deleted() {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Vector similarity search.
    pub async fn search(
        &self,
        schema: &str,
        query_text: &str,
        top_k: usize,
        ef: Option<usize>,
    ) -> Result<Vec<(Entity, f32)>> {
        let planned = self.planner.plan(
            &self.tenant,
            QueryPlan::Search {
                schema: schema.to_string(),
                query_text: query_text.to_string(),
                top_k,
                ef,
            },
        )?;
        let output = self.executor.execute(&self.tenant, &planned).await?;
        Ok(output
            .rows
            .into_iter()
            .map(|r| (r.entity, r.score.unwrap_or(0.0)))
            .collect())
    }

    /// Hybrid (vector + BM25) search; degenerates to pure vector search for
    /// schemas without the inverted index.
    pub async fn hybrid_search(
        &self,
        schema: &str,
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<(Entity, f32)>> {
        let planned = self.planner.plan(
            &self.tenant,
            QueryPlan::Hybrid {
                schema: schema.to_string(),
                query_text: query_text.to_string(),
                top_k,
            },
        )?;
        let output = self.executor.execute(&self.tenant, &planned).await?;
        Ok(output
            .rows
            .into_iter()
            .map(|r| (r.entity, r.score.unwrap_or(0.0)))
            .collect())
    }

    /// Execute a query string (SQL subset or REM statement extensions).
    pub async fn query(&self, sql: &str) -> Result<QueryOutput> {
        let parsed = crate::query::parser::parse(sql)?;
        let planned = self.planner.plan(&self.tenant, parsed)?;
        tracing::debug!(plan = planned.plan.kind(), confidence = planned.confidence, "executing query");
        self.executor.execute(&self.tenant, &planned).await
    }

    /// Plan a query without executing it.
    pub fn explain(&self, sql: &str) -> Result<PlannedQuery> {
        let parsed = crate::query::parser::parse(sql)?;
        self.planner.plan(&self.tenant, parsed)
    }

    /// Natural-language query through a registered planner capability.
    ///
    /// The returned plan is validated against the schema registry before
    /// execution, exactly like a hand-written query.
    pub async fn ask(&self, question: &str, schema_hint: Option<&str>) -> Result<QueryOutput> {
        let planner = self.nl_planners.get(None)?;
        let plan = tokio::time::timeout(
            self.settings.operation_timeout,
            planner.plan(question, schema_hint),
        )
        .await
        .map_err(|_| DatabaseError::Timeout("query planner".to_string()))??;

        let planned = self.planner.plan(&self.tenant, plan)?;
        self.executor.execute(&self.tenant, &planned).await
    }

    /// BFS traversal from an entity.
    pub async fn traverse(
        &self,
        start_id: Uuid,
        direction: TraversalDirection,
        depth: usize,
        edge_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>> {
        let planned = self.planner.plan(
            &self.tenant,
            QueryPlan::Traverse {
                start_id,
                direction,
                depth,
                edge_type: edge_type.map(String::from),
                limit: limit.unwrap_or(100),
            },
        )?;
        let output = self.executor.execute(&self.tenant, &planned).await?;
        Ok(output.rows.into_iter().map(|r| r.entity).collect())
    }

    /// Moments with `start <= timestamp < end` (RFC3339 bounds).
    pub fn moments_in_range(&self, start: &str, end: &str, limit: usize) -> Result<Vec<Entity>> {
        let start = crate::index::moments::ts_micros_from_rfc3339(start)?;
        let end = crate::index::moments::ts_micros_from_rfc3339(end)?;
        let ids = self.moments.range(&self.tenant, start, end, limit)?;
        let mut entities = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = self.get(id)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    // --- Edges ---

    /// Upsert a typed edge between two entities.
    pub fn add_edge(
        &self,
        src: Uuid,
        dst: Uuid,
        edge_type: &str,
        properties: Option<HashMap<String, serde_json::Value>>,
        weight: Option<f32>,
    ) -> Result<()> {
        let mut edge = Edge::new(src, dst, edge_type.to_string());
        if let Some(properties) = properties {
            edge.properties = properties;
        }
        edge.weight = weight;
        self.pipeline.put_edge(&self.tenant, edge)
    }

    /// Delete an edge by identity tuple.
    pub fn delete_edge(&self, src: Uuid, dst: Uuid, edge_type: &str) -> Result<()> {
        self.pipeline.remove_edge(&self.tenant, src, dst, edge_type)
    }

    // --- Bulk ---

    /// Ingest ready-made entity records from a JSONL file.
    ///
    /// Chunking and parsing are collaborator concerns; each line must already
    /// be a valid properties object for `schema`.
    pub async fn ingest_jsonl(&self, path: &std::path::Path, schema: &str) -> Result<Vec<Uuid>> {
        let content = std::fs::read_to_string(path)?;
        let mut ids = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let properties: serde_json::Value = serde_json::from_str(line).map_err(|e| {
                DatabaseError::ValidationFailed(format!("line {}: {e}", line_no + 1))
            })?;
            ids.push(self.insert(schema, properties).await?);
        }
        Ok(ids)
    }

    /// Export a schema's live entities.
    pub fn export(
        &self,
        schema: &str,
        format: ExportFormat,
        path: &std::path::Path,
    ) -> Result<usize> {
        let resolved = self.registry.get(&self.tenant, schema)?;
        let entities = self.list(schema)?;
        crate::export::export(format, path, &resolved, &entities)
    }

    // --- Maintenance ---

    /// Physically remove tombstoned entities and compact the WAL past the
    /// retention horizon. `min_keep_seq` caps compaction at the slowest
    /// connected follower's acknowledged sequence.
    pub fn vacuum(&self, min_keep_seq: Option<u64>) -> Result<VacuumReport> {
        let mut report = VacuumReport::default();

        let prefix = keys::entity_prefix(&self.tenant);
        let mut tombstoned = Vec::new();
        for (_key, value) in self.storage.prefix_iter(CF_ENTITIES, &prefix)? {
            let entity: Entity = serde_json::from_slice(&value)?;
            if entity.is_deleted() {
                tombstoned.push(entity.system.id);
            }
        }
        for id in tombstoned {
            if self.pipeline.purge_entity(&self.tenant, id)? {
                report.purged_entities += 1;
            }
        }

        let horizon = chrono::Utc::now() - chrono::Duration::from_std(self.settings.wal_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(168));
        let min_keep = min_keep_seq.unwrap_or_else(|| self.wal.current_seq());
        report.compacted_wal_entries = self
            .wal
            .compact(min_keep, horizon.timestamp_micros().max(0) as u64)?;

        tracing::info!(
            purged = report.purged_entities,
            compacted = report.compacted_wal_entries,
            "vacuum complete"
        );
        Ok(report)
    }

    /// Retry stale vector records, up to `limit` per schema.
    pub async fn reembed_stale(&self, limit: usize) -> Result<usize> {
        let mut repaired = 0;
        for schema_name in self.list_schemas() {
            let schema = self.registry.get(&self.tenant, &schema_name)?;
            if !schema.has_embeddings() {
                continue;
            }
            for (id, _record) in self
                .vectors
                .stale_records(&self.tenant, &schema_name, limit)?
            {
                let Some(entity) = self.get(id)? else {
                    continue;
                };
                let text = embedding_text(&schema, &entity.properties);
                let tag = schema.extensions.default_embedding_provider.as_deref();
                let Ok(mut vectors) = self.providers.embed(tag, &[text.clone()]).await else {
                    // Provider still down; leave the record stale.
                    return Ok(repaired);
                };
                if vectors.is_empty() {
                    continue;
                }
                let mut batch = crate::storage::BatchBuilder::new();
                self.vectors.stage_vector(
                    &self.tenant,
                    &schema_name,
                    id,
                    vectors.remove(0),
                    text_hash(&text),
                    &mut batch,
                )?;
                self.storage.commit(batch)?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    // --- Replication ---

    /// Build the replication service for this primary.
    pub fn replication_server(&self) -> Result<ReplicationServer> {
        if self.mode != ReplicationMode::Primary {
            return Err(DatabaseError::ReplicationError(
                "only a primary serves the WAL stream".to_string(),
            ));
        }
        Ok(ReplicationServer::new(
            Arc::clone(&self.wal),
            self.live.clone(),
        ))
    }

    /// Build the follower client for this node.
    pub fn replica_node(&self, primary_addr: &str) -> Result<ReplicaNode> {
        if self.mode != ReplicationMode::Follower {
            return Err(DatabaseError::ReplicationError(
                "only a follower can subscribe to a primary".to_string(),
            ));
        }
        Ok(ReplicaNode::new(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.wal),
            primary_addr.to_string(),
            format!("{}@{}", self.tenant, uuid::Uuid::new_v4()),
        ))
    }

    /// Apply one WAL entry (replay path; exposed for recovery tooling).
    pub fn apply_wal_entry(&self, entry: WalEntry) -> Result<()> {
        self.pipeline.apply_wal_entry(entry)
    }

    /// WAL entries from `from_seq`, for inspection.
    pub fn wal_entries(&self, from_seq: u64, limit: usize) -> Result<Vec<WalEntry>> {
        self.wal.entries_from(from_seq, limit)
    }

    /// Node status snapshot.
    pub fn status(&self) -> Result<NodeStatus> {
        Ok(NodeStatus {
            mode: self.mode,
            tenant: self.tenant.clone(),
            current_seq: self.wal.current_seq(),
            applied_seq: self.wal.applied_seq()?,
            schema_count: self.list_schemas().len(),
        })
    }
}

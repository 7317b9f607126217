//! The write pipeline: single entry point for all mutations.
//!
//! Every write validates against the schema, derives its id, stages the
//! entity plus every affected index plus a WAL entry into one batch, and
//! commits atomically. Writes to the same entity serialize on a striped lock
//! pool; writes to different entities run in parallel.
//!
//! Embeddings are computed by the caller before the per-id lock is taken, so
//! no lock is ever held across a suspension point.

use crate::embeddings::{embedding_text, text_hash};
use crate::graph::EdgeManager;
use crate::index::moments::ts_micros_from_rfc3339;
use crate::index::{ColumnIndex, InvertedIndex, KeyIndex, MomentIndex, VectorIndexManager};
use crate::replication::wal::{WalEntry, WalOp, WriteAheadLog};
use crate::schema::{Schema, SchemaRegistry, EDGE_SCHEMA, MOMENT_SCHEMA};
use crate::storage::batch::BatchBuilder;
use crate::storage::column_families::CF_ENTITIES;
use crate::storage::{keys, Storage};
use crate::types::{DatabaseError, Edge, Entity, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Stripes in the per-id lock pool.
const LOCK_STRIPES: usize = 64;

/// Outcome of the caller's embedding request, resolved before the write.
#[derive(Debug, Clone)]
pub enum EmbeddingOutcome {
    /// Schema has no embedding fields, or the text did not change.
    NotApplicable,
    /// The provider returned a vector for the new embedded text.
    Vector(Vec<f32>),
    /// The provider was unavailable; commit with a stale marker.
    Unavailable,
}

/// Striped mutex pool keyed by `(tenant, id)`.
struct StripedLocks {
    stripes: Vec<Mutex<()>>,
}

impl StripedLocks {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn guard(&self, tenant: &str, id: Uuid) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        tenant.hash(&mut hasher);
        id.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.stripes.len();
        match self.stripes[stripe].lock() {
            Ok(guard) => guard,
            // A poisoned stripe only means another writer panicked; the data
            // is protected by the batch, not the guard.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Orchestrates insert/update/delete across all indexes.
pub struct WritePipeline {
    storage: Storage,
    registry: Arc<SchemaRegistry>,
    key_index: KeyIndex,
    col_index: ColumnIndex,
    inverted: InvertedIndex,
    vectors: Arc<VectorIndexManager>,
    moments: MomentIndex,
    edges: EdgeManager,
    wal: Arc<WriteAheadLog>,
    locks: StripedLocks,
    /// Live tail feed for replication; present on primaries.
    live: Option<broadcast::Sender<WalEntry>>,
    /// Followers reject public writes; only WAL application mutates state.
    read_only: bool,
}

impl WritePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Storage,
        registry: Arc<SchemaRegistry>,
        vectors: Arc<VectorIndexManager>,
        wal: Arc<WriteAheadLog>,
        live: Option<broadcast::Sender<WalEntry>>,
        read_only: bool,
    ) -> Self {
        Self {
            key_index: KeyIndex::new(storage.clone()),
            col_index: ColumnIndex::new(storage.clone()),
            inverted: InvertedIndex::new(storage.clone()),
            moments: MomentIndex::new(storage.clone()),
            edges: EdgeManager::new(storage.clone()),
            storage,
            registry,
            vectors,
            wal,
            locks: StripedLocks::new(),
            live,
            read_only,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(DatabaseError::ReadOnlyReplica)
        } else {
            Ok(())
        }
    }

    /// Raw entity read, tombstones included.
    pub fn read_entity(&self, tenant: &str, id: Uuid) -> Result<Option<Entity>> {
        match self.storage.get(CF_ENTITIES, &keys::entity_key(tenant, id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Derive the entity id for an insert: UUIDv5 over tenant, schema and the
    /// key-field value when the schema declares one, random otherwise.
    pub fn derive_id(
        &self,
        tenant: &str,
        schema: &Schema,
        properties: &serde_json::Value,
    ) -> Result<Uuid> {
        match &schema.extensions.key_field {
            Some(key_field) => {
                let value = key_field_string(schema, properties)?.ok_or_else(|| {
                    DatabaseError::ValidationFailed(format!("missing key field: {key_field}"))
                })?;
                Ok(keys::deterministic_uuid(tenant, &schema.short_name, &value))
            }
            None => Ok(Uuid::new_v4()),
        }
    }

    /// Insert (or upsert, for deterministic ids). Returns the entity id.
    pub fn insert(
        &self,
        tenant: &str,
        schema_name: &str,
        properties: serde_json::Value,
        embedding: EmbeddingOutcome,
    ) -> Result<Uuid> {
        self.check_writable()?;
        let schema = self.registry.get(tenant, schema_name)?;
        self.registry
            .validator(tenant, schema_name)?
            .validate(&properties)?;

        let id = self.derive_id(tenant, &schema, &properties)?;
        let _guard = self.locks.guard(tenant, id);

        let old = self.read_entity(tenant, id)?;
        let entry = self.stage_upsert(tenant, &schema, id, old, properties, embedding, None)?;
        self.publish(entry);
        Ok(id)
    }

    /// Update an existing entity by id.
    pub fn update(
        &self,
        tenant: &str,
        id: Uuid,
        properties: serde_json::Value,
        embedding: EmbeddingOutcome,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.locks.guard(tenant, id);

        let old = self
            .read_entity(tenant, id)?
            .filter(|e| !e.is_deleted())
            .ok_or_else(|| DatabaseError::NotFound(id.to_string()))?;
        let schema = self.registry.get(tenant, &old.system.schema_name)?;
        self.registry
            .validator(tenant, &schema.short_name)?
            .validate(&properties)?;

        let entry = self.stage_upsert(tenant, &schema, id, Some(old), properties, embedding, None)?;
        self.publish(entry);
        Ok(())
    }

    /// Soft-delete an entity: tombstone plus removal of every index entry.
    pub fn delete(&self, tenant: &str, id: Uuid) -> Result<()> {
        self.check_writable()?;
        let _guard = self.locks.guard(tenant, id);

        let old = self
            .read_entity(tenant, id)?
            .filter(|e| !e.is_deleted())
            .ok_or_else(|| DatabaseError::NotFound(id.to_string()))?;
        let schema = self.registry.get(tenant, &old.system.schema_name)?;

        let entry = self.stage_delete(tenant, &schema, old, None)?;
        self.publish(entry);
        Ok(())
    }

    /// Upsert an edge, both directions in one batch.
    pub fn put_edge(&self, tenant: &str, edge: Edge) -> Result<()> {
        self.check_writable()?;
        let _guard = self.locks.guard(tenant, edge.src);

        let mut batch = BatchBuilder::new();
        self.edges.stage_put(tenant, &edge, &mut batch)?;
        let entry = self.wal.stage_append(
            tenant,
            WalOp::Insert,
            edge.src,
            EDGE_SCHEMA,
            edge_payload(&edge)?,
            false,
            &mut batch,
        )?;
        self.storage.commit(batch)?;
        self.publish(entry);
        Ok(())
    }

    /// Delete an edge by identity tuple.
    pub fn remove_edge(&self, tenant: &str, src: Uuid, dst: Uuid, edge_type: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.locks.guard(tenant, src);

        if self.edges.get(tenant, src, dst, edge_type)?.is_none() {
            return Err(DatabaseError::NotFound(format!(
                "edge {src} -[{edge_type}]-> {dst}"
            )));
        }

        let mut batch = BatchBuilder::new();
        self.edges.stage_delete(tenant, src, dst, edge_type, &mut batch);
        let edge = Edge::new(src, dst, edge_type.to_string());
        let entry = self.wal.stage_append(
            tenant,
            WalOp::Delete,
            src,
            EDGE_SCHEMA,
            edge_payload(&edge)?,
            false,
            &mut batch,
        )?;
        self.storage.commit(batch)?;
        self.publish(entry);
        Ok(())
    }

    /// Log a schema registration so followers converge on the registry.
    pub fn log_schema(&self, tenant: &str, doc: &serde_json::Value, fqn: &str) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut batch = BatchBuilder::new();
        let entry = self.wal.stage_append(
            tenant,
            WalOp::Insert,
            keys::deterministic_uuid(tenant, "schema", fqn),
            "schema",
            doc.clone(),
            false,
            &mut batch,
        )?;
        self.storage.commit(batch)?;
        self.publish(entry);
        Ok(())
    }

    /// Apply a replicated (or replayed) WAL entry through the same staging
    /// code as local writes. Entries at or below the applied sequence are
    /// no-ops.
    pub fn apply_wal_entry(&self, entry: WalEntry) -> Result<()> {
        if entry.seq <= self.wal.applied_seq()? {
            return Ok(());
        }

        let _guard = self.locks.guard(&entry.tenant, entry.entity_id);
        let tenant = entry.tenant.clone();

        if entry.schema == EDGE_SCHEMA {
            let edge = edge_from_payload(&entry.payload)?;
            let mut batch = BatchBuilder::new();
            match entry.op {
                WalOp::Insert | WalOp::Update => self.edges.stage_put(&tenant, &edge, &mut batch)?,
                WalOp::Delete => {
                    self.edges
                        .stage_delete(&tenant, edge.src, edge.dst, &edge.edge_type, &mut batch)
                }
            }
            self.wal.stage_entry(&entry, &mut batch)?;
            self.wal.stage_applied_seq(entry.seq, &mut batch)?;
            return self.storage.commit(batch);
        }

        // Schema registrations ride the WAL as bare schema documents; an
        // entity of the builtin `schema` kind carries flattened system fields
        // (`schema_name`, `id`) instead and falls through to the entity path.
        if entry.schema == "schema"
            && entry.payload.get("short_name").is_some()
            && entry.payload.get("schema_name").is_none()
        {
            self.registry.register_replicated(&tenant, &entry.payload)?;
            let mut batch = BatchBuilder::new();
            self.wal.stage_entry(&entry, &mut batch)?;
            self.wal.stage_applied_seq(entry.seq, &mut batch)?;
            return self.storage.commit(batch);
        }

        let schema = self.registry.get(&tenant, &entry.schema)?;
        match entry.op {
            WalOp::Insert | WalOp::Update => {
                let old = self.read_entity(&tenant, entry.entity_id)?;
                let properties = entry
                    .payload
                    .get("properties")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                // Vector side effects are skipped on apply; the stale marker
                // (staged when the text changed) drives later backfill.
                self.stage_upsert(
                    &tenant,
                    &schema,
                    entry.entity_id,
                    old,
                    properties,
                    EmbeddingOutcome::Unavailable,
                    Some(&entry),
                )?;
            }
            WalOp::Delete => {
                match self
                    .read_entity(&tenant, entry.entity_id)?
                    .filter(|e| !e.is_deleted())
                {
                    Some(old) => {
                        self.stage_delete(&tenant, &schema, old, Some(&entry))?;
                    }
                    None => {
                        // Idempotent replay of a delete.
                        let mut batch = BatchBuilder::new();
                        self.wal.stage_entry(&entry, &mut batch)?;
                        self.wal.stage_applied_seq(entry.seq, &mut batch)?;
                        self.storage.commit(batch)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Physically remove a tombstoned entity and every trace of it.
    ///
    /// Vacuum is local maintenance; it is not WAL-logged.
    pub fn purge_entity(&self, tenant: &str, id: Uuid) -> Result<bool> {
        let _guard = self.locks.guard(tenant, id);

        let Some(old) = self.read_entity(tenant, id)? else {
            return Ok(false);
        };
        if !old.is_deleted() {
            return Ok(false);
        }
        let schema = self.registry.get(tenant, &old.system.schema_name)?;

        let mut batch = BatchBuilder::new();
        batch.delete(CF_ENTITIES, keys::entity_key(tenant, id));
        if let Some(key_value) = key_field_string(&schema, &old.properties)? {
            self.key_index
                .stage_delete(tenant, &schema.short_name, &key_value, &mut batch);
        }
        self.col_index
            .stage_update(tenant, &schema, id, Some(&old.properties), None, &mut batch)?;
        if schema.has_embeddings() {
            self.vectors
                .stage_remove(tenant, &schema.short_name, id, &mut batch)?;
        }
        if schema.extensions.enable_bm25 {
            let old_text = embedding_text(&schema, &old.properties);
            self.inverted.stage_update(
                tenant,
                &schema.short_name,
                id,
                Some(&old_text),
                None,
                &mut batch,
            )?;
        }
        if schema.short_name == MOMENT_SCHEMA {
            if let Some(ts) = moment_ts(&old)? {
                self.moments.stage_delete(tenant, ts, id, &mut batch);
            }
        }
        self.edges.stage_delete_all(tenant, id, &mut batch)?;

        self.commit_or_invalidate(tenant, &schema.short_name, batch)?;
        Ok(true)
    }

    /// Shared staging for insert/update and WAL apply.
    ///
    /// When `replicated` is set, the incoming entry is recorded instead of
    /// appending a new one, and its applied sequence rides the same batch.
    #[allow(clippy::too_many_arguments)]
    fn stage_upsert(
        &self,
        tenant: &str,
        schema: &Schema,
        id: Uuid,
        old: Option<Entity>,
        properties: serde_json::Value,
        embedding: EmbeddingOutcome,
        replicated: Option<&WalEntry>,
    ) -> Result<WalEntry> {
        let mut batch = BatchBuilder::new();

        // Tombstoned predecessors count as absent, but keep their version
        // counter moving forward.
        let (old_live, old_version, created_at) = match &old {
            Some(entity) if !entity.is_deleted() => (
                Some(entity.clone()),
                entity.system.version,
                entity.system.created_at.clone(),
            ),
            Some(entity) => (None, entity.system.version, entity.system.created_at.clone()),
            None => (None, 0, chrono::Utc::now().to_rfc3339()),
        };

        // Replicated entries carry the primary's full entity so followers
        // converge byte-for-byte; local writes mint fresh system fields.
        let entity = match replicated {
            Some(entry) => {
                let mut entity: Entity = serde_json::from_value(entry.payload.clone())?;
                entity.system.id = id;
                entity.system.tenant_id = tenant.to_string();
                entity.system.schema_name = schema.short_name.clone();
                entity.properties = properties;
                entity
            }
            None => {
                let mut entity = Entity::new(
                    id,
                    tenant.to_string(),
                    schema.short_name.clone(),
                    properties,
                );
                entity.system.created_at = created_at;
                entity.system.version = old_version + 1;
                entity
            }
        };

        batch.put(
            CF_ENTITIES,
            keys::entity_key(tenant, id),
            serde_json::to_vec(&entity)?,
        );

        // Key index: only touched when the key value changed or appeared.
        if schema.extensions.key_field.is_some() {
            let old_key = old_live
                .as_ref()
                .map(|e| key_field_string(schema, &e.properties))
                .transpose()?
                .flatten();
            let new_key = key_field_string(schema, &entity.properties)?;
            if old_key != new_key {
                if let Some(old_key) = &old_key {
                    self.key_index
                        .stage_delete(tenant, &schema.short_name, old_key, &mut batch);
                }
            }
            if let Some(new_key) = &new_key {
                self.key_index
                    .stage_put(tenant, &schema.short_name, new_key, id, &mut batch);
            }
        }

        // Column index deltas.
        self.col_index.stage_update(
            tenant,
            schema,
            id,
            old_live.as_ref().map(|e| &e.properties),
            Some(&entity.properties),
            &mut batch,
        )?;

        // Vector index: compare text hashes to decide whether it is touched.
        let mut vector_materialized = false;
        if schema.has_embeddings() {
            let new_text = embedding_text(schema, &entity.properties);
            let new_hash = text_hash(&new_text);
            let current = self.vectors.record(tenant, &schema.short_name, id)?;
            let unchanged = current
                .as_ref()
                .map(|r| !r.stale && r.text_hash == new_hash)
                .unwrap_or(false);

            if !unchanged {
                match embedding {
                    EmbeddingOutcome::Vector(vector) => {
                        self.vectors.stage_vector(
                            tenant,
                            &schema.short_name,
                            id,
                            vector,
                            new_hash.clone(),
                            &mut batch,
                        )?;
                        vector_materialized = true;
                    }
                    EmbeddingOutcome::Unavailable | EmbeddingOutcome::NotApplicable => {
                        self.vectors.stage_stale(
                            tenant,
                            &schema.short_name,
                            id,
                            new_hash.clone(),
                            &mut batch,
                        )?;
                    }
                }
            }

            // Inverted index follows the same text.
            if schema.extensions.enable_bm25 {
                let old_text = old_live
                    .as_ref()
                    .map(|e| embedding_text(schema, &e.properties));
                self.inverted.stage_update(
                    tenant,
                    &schema.short_name,
                    id,
                    old_text.as_deref(),
                    Some(&new_text),
                    &mut batch,
                )?;
            }
        }

        // Moment time index.
        if schema.short_name == MOMENT_SCHEMA {
            if let Some(old_entity) = &old_live {
                if let Some(old_ts) = moment_ts(old_entity)? {
                    self.moments.stage_delete(tenant, old_ts, id, &mut batch);
                }
            }
            if let Some(ts) = moment_ts(&entity)? {
                self.moments.stage_put(tenant, ts, id, &mut batch);
            }
        }

        // WAL entry in the same batch.
        let entry = match replicated {
            Some(entry) => {
                self.wal.stage_entry(entry, &mut batch)?;
                self.wal.stage_applied_seq(entry.seq, &mut batch)?;
                entry.clone()
            }
            None => {
                let op = if old_live.is_some() {
                    WalOp::Update
                } else {
                    WalOp::Insert
                };
                // The payload is the full entity so replay and replication
                // reproduce system fields byte-for-byte.
                self.wal.stage_append(
                    tenant,
                    op,
                    id,
                    &schema.short_name,
                    serde_json::to_value(&entity)?,
                    vector_materialized,
                    &mut batch,
                )?
            }
        };

        self.commit_or_invalidate(tenant, &schema.short_name, batch)?;
        tracing::debug!(
            tenant,
            schema = %schema.short_name,
            %id,
            seq = entry.seq,
            "committed write"
        );
        Ok(entry)
    }

    /// Shared staging for tombstone deletes.
    fn stage_delete(
        &self,
        tenant: &str,
        schema: &Schema,
        old: Entity,
        replicated: Option<&WalEntry>,
    ) -> Result<WalEntry> {
        let id = old.system.id;
        let mut batch = BatchBuilder::new();

        let tombstone = match replicated {
            Some(entry) if entry.payload.is_object() => {
                let mut entity: Entity = serde_json::from_value(entry.payload.clone())?;
                entity.system.id = id;
                entity.system.tenant_id = tenant.to_string();
                entity
            }
            _ => {
                let mut entity = old.clone();
                entity.mark_deleted();
                entity
            }
        };
        batch.put(
            CF_ENTITIES,
            keys::entity_key(tenant, id),
            serde_json::to_vec(&tombstone)?,
        );

        if let Some(key_value) = key_field_string(schema, &old.properties)? {
            self.key_index
                .stage_delete(tenant, &schema.short_name, &key_value, &mut batch);
        }
        self.col_index
            .stage_update(tenant, schema, id, Some(&old.properties), None, &mut batch)?;
        if schema.has_embeddings() {
            self.vectors
                .stage_delete(tenant, &schema.short_name, id, &mut batch)?;
        }
        if schema.extensions.enable_bm25 {
            let old_text = embedding_text(schema, &old.properties);
            self.inverted.stage_update(
                tenant,
                &schema.short_name,
                id,
                Some(&old_text),
                None,
                &mut batch,
            )?;
        }
        if schema.short_name == MOMENT_SCHEMA {
            if let Some(ts) = moment_ts(&old)? {
                self.moments.stage_delete(tenant, ts, id, &mut batch);
            }
        }

        let entry = match replicated {
            Some(entry) => {
                self.wal.stage_entry(entry, &mut batch)?;
                self.wal.stage_applied_seq(entry.seq, &mut batch)?;
                entry.clone()
            }
            None => self.wal.stage_append(
                tenant,
                WalOp::Delete,
                id,
                &schema.short_name,
                serde_json::to_value(&tombstone)?,
                false,
                &mut batch,
            )?,
        };

        self.commit_or_invalidate(tenant, &schema.short_name, batch)?;
        Ok(entry)
    }

    /// Commit, invalidating the in-memory vector index on failure so it
    /// reloads from the untouched store.
    fn commit_or_invalidate(&self, tenant: &str, schema: &str, batch: BatchBuilder) -> Result<()> {
        match self.storage.commit(batch) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.vectors.invalidate(tenant, schema);
                Err(e)
            }
        }
    }

    fn publish(&self, entry: WalEntry) {
        if let Some(live) = &self.live {
            // No receivers is fine; followers may not be connected.
            let _ = live.send(entry);
        }
    }
}

/// The key-field value rendered as a string, if present.
fn key_field_string(schema: &Schema, properties: &serde_json::Value) -> Result<Option<String>> {
    let Some(key_field) = &schema.extensions.key_field else {
        return Ok(None);
    };
    match crate::types::entity::property_at_path(properties, key_field) {
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_json::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(DatabaseError::ValidationFailed(format!(
            "key field {key_field} must be a scalar, got {other}"
        ))),
        None => Ok(None),
    }
}

/// Epoch micros of a moment entity's timestamp property.
fn moment_ts(entity: &Entity) -> Result<Option<u64>> {
    match entity.property("timestamp").and_then(|v| v.as_str()) {
        Some(ts) => Ok(Some(ts_micros_from_rfc3339(ts)?)),
        None => Ok(None),
    }
}

fn edge_payload(edge: &Edge) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(edge)?)
}

fn edge_from_payload(payload: &serde_json::Value) -> Result<Edge> {
    Ok(serde_json::from_value(payload.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::builtin::register_builtin_schemas;
    use serde_json::json;

    fn article_doc() -> serde_json::Value {
        json!({
            "short_name": "article",
            "fully_qualified_name": "public.docs.Article",
            "properties": {
                "slug": {"type": "string"},
                "title": {"type": "string"},
                "content": {"type": "string"},
                "category": {"type": "string"}
            },
            "required": ["slug", "title"],
            "key_field": "slug",
            "embedding_fields": ["title", "content"],
            "indexed_columns": ["category"]
        })
    }

    fn setup() -> (tempfile::TempDir, Storage, Arc<SchemaRegistry>, WritePipeline) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let registry = Arc::new(SchemaRegistry::new(storage.clone()));
        register_builtin_schemas(&registry, "t1").unwrap();
        registry
            .register("t1", &article_doc(), &Default::default())
            .unwrap();

        let vectors = Arc::new(VectorIndexManager::new(storage.clone()));
        let wal = Arc::new(WriteAheadLog::new(storage.clone()).unwrap());
        let pipeline = WritePipeline::new(
            storage.clone(),
            Arc::clone(&registry),
            vectors,
            wal,
            None,
            false,
        );
        (dir, storage, registry, pipeline)
    }

    #[test]
    fn test_deterministic_insert_is_upsert() {
        let (_dir, _storage, _registry, pipeline) = setup();

        let id1 = pipeline
            .insert(
                "t1",
                "article",
                json!({"slug": "hello", "title": "Hello", "content": "World", "category": "tech"}),
                EmbeddingOutcome::Unavailable,
            )
            .unwrap();
        let id2 = pipeline
            .insert(
                "t1",
                "article",
                json!({"slug": "hello", "title": "Hi", "content": "There", "category": "tech"}),
                EmbeddingOutcome::Unavailable,
            )
            .unwrap();

        assert_eq!(id1, id2);
        let entity = pipeline.read_entity("t1", id1).unwrap().unwrap();
        assert_eq!(entity.property("title").unwrap(), &json!("Hi"));
        assert_eq!(entity.system.version, 2);
    }

    #[test]
    fn test_validation_failure_stages_nothing() {
        let (_dir, _storage, _registry, pipeline) = setup();

        let err = pipeline.insert(
            "t1",
            "article",
            json!({"slug": "x"}),
            EmbeddingOutcome::NotApplicable,
        );
        assert!(matches!(err, Err(DatabaseError::ValidationFailed(_))));
        assert_eq!(pipeline.wal.current_seq(), 0);
    }

    #[test]
    fn test_unknown_schema() {
        let (_dir, _storage, _registry, pipeline) = setup();
        assert!(matches!(
            pipeline.insert("t1", "nope", json!({}), EmbeddingOutcome::NotApplicable),
            Err(DatabaseError::SchemaUnknown(_))
        ));
    }

    #[test]
    fn test_delete_then_delete_is_not_found() {
        let (_dir, _storage, _registry, pipeline) = setup();
        let id = pipeline
            .insert(
                "t1",
                "article",
                json!({"slug": "gone", "title": "Gone", "content": "", "category": "x"}),
                EmbeddingOutcome::Unavailable,
            )
            .unwrap();

        pipeline.delete("t1", id).unwrap();
        assert!(matches!(
            pipeline.delete("t1", id),
            Err(DatabaseError::NotFound(_))
        ));

        let entity = pipeline.read_entity("t1", id).unwrap().unwrap();
        assert!(entity.is_deleted());
    }

    #[test]
    fn test_update_not_found() {
        let (_dir, _storage, _registry, pipeline) = setup();
        assert!(matches!(
            pipeline.update(
                "t1",
                Uuid::new_v4(),
                json!({"slug": "x", "title": "y"}),
                EmbeddingOutcome::NotApplicable
            ),
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let registry = Arc::new(SchemaRegistry::new(storage.clone()));
        register_builtin_schemas(&registry, "t1").unwrap();
        let vectors = Arc::new(VectorIndexManager::new(storage.clone()));
        let wal = Arc::new(WriteAheadLog::new(storage.clone()).unwrap());
        let pipeline =
            WritePipeline::new(storage, registry, vectors, wal, None, true);

        assert!(matches!(
            pipeline.insert("t1", "resource", json!({}), EmbeddingOutcome::NotApplicable),
            Err(DatabaseError::ReadOnlyReplica)
        ));
        assert!(matches!(
            pipeline.delete("t1", Uuid::new_v4()),
            Err(DatabaseError::ReadOnlyReplica)
        ));
    }

    #[test]
    fn test_edge_roundtrip_through_wal() {
        let (_dir, _storage, _registry, pipeline) = setup();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        pipeline
            .put_edge("t1", Edge::new(a, b, "cites".to_string()))
            .unwrap();
        assert!(pipeline.edges.get("t1", a, b, "cites").unwrap().is_some());

        let entry = pipeline.wal.get(1).unwrap().unwrap();
        assert_eq!(entry.schema, EDGE_SCHEMA);
        let decoded = edge_from_payload(&entry.payload).unwrap();
        assert_eq!(decoded.identity(), (a, b, "cites"));

        pipeline.remove_edge("t1", a, b, "cites").unwrap();
        assert!(pipeline.edges.get("t1", a, b, "cites").unwrap().is_none());
        assert!(matches!(
            pipeline.remove_edge("t1", a, b, "cites"),
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[test]
    fn test_apply_wal_entry_idempotent() {
        let (_dir, _storage, _registry, pipeline) = setup();
        let id = pipeline
            .insert(
                "t1",
                "article",
                json!({"slug": "a", "title": "A", "content": "x", "category": "tech"}),
                EmbeddingOutcome::Unavailable,
            )
            .unwrap();
        let entry = pipeline.wal.get(1).unwrap().unwrap();

        // Applying an already-recorded sequence is a no-op.
        pipeline.apply_wal_entry(entry.clone()).unwrap();
        let entity = pipeline.read_entity("t1", id).unwrap().unwrap();
        assert_eq!(entity.system.version, 1);
    }

    #[test]
    fn test_purge_removes_tombstone() {
        let (_dir, storage, _registry, pipeline) = setup();
        let id = pipeline
            .insert(
                "t1",
                "article",
                json!({"slug": "p", "title": "P", "content": "x", "category": "tech"}),
                EmbeddingOutcome::Unavailable,
            )
            .unwrap();

        // Live entities are not purged.
        assert!(!pipeline.purge_entity("t1", id).unwrap());

        pipeline.delete("t1", id).unwrap();
        assert!(pipeline.purge_entity("t1", id).unwrap());
        assert!(pipeline.read_entity("t1", id).unwrap().is_none());
        assert!(storage
            .get(CF_ENTITIES, &keys::entity_key("t1", id))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_moment_write_feeds_time_index() {
        let (_dir, _storage, _registry, pipeline) = setup();
        pipeline
            .insert(
                "t1",
                "moment",
                json!({
                    "timestamp": "2026-01-15T12:00:00Z",
                    "classification": "question",
                    "summary": "asked about rust"
                }),
                EmbeddingOutcome::Unavailable,
            )
            .unwrap();

        let start = ts_micros_from_rfc3339("2026-01-15T00:00:00Z").unwrap();
        let end = ts_micros_from_rfc3339("2026-01-16T00:00:00Z").unwrap();
        let hits = pipeline.moments.range("t1", start, end, 10).unwrap();
        assert_eq!(hits.len(), 1);
    }
}

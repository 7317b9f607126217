//! Vector records and the per-schema HNSW index manager.
//!
//! A vector record exists for every entity whose schema declares
//! `embedding_fields`, even when the embedding provider was unavailable: in
//! that case the record carries `stale = true` and the current text hash so
//! the re-embed sweep can backfill it later.

use crate::index::hnsw::{HnswIndex, HnswParams, NodeState};
use crate::storage::batch::BatchBuilder;
use crate::storage::column_families::{CF_HNSW, CF_META, CF_VECTORS};
use crate::storage::{keys, Storage};
use crate::types::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Packed vector plus the hash of the text it was computed from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub dim: u32,
    pub stale: bool,
    pub text_hash: String,
    pub vector: Vec<f32>,
}

impl VectorRecord {
    pub fn fresh(vector: Vec<f32>, text_hash: String) -> Self {
        Self {
            dim: vector.len() as u32,
            stale: false,
            text_hash,
            vector,
        }
    }

    pub fn stale(text_hash: String) -> Self {
        Self {
            dim: 0,
            stale: true,
            text_hash,
            vector: Vec::new(),
        }
    }
}

type IndexKey = (String, String);

/// Owns the HNSW indexes, one per `(tenant, schema)`, loading each lazily
/// from the `hnsw_graph` column family on first use.
///
/// Inserts take the index write lock briefly around neighbor-list updates;
/// searches take the read lock. If a batch commit fails after staging, the
/// caller invalidates the in-memory mirror so it reloads from the store.
pub struct VectorIndexManager {
    storage: Storage,
    indexes: RwLock<HashMap<IndexKey, Arc<RwLock<HnswIndex>>>>,
}

impl VectorIndexManager {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the stored vector record for an entity.
    pub fn record(&self, tenant: &str, schema: &str, id: Uuid) -> Result<Option<VectorRecord>> {
        let key = keys::vector_key(tenant, schema, id);
        match self.storage.get(CF_VECTORS, &key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persisted parameters for an index, if it exists.
    pub fn params(&self, tenant: &str, schema: &str) -> Result<Option<HnswParams>> {
        let key = keys::meta_hnsw_params_key(tenant, schema);
        match self.storage.get(CF_META, &key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn index_handle(
        &self,
        tenant: &str,
        schema: &str,
        create_with_dim: Option<usize>,
    ) -> Result<Option<Arc<RwLock<HnswIndex>>>> {
        let key = (tenant.to_string(), schema.to_string());

        {
            let indexes = self
                .indexes
                .read()
                .map_err(|_| DatabaseError::InternalError("index map poisoned".to_string()))?;
            if let Some(handle) = indexes.get(&key) {
                return Ok(Some(Arc::clone(handle)));
            }
        }

        let params = match self.params(tenant, schema)? {
            Some(params) => params,
            None => match create_with_dim {
                Some(dim) => HnswParams::new(dim),
                None => return Ok(None),
            },
        };

        let index = self.load_index(tenant, schema, params)?;
        let handle = Arc::new(RwLock::new(index));

        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| DatabaseError::InternalError("index map poisoned".to_string()))?;
        let entry = indexes.entry(key).or_insert_with(|| Arc::clone(&handle));
        Ok(Some(Arc::clone(entry)))
    }

    fn load_index(&self, tenant: &str, schema: &str, params: HnswParams) -> Result<HnswIndex> {
        let mut index = HnswIndex::new(tenant.to_string(), schema.to_string(), params);

        // Gather node states and adjacency lists.
        let node_tag = format!(
            "hnsw:{}:{}:node:",
            keys::escape_segment(tenant),
            keys::escape_segment(schema)
        );
        let prefix = keys::hnsw_prefix(tenant, schema);
        let prefix_str = String::from_utf8_lossy(&prefix).to_string();
        let mut states: HashMap<Uuid, NodeState> = HashMap::new();
        let mut adjacency: HashMap<Uuid, Vec<(u8, Vec<Uuid>)>> = HashMap::new();

        for (key, value) in self.storage.prefix_iter(CF_HNSW, &prefix)? {
            let text = String::from_utf8_lossy(&key).to_string();
            if let Some(id) = text.strip_prefix(&node_tag) {
                let id = Uuid::parse_str(id)?;
                states.insert(id, bincode::deserialize(&value)?);
            } else if let Some(rest) = text.strip_prefix(prefix_str.as_str()) {
                let mut parts = rest.splitn(2, ':');
                if let (Some(layer), Some(id)) = (parts.next(), parts.next()) {
                    if let (Ok(layer), Ok(id)) = (layer.parse::<u8>(), Uuid::parse_str(id)) {
                        adjacency
                            .entry(id)
                            .or_default()
                            .push((layer, bincode::deserialize(&value)?));
                    }
                }
            }
        }

        for (id, mut state) in states {
            let mut neighbors = vec![Vec::new(); state.top_layer as usize + 1];
            if let Some(lists) = adjacency.remove(&id) {
                for (layer, list) in lists {
                    if (layer as usize) < neighbors.len() {
                        neighbors[layer as usize] = list;
                    }
                }
            }
            // A stale or missing record still loads as a tombstoned routing
            // node, so neighbor lists and the entry point stay valid.
            let vector = match self.record(tenant, schema, id)? {
                Some(record) if !record.stale => record.vector,
                _ => {
                    state.deleted = true;
                    vec![0.0; index.params().dim]
                }
            };
            index.load_node(id, state, neighbors, vector);
        }

        let entry_key = keys::meta_hnsw_entry_key(tenant, schema);
        if let Some(bytes) = self.storage.get(CF_META, &entry_key)? {
            index.load_entry(Some(serde_json::from_slice(&bytes)?));
        }

        tracing::debug!(tenant, schema, nodes = index.len(), "loaded HNSW index");
        Ok(index)
    }

    /// Stage a fresh vector: record put, graph insert, params bootstrap.
    pub fn stage_vector(
        &self,
        tenant: &str,
        schema: &str,
        id: Uuid,
        vector: Vec<f32>,
        text_hash: String,
        batch: &mut BatchBuilder,
    ) -> Result<()> {
        let handle = self
            .index_handle(tenant, schema, Some(vector.len()))?
            .ok_or_else(|| DatabaseError::InternalError("index bootstrap failed".to_string()))?;

        let mut index = handle
            .write()
            .map_err(|_| DatabaseError::InternalError("index lock poisoned".to_string()))?;

        if index.params().dim != vector.len() {
            return Err(DatabaseError::SchemaInvalid(format!(
                "embedding dimension {} does not match index dimension {} for {schema}",
                vector.len(),
                index.params().dim
            )));
        }

        // First write persists the parameters alongside the graph.
        if index.is_empty() {
            batch.put(
                CF_META,
                keys::meta_hnsw_params_key(tenant, schema),
                serde_json::to_vec(index.params())?,
            );
        }

        let record = VectorRecord::fresh(vector.clone(), text_hash);
        batch.put(
            CF_VECTORS,
            keys::vector_key(tenant, schema, id),
            bincode::serialize(&record)?,
        );

        index.insert(id, vector, batch)
    }

    /// Stage a stale marker: the write commits, the vector comes later.
    pub fn stage_stale(
        &self,
        tenant: &str,
        schema: &str,
        id: Uuid,
        text_hash: String,
        batch: &mut BatchBuilder,
    ) -> Result<()> {
        let record = VectorRecord::stale(text_hash);
        batch.put(
            CF_VECTORS,
            keys::vector_key(tenant, schema, id),
            bincode::serialize(&record)?,
        );

        // An earlier vector may exist in the graph; tombstone it so searches
        // stop surfacing the outdated embedding.
        if let Some(handle) = self.index_handle(tenant, schema, None)? {
            let mut index = handle
                .write()
                .map_err(|_| DatabaseError::InternalError("index lock poisoned".to_string()))?;
            index.mark_deleted(id, batch);
        }
        Ok(())
    }

    /// Stage deletion of the vector record and tombstone the graph node.
    pub fn stage_delete(
        &self,
        tenant: &str,
        schema: &str,
        id: Uuid,
        batch: &mut BatchBuilder,
    ) -> Result<()> {
        batch.delete(CF_VECTORS, keys::vector_key(tenant, schema, id));
        if let Some(handle) = self.index_handle(tenant, schema, None)? {
            let mut index = handle
                .write()
                .map_err(|_| DatabaseError::InternalError("index lock poisoned".to_string()))?;
            index.mark_deleted(id, batch);
        }
        Ok(())
    }

    /// Top-k ANN search. Returns `(id, cosine distance)` ascending.
    pub fn search(
        &self,
        tenant: &str,
        schema: &str,
        query: &[f32],
        k: usize,
        ef: usize,
    ) -> Result<Vec<(Uuid, f32)>> {
        match self.index_handle(tenant, schema, None)? {
            Some(handle) => {
                let index = handle
                    .read()
                    .map_err(|_| DatabaseError::InternalError("index lock poisoned".to_string()))?;
                index.search(query, k, ef)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Physically remove a node (vacuum path).
    pub fn stage_remove(
        &self,
        tenant: &str,
        schema: &str,
        id: Uuid,
        batch: &mut BatchBuilder,
    ) -> Result<()> {
        batch.delete(CF_VECTORS, keys::vector_key(tenant, schema, id));
        if let Some(handle) = self.index_handle(tenant, schema, None)? {
            let mut index = handle
                .write()
                .map_err(|_| DatabaseError::InternalError("index lock poisoned".to_string()))?;
            index.remove(id, batch)?;
        }
        Ok(())
    }

    /// Stale vector records of a schema, up to `limit`.
    pub fn stale_records(
        &self,
        tenant: &str,
        schema: &str,
        limit: usize,
    ) -> Result<Vec<(Uuid, VectorRecord)>> {
        let prefix = keys::vector_prefix(tenant, schema);
        let mut out = Vec::new();
        for (key, value) in self.storage.prefix_iter(CF_VECTORS, &prefix)? {
            if out.len() >= limit {
                break;
            }
            let record: VectorRecord = bincode::deserialize(&value)?;
            if record.stale {
                let text = String::from_utf8_lossy(&key);
                if let Some(id) = text.rsplit(':').next() {
                    out.push((Uuid::parse_str(id)?, record));
                }
            }
        }
        Ok(out)
    }

    /// Drop the in-memory mirror so it reloads from the store.
    ///
    /// Called when a batch commit fails after graph staging.
    pub fn invalidate(&self, tenant: &str, schema: &str) {
        if let Ok(mut indexes) = self.indexes.write() {
            indexes.remove(&(tenant.to_string(), schema.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::text_hash;

    fn manager() -> (tempfile::TempDir, VectorIndexManager) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        (dir, VectorIndexManager::new(storage))
    }

    #[test]
    fn test_stage_and_search() {
        let (_dir, manager) = manager();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut batch = BatchBuilder::new();
        manager
            .stage_vector("t1", "article", a, vec![1.0, 0.0], text_hash("a"), &mut batch)
            .unwrap();
        manager
            .stage_vector("t1", "article", b, vec![0.0, 1.0], text_hash("b"), &mut batch)
            .unwrap();
        manager.storage.commit(batch).unwrap();

        let hits = manager.search("t1", "article", &[1.0, 0.1], 1, 10).unwrap();
        assert_eq!(hits[0].0, a);

        let record = manager.record("t1", "article", a).unwrap().unwrap();
        assert!(!record.stale);
        assert_eq!(record.dim, 2);
    }

    #[test]
    fn test_index_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let a = Uuid::new_v4();
        {
            let storage = Storage::open(dir.path()).unwrap();
            let manager = VectorIndexManager::new(storage.clone());
            let mut batch = BatchBuilder::new();
            manager
                .stage_vector("t1", "article", a, vec![1.0, 0.0], text_hash("a"), &mut batch)
                .unwrap();
            storage.commit(batch).unwrap();
        }

        // Fresh storage handle and manager: graph must come back from disk.
        let storage = Storage::open(dir.path()).unwrap();
        let manager = VectorIndexManager::new(storage);
        let hits = manager.search("t1", "article", &[1.0, 0.0], 1, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, a);
    }

    #[test]
    fn test_stale_record_lifecycle() {
        let (_dir, manager) = manager();
        let a = Uuid::new_v4();

        let mut batch = BatchBuilder::new();
        manager
            .stage_stale("t1", "article", a, text_hash("pending"), &mut batch)
            .unwrap();
        manager.storage.commit(batch).unwrap();

        let stale = manager.stale_records("t1", "article", 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, a);

        // Search finds nothing until the vector is materialised.
        assert!(manager
            .search("t1", "article", &[1.0, 0.0], 5, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_dimension_mismatch_refused() {
        let (_dir, manager) = manager();
        let mut batch = BatchBuilder::new();
        manager
            .stage_vector("t1", "article", Uuid::new_v4(), vec![1.0, 0.0], text_hash("a"), &mut batch)
            .unwrap();
        manager.storage.commit(batch).unwrap();

        let mut batch = BatchBuilder::new();
        let err = manager.stage_vector(
            "t1",
            "article",
            Uuid::new_v4(),
            vec![1.0, 0.0, 0.0],
            text_hash("b"),
            &mut batch,
        );
        assert!(matches!(err, Err(DatabaseError::SchemaInvalid(_))));
    }

    #[test]
    fn test_search_unknown_index_is_empty() {
        let (_dir, manager) = manager();
        assert!(manager
            .search("t1", "nothing", &[1.0], 5, 10)
            .unwrap()
            .is_empty());
    }
}

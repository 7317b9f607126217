//! Edge storage: each edge lives in both direction column families.
//!
//! `edges_out` is keyed by source, `edges_in` by destination, so outgoing and
//! incoming neighbor scans are both single prefix walks. The two halves are
//! always staged into the same batch.

use crate::storage::batch::BatchBuilder;
use crate::storage::column_families::{CF_EDGES_IN, CF_EDGES_OUT};
use crate::storage::{keys, Storage};
use crate::types::entity::EdgeValue;
use crate::types::{Edge, Result};
use uuid::Uuid;

/// Manager for the edge column families.
pub struct EdgeManager {
    storage: Storage,
}

impl EdgeManager {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Stage an edge upsert in both directions.
    pub fn stage_put(&self, tenant: &str, edge: &Edge, batch: &mut BatchBuilder) -> Result<()> {
        let value = bincode::serialize(&EdgeValue::from_edge(edge)?)?;
        batch.put(
            CF_EDGES_OUT,
            keys::edge_out_key(tenant, edge.src, &edge.edge_type, edge.dst),
            value.clone(),
        );
        batch.put(
            CF_EDGES_IN,
            keys::edge_in_key(tenant, edge.dst, &edge.edge_type, edge.src),
            value,
        );
        Ok(())
    }

    /// Stage removal of an edge from both directions.
    pub fn stage_delete(
        &self,
        tenant: &str,
        src: Uuid,
        dst: Uuid,
        edge_type: &str,
        batch: &mut BatchBuilder,
    ) {
        batch.delete(CF_EDGES_OUT, keys::edge_out_key(tenant, src, edge_type, dst));
        batch.delete(CF_EDGES_IN, keys::edge_in_key(tenant, dst, edge_type, src));
    }

    /// Fetch one edge by its identity tuple.
    pub fn get(
        &self,
        tenant: &str,
        src: Uuid,
        dst: Uuid,
        edge_type: &str,
    ) -> Result<Option<Edge>> {
        let key = keys::edge_out_key(tenant, src, edge_type, dst);
        match self.storage.get(CF_EDGES_OUT, &key)? {
            Some(bytes) => {
                let value: EdgeValue = bincode::deserialize(&bytes)?;
                Ok(Some(value.into_edge(src, dst)?))
            }
            None => Ok(None),
        }
    }

    /// Outgoing edges of `src`, optionally narrowed by type.
    pub fn outgoing(&self, tenant: &str, src: Uuid, edge_type: Option<&str>) -> Result<Vec<Edge>> {
        let prefix = keys::edge_out_prefix(tenant, src, edge_type);
        let mut edges = Vec::new();
        for (key, value) in self.storage.prefix_iter(CF_EDGES_OUT, &prefix)? {
            let (_tenant, src, _edge_type, dst) = keys::decode_edge_key(&key)?;
            let edge_value: EdgeValue = bincode::deserialize(&value)?;
            edges.push(edge_value.into_edge(src, dst)?);
        }
        Ok(edges)
    }

    /// Incoming edges of `dst`, optionally narrowed by type.
    pub fn incoming(&self, tenant: &str, dst: Uuid, edge_type: Option<&str>) -> Result<Vec<Edge>> {
        let prefix = keys::edge_in_prefix(tenant, dst, edge_type);
        let mut edges = Vec::new();
        for (key, value) in self.storage.prefix_iter(CF_EDGES_IN, &prefix)? {
            // Reverse keys carry (dst, type, src); flip back.
            let (_tenant, dst, _edge_type, src) = keys::decode_edge_key(&key)?;
            let edge_value: EdgeValue = bincode::deserialize(&value)?;
            edges.push(edge_value.into_edge(src, dst)?);
        }
        Ok(edges)
    }

    /// Stage removal of every edge touching `id`, both directions.
    ///
    /// Used when an entity is vacuumed so no dangling edge outlives it.
    pub fn stage_delete_all(&self, tenant: &str, id: Uuid, batch: &mut BatchBuilder) -> Result<()> {
        for edge in self.outgoing(tenant, id, None)? {
            self.stage_delete(tenant, edge.src, edge.dst, &edge.edge_type, batch);
        }
        for edge in self.incoming(tenant, id, None)? {
            self.stage_delete(tenant, edge.src, edge.dst, &edge.edge_type, batch);
        }
        Ok(())
    }
}

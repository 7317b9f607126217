//! Entity and edge data structures.
//!
//! Core data types representing entities (records) and edges (relationships)
//! in the REM database.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// System fields automatically managed for all entities.
///
/// These fields are never defined in user schemas; the write pipeline owns
/// them and ignores caller-supplied values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemFields {
    /// Unique identifier (deterministic UUIDv5 or random UUIDv4)
    pub id: Uuid,

    /// Owning tenant; every stored key embeds this prefix
    pub tenant_id: String,

    /// Short name of the schema this entity conforms to
    pub schema_name: String,

    /// Creation timestamp (RFC3339)
    pub created_at: String,

    /// Last modification timestamp (RFC3339)
    pub updated_at: String,

    /// Soft-delete tombstone flag
    #[serde(default)]
    pub deleted: bool,

    /// Incremented on each update (optimistic-concurrency hint, not strict)
    #[serde(default)]
    pub version: u64,
}

/// Entity: a typed JSON document with a stable id.
///
/// Serialized as canonical JSON in the `entities` column family so the record
/// stays portable across implementations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    /// System fields (pipeline-managed)
    #[serde(flatten)]
    pub system: SystemFields,

    /// User-defined properties, validated against the schema
    pub properties: serde_json::Value,
}

impl Entity {
    /// Create a new entity with system fields initialized.
    pub fn new(
        id: Uuid,
        tenant_id: String,
        schema_name: String,
        properties: serde_json::Value,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            system: SystemFields {
                id,
                tenant_id,
                schema_name,
                created_at: now.clone(),
                updated_at: now,
                deleted: false,
                version: 1,
            },
            properties,
        }
    }

    /// Mark entity as deleted (soft delete).
    pub fn mark_deleted(&mut self) {
        self.system.deleted = true;
        self.touch();
    }

    /// Check if entity is soft deleted.
    pub fn is_deleted(&self) -> bool {
        self.system.deleted
    }

    /// Bump version and refresh the modification timestamp.
    pub fn touch(&mut self) {
        self.system.version += 1;
        self.system.updated_at = chrono::Utc::now().to_rfc3339();
    }

    /// Get a property value by path.
    ///
    /// Paths use `.` to descend into nested objects (`author.name`).
    pub fn property(&self, path: &str) -> Option<&serde_json::Value> {
        property_at_path(&self.properties, path)
    }
}

/// Look up a value in a JSON object by dotted path.
pub fn property_at_path<'a>(
    properties: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut current = properties;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Graph edge connecting two entities.
///
/// Identity is the full `(src, dst, edge_type)` tuple; re-inserting the same
/// tuple is an upsert. Stored in both `edges_out` and `edges_in` for
/// bidirectional traversal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    /// Source entity id
    pub src: Uuid,

    /// Destination entity id
    pub dst: Uuid,

    /// Relationship type (e.g. "cites", "authored")
    pub edge_type: String,

    /// Edge properties (optional metadata)
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,

    /// Optional weight
    #[serde(default)]
    pub weight: Option<f32>,

    /// Creation timestamp (RFC3339)
    pub created_at: String,
}

impl Edge {
    /// Create a new edge with the current timestamp.
    pub fn new(src: Uuid, dst: Uuid, edge_type: String) -> Self {
        Self {
            src,
            dst,
            edge_type,
            properties: HashMap::new(),
            weight: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Identity tuple for upsert comparison.
    pub fn identity(&self) -> (Uuid, Uuid, &str) {
        (self.src, self.dst, &self.edge_type)
    }
}

/// Compact binary form of an edge stored in the edge column families.
///
/// Edge properties ride along as an embedded JSON blob so the outer record
/// stays bincode-friendly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeValue {
    pub edge_type: String,
    pub weight: Option<f32>,
    pub created_at: String,
    pub properties_json: String,
}

impl EdgeValue {
    pub fn from_edge(edge: &Edge) -> crate::types::Result<Self> {
        Ok(Self {
            edge_type: edge.edge_type.clone(),
            weight: edge.weight,
            created_at: edge.created_at.clone(),
            properties_json: serde_json::to_string(&edge.properties)?,
        })
    }

    pub fn into_edge(self, src: Uuid, dst: Uuid) -> crate::types::Result<Edge> {
        Ok(Edge {
            src,
            dst,
            edge_type: self.edge_type,
            weight: self.weight,
            created_at: self.created_at,
            properties: serde_json::from_str(&self.properties_json)?,
        })
    }
}

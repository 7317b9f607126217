//! Built-in schemas registered at database open.
//!
//! Three record kinds ship with every instance: `schema` (the registry's own
//! record kind), `resource` (chunked documents for semantic search), and
//! `moment` (time-ordered interaction classifications).

use crate::schema::SchemaRegistry;
use crate::types::Result;
use serde_json::json;
use std::collections::HashSet;

/// Schema describing schema records themselves.
pub fn schema_schema() -> serde_json::Value {
    json!({
        "short_name": "schema",
        "fully_qualified_name": "system.registry.Schema",
        "version": "1.0.0",
        "description": "A registered schema document",
        "properties": {
            "short_name": {"type": "string", "description": "Table name used in queries"},
            "fully_qualified_name": {"type": "string", "description": "Globally unique schema identifier"},
            "version": {"type": "string", "description": "Semantic version"},
            "json_schema": {"type": "object", "description": "Draft-07 validation body"}
        },
        "required": ["short_name", "fully_qualified_name"],
        "key_field": "fully_qualified_name",
        "indexed_columns": ["short_name"]
    })
}

/// Chunked documents with embeddings, the Resource kind of the REM model.
pub fn resource_schema() -> serde_json::Value {
    json!({
        "short_name": "resource",
        "fully_qualified_name": "system.content.Resource",
        "version": "1.0.0",
        "description": "A chunk of an ingested document, embedded for semantic search",
        "properties": {
            "uri": {"type": "string", "description": "Source document URI"},
            "chunk_ordinal": {"type": "integer", "description": "Chunk number within the document, 0-based"},
            "chunk_key": {"type": "string", "description": "Stable key: uri#chunk_ordinal"},
            "title": {"type": "string", "description": "Document or section title"},
            "content": {"type": "string", "description": "Chunk text"},
            "category": {"type": "string", "description": "Content category"},
            "metadata": {"type": "object", "description": "Parser-provided metadata"}
        },
        "required": ["uri", "chunk_key", "content"],
        "key_field": "chunk_key",
        "embedding_fields": ["title", "content"],
        "indexed_columns": ["uri", "category"],
        "enable_bm25": true
    })
}

/// Time-ordered user-interaction classifications, the Moment kind.
pub fn moment_schema() -> serde_json::Value {
    json!({
        "short_name": "moment",
        "fully_qualified_name": "system.interaction.Moment",
        "version": "1.0.0",
        "description": "A classified user interaction, keyed by time for range scans",
        "properties": {
            "timestamp": {"type": "string", "description": "Interaction time, RFC3339"},
            "classification": {"type": "string", "description": "Interaction class label"},
            "summary": {"type": "string", "description": "Short description of the interaction"},
            "participants": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Entity ids involved"
            }
        },
        "required": ["timestamp", "classification"],
        "embedding_fields": ["summary"],
        "indexed_columns": ["classification"]
    })
}

/// Register the built-in schemas for a tenant.
///
/// Idempotent: re-registering the same documents supersedes in place.
pub fn register_builtin_schemas(registry: &SchemaRegistry, tenant: &str) -> Result<()> {
    let no_providers = HashSet::new();
    for doc in [schema_schema(), resource_schema(), moment_schema()] {
        registry.register(tenant, &doc, &no_providers)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use crate::storage::Storage;

    #[test]
    fn test_builtin_schemas_parse() {
        for doc in [schema_schema(), resource_schema(), moment_schema()] {
            Schema::parse(&doc).unwrap();
        }
    }

    #[test]
    fn test_register_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SchemaRegistry::new(Storage::open(dir.path()).unwrap());

        register_builtin_schemas(&registry, "t1").unwrap();
        assert_eq!(registry.list("t1"), vec!["moment", "resource", "schema"]);

        let resource = registry.get("t1", "resource").unwrap();
        assert!(resource.extensions.enable_bm25);
        assert_eq!(resource.extensions.key_field.as_deref(), Some("chunk_key"));

        // Idempotent re-registration.
        register_builtin_schemas(&registry, "t1").unwrap();
    }
}

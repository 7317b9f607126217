//! Export of a schema's live entities to csv, jsonl, or parquet.

pub mod csv;
pub mod jsonl;
pub mod parquet;

use crate::schema::Schema;
use crate::types::{DatabaseError, Entity, Result};
use std::path::Path;

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Jsonl,
    Parquet,
}

impl std::str::FromStr for ExportFormat {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "csv" => Ok(ExportFormat::Csv),
            "jsonl" => Ok(ExportFormat::Jsonl),
            "parquet" => Ok(ExportFormat::Parquet),
            other => Err(DatabaseError::BadQuery(format!(
                "unknown export format: {other} (expected csv|jsonl|parquet)"
            ))),
        }
    }
}

/// Write `entities` to `path` in the chosen format.
pub fn export(
    format: ExportFormat,
    path: &Path,
    schema: &Schema,
    entities: &[Entity],
) -> Result<usize> {
    match format {
        ExportFormat::Csv => csv::write(path, schema, entities),
        ExportFormat::Jsonl => jsonl::write(path, entities),
        ExportFormat::Parquet => parquet::write(path, schema, entities),
    }
}

/// Flat column set for tabular formats: system fields first, then the
/// schema's declared properties in sorted order.
pub(crate) fn flat_columns(schema: &Schema) -> Vec<String> {
    let mut columns = vec![
        "id".to_string(),
        "created_at".to_string(),
        "updated_at".to_string(),
        "version".to_string(),
    ];
    let mut properties: Vec<String> = schema
        .json_schema
        .get("properties")
        .and_then(|v| v.as_object())
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    properties.sort();
    columns.extend(properties);
    columns
}

/// Render one cell: system field or property, JSON-encoded unless scalar
/// string.
pub(crate) fn flat_value(entity: &Entity, column: &str) -> String {
    match column {
        "id" => entity.system.id.to_string(),
        "created_at" => entity.system.created_at.clone(),
        "updated_at" => entity.system.updated_at.clone(),
        "version" => entity.system.version.to_string(),
        property => match entity.property(property) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        },
    }
}

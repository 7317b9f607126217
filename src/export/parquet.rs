//! Parquet export via Arrow.

use crate::export::{flat_columns, flat_value};
use crate::schema::Schema;
use crate::types::{DatabaseError, Entity, Result};
use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use std::path::Path;
use std::sync::Arc;

/// Write entities as a single-row-group parquet file. Returns the row count.
///
/// All columns are encoded as UTF-8 strings so the file round-trips the
/// entity's JSON values without per-schema type mapping.
pub fn write(path: &Path, schema: &Schema, entities: &[Entity]) -> Result<usize> {
    let columns = flat_columns(schema);

    let fields: Vec<Field> = columns
        .iter()
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect();
    let arrow_schema = Arc::new(ArrowSchema::new(fields));

    let arrays: Vec<ArrayRef> = columns
        .iter()
        .map(|column| {
            let values: Vec<String> = entities
                .iter()
                .map(|entity| flat_value(entity, column))
                .collect();
            Arc::new(StringArray::from(values)) as ArrayRef
        })
        .collect();

    let batch = RecordBatch::try_new(Arc::clone(&arrow_schema), arrays)
        .map_err(|e| DatabaseError::InternalError(format!("record batch: {e}")))?;

    let file = std::fs::File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, arrow_schema, None)
        .map_err(|e| DatabaseError::InternalError(format!("parquet writer: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| DatabaseError::InternalError(format!("parquet write: {e}")))?;
    writer
        .close()
        .map_err(|e| DatabaseError::InternalError(format!("parquet close: {e}")))?;

    Ok(entities.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_parquet_roundtrip() {
        let schema = Schema::parse(&json!({
            "short_name": "article",
            "properties": {"title": {"type": "string"}}
        }))
        .unwrap();
        let entities = vec![
            Entity::new(Uuid::new_v4(), "t1".into(), "article".into(), json!({"title": "A"})),
            Entity::new(Uuid::new_v4(), "t1".into(), "article".into(), json!({"title": "B"})),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        assert_eq!(write(&path, &schema, &entities).unwrap(), 2);

        let file = std::fs::File::open(&path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);
        assert_eq!(batches[0].schema().field(0).name(), "id");
    }
}

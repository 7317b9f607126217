//! CSV export.

use crate::export::{flat_columns, flat_value};
use crate::schema::Schema;
use crate::types::{DatabaseError, Entity, Result};
use std::path::Path;

/// Write entities as CSV with a header row. Returns the row count.
pub fn write(path: &Path, schema: &Schema, entities: &[Entity]) -> Result<usize> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| DatabaseError::IoError(std::io::Error::other(e)))?;

    let columns = flat_columns(schema);
    writer
        .write_record(&columns)
        .map_err(|e| DatabaseError::IoError(std::io::Error::other(e)))?;

    for entity in entities {
        let row: Vec<String> = columns.iter().map(|c| flat_value(entity, c)).collect();
        writer
            .write_record(&row)
            .map_err(|e| DatabaseError::IoError(std::io::Error::other(e)))?;
    }
    writer
        .flush()
        .map_err(|e| DatabaseError::IoError(std::io::Error::other(e)))?;
    Ok(entities.len())
}

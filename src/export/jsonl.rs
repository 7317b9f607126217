//! JSONL export: one entity document per line.

use crate::types::{Entity, Result};
use std::io::Write;
use std::path::Path;

/// Write entities as newline-delimited JSON. Returns the row count.
pub fn write(path: &Path, entities: &[Entity]) -> Result<usize> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);

    for entity in entities {
        serde_json::to_writer(&mut writer, entity)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(entities.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_jsonl_roundtrip() {
        let entities = vec![
            Entity::new(Uuid::new_v4(), "t1".into(), "article".into(), json!({"title": "A"})),
            Entity::new(Uuid::new_v4(), "t1".into(), "article".into(), json!({"title": "B"})),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        assert_eq!(write(&path, &entities).unwrap(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<Entity> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed, entities);
    }
}

//! JSON Schema validation (draft-07).

use crate::types::{DatabaseError, Result};
use jsonschema::{Draft, JSONSchema};

/// Compiled validator for one schema.
///
/// Compilation happens once at registration; validation is a lookup plus a
/// walk of the instance.
pub struct SchemaValidator {
    compiled: JSONSchema,
}

impl SchemaValidator {
    /// Compile a JSON Schema document.
    pub fn new(schema: &serde_json::Value) -> Result<Self> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| DatabaseError::SchemaInvalid(format!("schema does not compile: {e}")))?;
        Ok(Self { compiled })
    }

    /// Validate entity properties against the schema.
    pub fn validate(&self, properties: &serde_json::Value) -> Result<()> {
        if let Err(errors) = self.compiled.validate(properties) {
            let detail = errors
                .take(3)
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DatabaseError::ValidationFailed(detail));
        }
        Ok(())
    }

    /// Check validity without error details.
    pub fn is_valid(&self, properties: &serde_json::Value) -> bool {
        self.compiled.is_valid(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn article_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "rating": {"type": "number", "minimum": 0}
            },
            "required": ["title"]
        })
    }

    #[test]
    fn test_valid_instance() {
        let validator = SchemaValidator::new(&article_schema()).unwrap();
        assert!(validator
            .validate(&json!({"title": "Hello", "rating": 4.5}))
            .is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let validator = SchemaValidator::new(&article_schema()).unwrap();
        let err = validator.validate(&json!({"rating": 4.5})).unwrap_err();
        assert!(matches!(err, DatabaseError::ValidationFailed(_)));
    }

    #[test]
    fn test_wrong_type() {
        let validator = SchemaValidator::new(&article_schema()).unwrap();
        assert!(!validator.is_valid(&json!({"title": 42})));
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let broken = json!({"type": "object", "properties": {"x": {"type": "no-such-type"}}});
        assert!(SchemaValidator::new(&broken).is_err());
    }
}

//! Schema registry: parsing, validation rules, persistence, caching.

use crate::schema::validator::SchemaValidator;
use crate::storage::column_families::CF_SCHEMAS;
use crate::storage::{keys, Storage};
use crate::types::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Indexing and embedding extensions carried by a schema document.
///
/// Parsed once at registration into this typed struct; the raw document keeps
/// the original fields for portability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchemaExtensions {
    /// Property paths whose concatenated text is embedded.
    #[serde(default)]
    pub embedding_fields: Vec<String>,

    /// Property paths indexed for SQL predicates.
    #[serde(default)]
    pub indexed_columns: Vec<String>,

    /// Property path used to derive the deterministic id and serve lookups.
    #[serde(default)]
    pub key_field: Option<String>,

    /// Overrides the global default embedding provider.
    #[serde(default)]
    pub default_embedding_provider: Option<String>,

    /// Opt-in flag for the BM25 inverted index (hybrid search).
    #[serde(default)]
    pub enable_bm25: bool,

    /// Opaque pass-through for the agent layer.
    #[serde(default)]
    pub tools: serde_json::Value,

    /// Opaque pass-through for the agent layer.
    #[serde(default)]
    pub resources: serde_json::Value,
}

/// A registered schema: validation body plus typed extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Unique per tenant, kebab-case; the name used in SQL `FROM` clauses.
    pub short_name: String,

    /// Globally unique identifier, e.g. `public.docs.Article`.
    pub fully_qualified_name: String,

    /// Semantic version; bumped when a registration supersedes.
    pub version: String,

    /// JSON Schema draft-07 validation body.
    pub json_schema: serde_json::Value,

    /// Parsed indexing and embedding extensions.
    pub extensions: SchemaExtensions,
}

impl Schema {
    /// Parse a schema document.
    ///
    /// Accepted layout: top-level `short_name`, `fully_qualified_name` (or
    /// `name`), optional `version`, a `json_schema` body (or top-level
    /// `properties` treated as the body), and extension fields at top level.
    pub fn parse(doc: &serde_json::Value) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| DatabaseError::SchemaInvalid("schema must be an object".to_string()))?;

        let short_name = obj
            .get("short_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DatabaseError::SchemaInvalid("missing short_name".to_string()))?
            .to_string();

        let fully_qualified_name = obj
            .get("fully_qualified_name")
            .or_else(|| obj.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or(&short_name)
            .to_string();

        let version = obj
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("1.0.0")
            .to_string();

        let json_schema = if let Some(body) = obj.get("json_schema") {
            body.clone()
        } else if obj.contains_key("properties") {
            // Inline body: lift the validation keywords out of the envelope.
            let mut body = serde_json::Map::new();
            body.insert("type".to_string(), serde_json::json!("object"));
            for kw in ["properties", "required", "additionalProperties"] {
                if let Some(v) = obj.get(kw) {
                    body.insert(kw.to_string(), v.clone());
                }
            }
            serde_json::Value::Object(body)
        } else {
            return Err(DatabaseError::SchemaInvalid(
                "missing json_schema or properties".to_string(),
            ));
        };

        let extensions = SchemaExtensions {
            embedding_fields: string_list(obj.get("embedding_fields")),
            indexed_columns: string_list(obj.get("indexed_columns")),
            key_field: obj
                .get("key_field")
                .and_then(|v| v.as_str())
                .map(String::from),
            default_embedding_provider: obj
                .get("default_embedding_provider")
                .and_then(|v| v.as_str())
                .map(String::from),
            enable_bm25: obj
                .get("enable_bm25")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            tools: obj.get("tools").cloned().unwrap_or(serde_json::Value::Null),
            resources: obj
                .get("resources")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        };

        let schema = Self {
            short_name,
            fully_qualified_name,
            version,
            json_schema,
            extensions,
        };
        schema.check_rules()?;
        Ok(schema)
    }

    /// Validation rules applied before acceptance.
    fn check_rules(&self) -> Result<()> {
        if self.short_name.is_empty()
            || !self
                .short_name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(DatabaseError::SchemaInvalid(format!(
                "short_name must match [a-z0-9-]+: {}",
                self.short_name
            )));
        }

        let properties: HashSet<&str> = self
            .json_schema
            .get("properties")
            .and_then(|v| v.as_object())
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();

        let mut referenced: Vec<(&str, &str)> = Vec::new();
        for field in &self.extensions.embedding_fields {
            referenced.push(("embedding_fields", field));
        }
        for field in &self.extensions.indexed_columns {
            referenced.push(("indexed_columns", field));
        }
        if let Some(key_field) = &self.extensions.key_field {
            referenced.push(("key_field", key_field));
        }

        for (section, field) in referenced {
            // Only the root segment of a dotted path must be declared.
            let root = field.split('.').next().unwrap_or(field);
            if !properties.contains(root) {
                return Err(DatabaseError::SchemaInvalid(format!(
                    "{section} references unknown property: {field}"
                )));
            }
        }

        Ok(())
    }

    /// Whether writes of this schema feed the vector index.
    pub fn has_embeddings(&self) -> bool {
        !self.extensions.embedding_fields.is_empty()
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

struct CachedSchema {
    schema: Arc<Schema>,
    validator: Arc<SchemaValidator>,
}

/// Schema registry backed by the `schemas` column family.
///
/// Parsed schemas and compiled validators are cached in memory; the cache is
/// refreshed on register and on open.
pub struct SchemaRegistry {
    storage: Storage,
    cache: RwLock<HashMap<(String, String), CachedSchema>>,
}

impl SchemaRegistry {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load every persisted schema of `tenant` into the cache.
    pub fn load(&self, tenant: &str) -> Result<usize> {
        let prefix = keys::schema_prefix(tenant);
        let mut loaded = 0;
        for (_key, value) in self.storage.prefix_iter(CF_SCHEMAS, &prefix)? {
            let doc: serde_json::Value = serde_json::from_slice(&value)?;
            let schema = Schema::parse(&doc)?;
            self.insert_cache(tenant, schema)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Register a schema document.
    ///
    /// Fails with `SchemaInvalid` for rule violations, `SchemaConflict` when
    /// the short name is taken by a different fully-qualified name. Re-posting
    /// the same fully-qualified name supersedes the previous version.
    pub fn register(
        &self,
        tenant: &str,
        doc: &serde_json::Value,
        known_providers: &HashSet<String>,
    ) -> Result<Arc<Schema>> {
        self.register_inner(tenant, doc, Some(known_providers))
    }

    /// Register a schema arriving through the WAL stream.
    ///
    /// Provider tags are not checked: a follower does not need the primary's
    /// providers to store data.
    pub fn register_replicated(&self, tenant: &str, doc: &serde_json::Value) -> Result<Arc<Schema>> {
        self.register_inner(tenant, doc, None)
    }

    fn register_inner(
        &self,
        tenant: &str,
        doc: &serde_json::Value,
        known_providers: Option<&HashSet<String>>,
    ) -> Result<Arc<Schema>> {
        let schema = Schema::parse(doc)?;

        if let (Some(provider), Some(known)) = (
            &schema.extensions.default_embedding_provider,
            known_providers,
        ) {
            if !known.contains(provider) {
                return Err(DatabaseError::SchemaInvalid(format!(
                    "unknown embedding provider: {provider}"
                )));
            }
        }

        if let Ok(existing) = self.get(tenant, &schema.short_name) {
            if existing.fully_qualified_name != schema.fully_qualified_name {
                return Err(DatabaseError::SchemaConflict(format!(
                    "short_name '{}' is registered as '{}'",
                    schema.short_name, existing.fully_qualified_name
                )));
            }
            tracing::info!(
                schema = %schema.short_name,
                from = %existing.version,
                to = %schema.version,
                "superseding schema"
            );
        }

        let key = keys::schema_key(tenant, &schema.short_name);
        self.storage
            .put(CF_SCHEMAS, &key, &serde_json::to_vec(doc)?)?;

        self.insert_cache(tenant, schema.clone())?;
        self.get(tenant, &schema.short_name)
    }

    fn insert_cache(&self, tenant: &str, schema: Schema) -> Result<()> {
        let validator = Arc::new(SchemaValidator::new(&schema.json_schema)?);
        let mut cache = self
            .cache
            .write()
            .map_err(|_| DatabaseError::InternalError("schema cache poisoned".to_string()))?;
        cache.insert(
            (tenant.to_string(), schema.short_name.clone()),
            CachedSchema {
                schema: Arc::new(schema),
                validator,
            },
        );
        Ok(())
    }

    /// Get a schema by tenant and short name.
    pub fn get(&self, tenant: &str, short_name: &str) -> Result<Arc<Schema>> {
        let cache = self
            .cache
            .read()
            .map_err(|_| DatabaseError::InternalError("schema cache poisoned".to_string()))?;
        cache
            .get(&(tenant.to_string(), short_name.to_string()))
            .map(|c| Arc::clone(&c.schema))
            .ok_or_else(|| DatabaseError::SchemaUnknown(short_name.to_string()))
    }

    /// Compiled validator for a schema.
    pub fn validator(&self, tenant: &str, short_name: &str) -> Result<Arc<SchemaValidator>> {
        let cache = self
            .cache
            .read()
            .map_err(|_| DatabaseError::InternalError("schema cache poisoned".to_string()))?;
        cache
            .get(&(tenant.to_string(), short_name.to_string()))
            .map(|c| Arc::clone(&c.validator))
            .ok_or_else(|| DatabaseError::SchemaUnknown(short_name.to_string()))
    }

    /// List the short names registered for a tenant, sorted.
    pub fn list(&self, tenant: &str) -> Vec<String> {
        let cache = match self.cache.read() {
            Ok(cache) => cache,
            Err(_) => return Vec::new(),
        };
        let mut names: Vec<String> = cache
            .keys()
            .filter(|(t, _)| t == tenant)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn article_doc() -> serde_json::Value {
        json!({
            "short_name": "article",
            "fully_qualified_name": "public.docs.Article",
            "version": "1.0.0",
            "properties": {
                "slug": {"type": "string", "description": "URL slug"},
                "title": {"type": "string", "description": "Title"},
                "content": {"type": "string", "description": "Body text"},
                "category": {"type": "string", "description": "Category tag"}
            },
            "required": ["slug", "title"],
            "key_field": "slug",
            "embedding_fields": ["title", "content"],
            "indexed_columns": ["category"]
        })
    }

    fn registry() -> (tempfile::TempDir, SchemaRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        (dir, SchemaRegistry::new(storage))
    }

    #[test]
    fn test_parse_extensions() {
        let schema = Schema::parse(&article_doc()).unwrap();
        assert_eq!(schema.short_name, "article");
        assert_eq!(schema.extensions.key_field.as_deref(), Some("slug"));
        assert_eq!(schema.extensions.embedding_fields, vec!["title", "content"]);
        assert_eq!(schema.extensions.indexed_columns, vec!["category"]);
        assert!(!schema.extensions.enable_bm25);
    }

    #[test]
    fn test_bad_short_name() {
        let mut doc = article_doc();
        doc["short_name"] = json!("Article!");
        assert!(matches!(
            Schema::parse(&doc),
            Err(DatabaseError::SchemaInvalid(_))
        ));
    }

    #[test]
    fn test_unknown_indexed_column() {
        let mut doc = article_doc();
        doc["indexed_columns"] = json!(["no_such_field"]);
        assert!(matches!(
            Schema::parse(&doc),
            Err(DatabaseError::SchemaInvalid(_))
        ));
    }

    #[test]
    fn test_register_and_reload() {
        let (_dir, registry) = registry();
        let providers = HashSet::new();

        registry
            .register("t1", &article_doc(), &providers)
            .unwrap();
        assert_eq!(registry.list("t1"), vec!["article"]);
        assert!(registry.get("t1", "article").is_ok());
        // Other tenants do not see it.
        assert!(registry.get("t2", "article").is_err());

        // A fresh registry over the same storage reloads from the CF.
        let fresh = SchemaRegistry::new(registry.storage.clone());
        assert_eq!(fresh.load("t1").unwrap(), 1);
        assert!(fresh.get("t1", "article").is_ok());
    }

    #[test]
    fn test_conflicting_fqn_rejected() {
        let (_dir, registry) = registry();
        let providers = HashSet::new();
        registry
            .register("t1", &article_doc(), &providers)
            .unwrap();

        let mut other = article_doc();
        other["fully_qualified_name"] = json!("private.other.Article");
        assert!(matches!(
            registry.register("t1", &other, &providers),
            Err(DatabaseError::SchemaConflict(_))
        ));
    }

    #[test]
    fn test_supersede_same_fqn() {
        let (_dir, registry) = registry();
        let providers = HashSet::new();
        registry
            .register("t1", &article_doc(), &providers)
            .unwrap();

        let mut v2 = article_doc();
        v2["version"] = json!("1.1.0");
        let schema = registry.register("t1", &v2, &providers).unwrap();
        assert_eq!(schema.version, "1.1.0");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let (_dir, registry) = registry();
        let mut doc = article_doc();
        doc["default_embedding_provider"] = json!("openai:text-embedding-3-small");
        assert!(matches!(
            registry.register("t1", &doc, &HashSet::new()),
            Err(DatabaseError::SchemaInvalid(_))
        ));

        let mut providers = HashSet::new();
        providers.insert("openai:text-embedding-3-small".to_string());
        assert!(registry.register("t1", &doc, &providers).is_ok());
    }
}

//! Secondary column index for SQL predicates.
//!
//! One composite key per `(entity, indexed column)`:
//! `col:{tenant}:{schema}:{column}:{encoded_value}:{id}` with an empty value.
//! Values are encoded so lexicographic byte order equals natural order, which
//! turns equality predicates into prefix scans and range predicates into
//! bounded range scans. A missing or null property is indexed under the null
//! encoding so `IS NULL` stays a prefix scan too.

use crate::schema::Schema;
use crate::storage::batch::BatchBuilder;
use crate::storage::column_families::{CF_COL_INDEX, CF_META};
use crate::storage::{keys, Storage};
use crate::types::entity::property_at_path;
use crate::types::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lightweight per-column statistics, refreshed lazily by the planner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnStats {
    /// Indexed rows (sampled, capped).
    pub rows: u64,
    /// Distinct values seen in the sample.
    pub distinct: u64,
    /// When the sample was taken (RFC3339).
    pub refreshed_at: String,
}

impl ColumnStats {
    /// Estimated rows matching one equality value.
    pub fn estimated_rows_per_value(&self) -> f64 {
        if self.distinct == 0 {
            0.0
        } else {
            self.rows as f64 / self.distinct as f64
        }
    }
}

/// Cap on rows visited by a stats refresh.
const STATS_SAMPLE_CAP: usize = 10_000;

/// Manager for the `col_index` column family.
pub struct ColumnIndex {
    storage: Storage,
}

impl ColumnIndex {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    fn indexed_value(properties: Option<&serde_json::Value>, column: &str) -> serde_json::Value {
        properties
            .and_then(|p| property_at_path(p, column))
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    /// Stage index maintenance for one entity write.
    ///
    /// `old_properties` is `None` on insert; `new_properties` is `None` on
    /// delete. Only columns whose value actually changed are touched.
    pub fn stage_update(
        &self,
        tenant: &str,
        schema: &Schema,
        id: Uuid,
        old_properties: Option<&serde_json::Value>,
        new_properties: Option<&serde_json::Value>,
        batch: &mut BatchBuilder,
    ) -> Result<()> {
        for column in &schema.extensions.indexed_columns {
            let old_value = old_properties.map(|p| Self::indexed_value(Some(p), column));
            let new_value = new_properties.map(|p| Self::indexed_value(Some(p), column));

            if old_value == new_value {
                continue;
            }

            if let Some(old_value) = &old_value {
                let encoded = keys::encode_sortable_value(old_value)?;
                batch.delete(
                    CF_COL_INDEX,
                    keys::col_index_key(tenant, &schema.short_name, column, &encoded, id),
                );
            }
            if let Some(new_value) = &new_value {
                let encoded = keys::encode_sortable_value(new_value)?;
                batch.put(
                    CF_COL_INDEX,
                    keys::col_index_key(tenant, &schema.short_name, column, &encoded, id),
                    Vec::new(),
                );
            }
        }
        Ok(())
    }

    /// Entity ids with `column == value`.
    pub fn scan_eq(
        &self,
        tenant: &str,
        schema: &str,
        column: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<Uuid>> {
        let encoded = keys::encode_sortable_value(value)?;
        let prefix = keys::col_index_prefix(tenant, schema, column, Some(&encoded));
        let mut ids = Vec::new();
        for (key, _) in self.storage.prefix_iter(CF_COL_INDEX, &prefix)? {
            ids.push(keys::decode_col_index_id(&key)?);
        }
        Ok(ids)
    }

    /// Entity ids with `column` in the given bounds.
    pub fn scan_range(
        &self,
        tenant: &str,
        schema: &str,
        column: &str,
        low: Option<(&serde_json::Value, bool)>,
        high: Option<(&serde_json::Value, bool)>,
    ) -> Result<Vec<Uuid>> {
        let column_prefix = keys::col_index_prefix(tenant, schema, column, None);
        let low_encoded = low
            .map(|(v, inclusive)| Ok::<_, crate::types::DatabaseError>((keys::encode_sortable_value(v)?, inclusive)))
            .transpose()?;
        let high_encoded = high
            .map(|(v, inclusive)| Ok::<_, crate::types::DatabaseError>((keys::encode_sortable_value(v)?, inclusive)))
            .transpose()?;

        let mut ids = Vec::new();
        for (key, _) in self.storage.prefix_iter(CF_COL_INDEX, &column_prefix)? {
            let text = String::from_utf8_lossy(&key);
            let rest = &text[String::from_utf8_lossy(&column_prefix).len()..];
            let Some((encoded_value, _id)) = rest.rsplit_once(':') else {
                continue;
            };

            if let Some((low, inclusive)) = &low_encoded {
                let ord = encoded_value.cmp(low.as_str());
                if ord == std::cmp::Ordering::Less || (!inclusive && ord == std::cmp::Ordering::Equal)
                {
                    continue;
                }
            }
            if let Some((high, inclusive)) = &high_encoded {
                let ord = encoded_value.cmp(high.as_str());
                if ord == std::cmp::Ordering::Greater
                    || (!inclusive && ord == std::cmp::Ordering::Equal)
                {
                    // Keys are value-ordered, so past the high bound nothing
                    // more can match.
                    break;
                }
            }

            ids.push(keys::decode_col_index_id(&key)?);
        }
        Ok(ids)
    }

    /// Entity ids whose string value starts with `string_prefix`
    /// (`LIKE 'abc%'`).
    pub fn scan_string_prefix(
        &self,
        tenant: &str,
        schema: &str,
        column: &str,
        string_prefix: &str,
    ) -> Result<Vec<Uuid>> {
        let mut prefix = keys::col_index_prefix(tenant, schema, column, None);
        prefix.extend_from_slice(keys::escape_segment(string_prefix).as_bytes());
        let mut ids = Vec::new();
        for (key, _) in self.storage.prefix_iter(CF_COL_INDEX, &prefix)? {
            ids.push(keys::decode_col_index_id(&key)?);
        }
        Ok(ids)
    }

    /// Persisted stats for a column, if any.
    pub fn stats(&self, tenant: &str, schema: &str, column: &str) -> Result<Option<ColumnStats>> {
        let key = keys::meta_col_stats_key(tenant, schema, column);
        match self.storage.get(CF_META, &key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Rebuild stats by sampling the column's key range.
    pub fn refresh_stats(&self, tenant: &str, schema: &str, column: &str) -> Result<ColumnStats> {
        let prefix = keys::col_index_prefix(tenant, schema, column, None);
        let prefix_len = String::from_utf8_lossy(&prefix).len();

        let mut rows: u64 = 0;
        let mut distinct: u64 = 0;
        let mut last_value: Option<String> = None;
        for (key, _) in self.storage.prefix_iter(CF_COL_INDEX, &prefix)? {
            if rows as usize >= STATS_SAMPLE_CAP {
                break;
            }
            rows += 1;
            let text = String::from_utf8_lossy(&key).to_string();
            let rest = &text[prefix_len..];
            let value = rest.rsplit_once(':').map(|(v, _)| v.to_string());
            if value != last_value {
                distinct += 1;
                last_value = value;
            }
        }

        let stats = ColumnStats {
            rows,
            distinct,
            refreshed_at: chrono::Utc::now().to_rfc3339(),
        };
        self.storage.put(
            CF_META,
            &keys::meta_col_stats_key(tenant, schema, column),
            &serde_json::to_vec(&stats)?,
        )?;
        Ok(stats)
    }
}

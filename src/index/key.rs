//! Key index: O(1) lookup of an entity by its user-facing key value.
//!
//! `key:{tenant}:{schema}:{key_value}` -> entity id. Exact match is a single
//! point get; fuzzy lookup falls back to a tenant-scoped prefix scan bounded
//! by edit distance and a result cap.

use crate::storage::batch::BatchBuilder;
use crate::storage::column_families::CF_KEY_INDEX;
use crate::storage::{keys, Storage};
use crate::types::Result;
use uuid::Uuid;

/// Result cap for fuzzy scans.
const FUZZY_RESULT_CAP: usize = 25;

/// Manager for the `key_index` column family.
pub struct KeyIndex {
    storage: Storage,
}

impl KeyIndex {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Stage a key mapping.
    pub fn stage_put(
        &self,
        tenant: &str,
        schema: &str,
        key_value: &str,
        id: Uuid,
        batch: &mut BatchBuilder,
    ) {
        batch.put(
            CF_KEY_INDEX,
            keys::key_index_key(tenant, schema, key_value),
            id.as_bytes().to_vec(),
        );
    }

    /// Stage removal of a key mapping.
    pub fn stage_delete(&self, tenant: &str, schema: &str, key_value: &str, batch: &mut BatchBuilder) {
        batch.delete(CF_KEY_INDEX, keys::key_index_key(tenant, schema, key_value));
    }

    /// Exact-match lookup.
    pub fn lookup(&self, tenant: &str, schema: &str, key_value: &str) -> Result<Option<Uuid>> {
        let key = keys::key_index_key(tenant, schema, key_value);
        match self.storage.get(CF_KEY_INDEX, &key)? {
            Some(bytes) => Ok(Some(Uuid::from_slice(&bytes).map_err(|_| {
                crate::types::DatabaseError::FatalCorruption("malformed key index value".to_string())
            })?)),
            None => Ok(None),
        }
    }

    /// Fuzzy lookup: keys within `max_distance` edits, best matches first,
    /// capped.
    pub fn fuzzy_lookup(
        &self,
        tenant: &str,
        schema: &str,
        key_value: &str,
        max_distance: usize,
    ) -> Result<Vec<(String, Uuid)>> {
        let prefix = keys::key_index_prefix(tenant, schema);
        let prefix_len = String::from_utf8_lossy(&prefix).len();

        let mut matches: Vec<(usize, String, Uuid)> = Vec::new();
        for (key, value) in self.storage.prefix_iter(CF_KEY_INDEX, &prefix)? {
            let text = String::from_utf8_lossy(&key).to_string();
            let candidate = keys::unescape_segment(&text[prefix_len..]);
            if let Some(distance) = levenshtein_bounded(key_value, &candidate, max_distance) {
                if let Ok(id) = Uuid::from_slice(&value) {
                    matches.push((distance, candidate, id));
                }
            }
        }

        matches.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        matches.truncate(FUZZY_RESULT_CAP);
        Ok(matches.into_iter().map(|(_, k, id)| (k, id)).collect())
    }
}

/// Levenshtein distance with an upper bound; `None` when the bound is
/// exceeded.
fn levenshtein_bounded(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.len().abs_diff(b.len()) > max {
        return None;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        let mut row_min = current[0];
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (previous[j] + cost)
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
            row_min = row_min.min(current[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut previous, &mut current);
    }

    let distance = previous[b.len()];
    (distance <= max).then_some(distance)
}

//! Moment time index.
//!
//! Entities of the `moment` schema are additionally keyed by timestamp
//! (`mom:{tenant}:{ts_micros}:{id}` -> id) so time-range scans are a single
//! bounded cursor walk.

use crate::storage::batch::BatchBuilder;
use crate::storage::column_families::CF_MOMENTS;
use crate::storage::{keys, Storage};
use crate::types::{DatabaseError, Result};
use uuid::Uuid;

/// Manager for the `moments` column family.
pub struct MomentIndex {
    storage: Storage,
}

impl MomentIndex {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Stage the time-index entry for a moment entity.
    pub fn stage_put(&self, tenant: &str, ts_micros: u64, id: Uuid, batch: &mut BatchBuilder) {
        batch.put(
            CF_MOMENTS,
            keys::moment_key(tenant, ts_micros, id),
            id.as_bytes().to_vec(),
        );
    }

    /// Stage removal of the time-index entry.
    pub fn stage_delete(&self, tenant: &str, ts_micros: u64, id: Uuid, batch: &mut BatchBuilder) {
        batch.delete(CF_MOMENTS, keys::moment_key(tenant, ts_micros, id));
    }

    /// Entity ids with `start <= ts < end`, in time order, up to `limit`.
    pub fn range(
        &self,
        tenant: &str,
        start_micros: u64,
        end_micros: u64,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        let prefix = keys::moment_prefix(tenant);
        let start_key = keys::moment_key(tenant, start_micros, Uuid::nil());
        // The id suffix of the start key is the nil UUID, which sorts before
        // every real id at the same timestamp.
        let mut start = start_key;
        start.truncate(start.len() - Uuid::nil().to_string().len());

        let mut ids = Vec::new();
        for (key, value) in self.storage.range_iter(CF_MOMENTS, &prefix, &start)? {
            if ids.len() >= limit {
                break;
            }
            let text = String::from_utf8_lossy(&key);
            let mut parts = text.splitn(4, ':');
            let ts: u64 = match (parts.next(), parts.next(), parts.next()) {
                (Some("mom"), Some(_tenant), Some(ts)) => ts.parse().map_err(|_| {
                    DatabaseError::FatalCorruption(format!("invalid moment key: {text}"))
                })?,
                _ => {
                    return Err(DatabaseError::FatalCorruption(format!(
                        "invalid moment key: {text}"
                    )))
                }
            };
            if ts >= end_micros {
                break;
            }
            ids.push(Uuid::from_slice(&value).map_err(|_| {
                DatabaseError::FatalCorruption("malformed moment index value".to_string())
            })?);
        }
        Ok(ids)
    }
}

/// Parse an RFC3339 timestamp into epoch microseconds.
pub fn ts_micros_from_rfc3339(ts: &str) -> Result<u64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(ts)
        .map_err(|e| DatabaseError::ValidationFailed(format!("invalid timestamp '{ts}': {e}")))?;
    let micros = parsed.timestamp_micros();
    if micros < 0 {
        return Err(DatabaseError::ValidationFailed(format!(
            "timestamp before epoch: {ts}"
        )));
    }
    Ok(micros as u64)
}

//! Write-ahead log: an append-only sequence of logical writes.
//!
//! Entries live in the `wal` column family under zero-padded sequence keys,
//! serialized as canonical JSON so followers of any implementation can read
//! them. The sequence counter is persisted in `meta` and staged into the same
//! batch as the data writes each entry describes.

use crate::storage::batch::BatchBuilder;
use crate::storage::column_families::{CF_META, CF_WAL};
use crate::storage::{keys, Storage};
use crate::types::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Logical operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalOp {
    Insert,
    Update,
    Delete,
}

impl WalOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalOp::Insert => "insert",
            WalOp::Update => "update",
            WalOp::Delete => "delete",
        }
    }
}

impl std::str::FromStr for WalOp {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(WalOp::Insert),
            "update" => Ok(WalOp::Update),
            "delete" => Ok(WalOp::Delete),
            other => Err(DatabaseError::FatalCorruption(format!(
                "unknown WAL operation: {other}"
            ))),
        }
    }
}

/// One logical write.
///
/// Edge operations are carried under the reserved schema name `$edge` with
/// the edge tuple as payload; `entity_id` is then the edge source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalEntry {
    pub seq: u64,
    /// Epoch microseconds.
    pub ts: u64,
    pub tenant: String,
    pub op: WalOp,
    pub entity_id: Uuid,
    pub schema: String,
    pub payload: serde_json::Value,
    /// Whether the primary materialised a vector for this write.
    #[serde(default)]
    pub vector_materialized: bool,
}

/// The write-ahead log over one store.
pub struct WriteAheadLog {
    storage: Storage,
    /// Last allocated sequence number.
    seq: AtomicU64,
}

impl WriteAheadLog {
    /// Open the log, restoring the sequence counter from `meta`.
    pub fn new(storage: Storage) -> Result<Self> {
        let seq = match storage.get(CF_META, &keys::meta_wal_seq_key())? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => 0,
        };
        Ok(Self {
            storage,
            seq: AtomicU64::new(seq),
        })
    }

    /// Highest sequence number allocated so far.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Allocate the next sequence and stage the entry plus the counter into
    /// `batch`. Returns the completed entry for post-commit broadcast.
    pub fn stage_append(
        &self,
        tenant: &str,
        op: WalOp,
        entity_id: Uuid,
        schema: &str,
        payload: serde_json::Value,
        vector_materialized: bool,
        batch: &mut BatchBuilder,
    ) -> Result<WalEntry> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = WalEntry {
            seq,
            ts: chrono::Utc::now().timestamp_micros().max(0) as u64,
            tenant: tenant.to_string(),
            op,
            entity_id,
            schema: schema.to_string(),
            payload,
            vector_materialized,
        };
        self.stage_entry(&entry, batch)?;
        Ok(entry)
    }

    /// Stage an already-sequenced entry (follower apply path). Advances the
    /// local counter so the follower's log continues where the primary's is.
    pub fn stage_entry(&self, entry: &WalEntry, batch: &mut BatchBuilder) -> Result<()> {
        batch.put(CF_WAL, keys::wal_key(entry.seq), serde_json::to_vec(entry)?);
        batch.put(
            CF_META,
            keys::meta_wal_seq_key(),
            serde_json::to_vec(&entry.seq)?,
        );
        self.seq.fetch_max(entry.seq, Ordering::SeqCst);
        Ok(())
    }

    /// Read one entry.
    pub fn get(&self, seq: u64) -> Result<Option<WalEntry>> {
        match self.storage.get(CF_WAL, &keys::wal_key(seq))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                DatabaseError::FatalCorruption(format!("WAL entry {seq} undecodable: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Entries with `seq >= from_seq`, in order, up to `limit`.
    pub fn entries_from(&self, from_seq: u64, limit: usize) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        let start = keys::wal_key(from_seq);
        for (key, value) in self.storage.range_iter(CF_WAL, b"wal:", &start)? {
            if entries.len() >= limit {
                break;
            }
            let seq = keys::decode_wal_key(&key)?;
            let entry: WalEntry = serde_json::from_slice(&value).map_err(|e| {
                DatabaseError::FatalCorruption(format!("WAL entry {seq} undecodable: {e}"))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// The follower's durably applied sequence.
    pub fn applied_seq(&self) -> Result<u64> {
        match self.storage.get(CF_META, &keys::meta_applied_seq_key())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(0),
        }
    }

    /// Stage the applied-sequence marker into the applying batch.
    pub fn stage_applied_seq(&self, seq: u64, batch: &mut BatchBuilder) -> Result<()> {
        batch.put(
            CF_META,
            keys::meta_applied_seq_key(),
            serde_json::to_vec(&seq)?,
        );
        Ok(())
    }

    /// Compact entries that are both older than `older_than_micros` and at or
    /// below `min_keep_seq` (the slowest connected follower's ack). Returns
    /// the number of entries removed.
    pub fn compact(&self, min_keep_seq: u64, older_than_micros: u64) -> Result<usize> {
        let mut batch = BatchBuilder::new();
        let mut removed = 0;
        for (key, value) in self.storage.prefix_iter(CF_WAL, b"wal:")? {
            let seq = keys::decode_wal_key(&key)?;
            if seq > min_keep_seq {
                break;
            }
            let entry: WalEntry = serde_json::from_slice(&value).map_err(|e| {
                DatabaseError::FatalCorruption(format!("WAL entry {seq} undecodable: {e}"))
            })?;
            if entry.ts >= older_than_micros {
                break;
            }
            batch.delete(CF_WAL, key);
            removed += 1;
        }
        self.storage.commit(batch)?;
        if removed > 0 {
            tracing::info!(removed, "compacted WAL");
        }
        Ok(removed)
    }
}

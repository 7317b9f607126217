//! RocksDB wrapper.

use crate::storage::batch::{BatchBuilder, BatchOp};
use crate::storage::column_families::create_column_family_descriptors;
use crate::storage::iterator::PrefixIterator;
use crate::types::{DatabaseError, Result};
use rocksdb::{Options, SnapshotWithThreadMode, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

/// Thread-safe RocksDB storage wrapper.
///
/// Owns the store handle and exposes typed operations against the fixed
/// column-family set. All multi-key writes go through [`Storage::commit`] so
/// a partial failure leaves the store in its pre-write state.
#[derive(Clone)]
pub struct Storage {
    db: Arc<DB>,
}

impl Storage {
    /// Open (or create) the store at `path` with all column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Read-heavy workload defaults.
        opts.set_level_compaction_dynamic_level_bytes(true);
        opts.set_max_background_jobs(4);
        opts.set_bytes_per_sync(1_048_576);

        let db = DB::open_cf_descriptors(&opts, path, create_column_family_descriptors())?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| DatabaseError::FatalCorruption(format!("column family missing: {name}")))
    }

    /// Point read.
    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    /// Single put outside a batch. Index-bearing writes must use [`commit`].
    ///
    /// [`commit`]: Storage::commit
    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.put_cf(&cf, key, value)?)
    }

    /// Single delete outside a batch.
    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.delete_cf(&cf, key)?)
    }

    /// Apply a staged batch atomically across all column families it touches.
    pub fn commit(&self, batch: BatchBuilder) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut wb = WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { cf, key, value } => {
                    let handle = self.cf(cf)?;
                    wb.put_cf(&handle, key, value);
                }
                BatchOp::Delete { cf, key } => {
                    let handle = self.cf(cf)?;
                    wb.delete_cf(&handle, key);
                }
            }
        }
        Ok(self.db.write(wb)?)
    }

    /// Snapshot-consistent cursor over all keys with `prefix`.
    pub fn prefix_iter(&self, cf_name: &str, prefix: &[u8]) -> Result<PrefixIterator<'_>> {
        let cf = self.cf(cf_name)?;
        let iter = self.db.raw_iterator_cf(&cf);
        Ok(PrefixIterator::new(iter, prefix.to_vec()))
    }

    /// Cursor over keys with `prefix`, starting at `start` (>= prefix).
    pub fn range_iter(
        &self,
        cf_name: &str,
        prefix: &[u8],
        start: &[u8],
    ) -> Result<PrefixIterator<'_>> {
        let cf = self.cf(cf_name)?;
        let iter = self.db.raw_iterator_cf(&cf);
        Ok(PrefixIterator::with_start(iter, prefix.to_vec(), start))
    }

    /// Pin a point-in-time view for multi-read operations.
    pub fn snapshot(&self) -> StorageSnapshot<'_> {
        StorageSnapshot {
            storage: self,
            snapshot: self.db.snapshot(),
        }
    }
}

/// Point-in-time view over the store.
///
/// Reads through the snapshot do not observe writes that commit after it was
/// taken.
pub struct StorageSnapshot<'a> {
    storage: &'a Storage,
    snapshot: SnapshotWithThreadMode<'a, DB>,
}

impl<'a> StorageSnapshot<'a> {
    /// Point read at the pinned view.
    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.storage.cf(cf_name)?;
        Ok(self.snapshot.get_cf(&cf, key)?)
    }

    /// Prefix cursor at the pinned view.
    pub fn prefix_iter(&self, cf_name: &str, prefix: &[u8]) -> Result<PrefixIterator<'_>> {
        let cf = self.storage.cf(cf_name)?;
        let iter = self.snapshot.raw_iterator_cf(&cf);
        Ok(PrefixIterator::new(iter, prefix.to_vec()))
    }
}

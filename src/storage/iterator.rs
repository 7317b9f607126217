//! Storage iterators.

use rocksdb::{DBRawIteratorWithThreadMode, DB};

/// Cursor over all keys sharing a prefix.
///
/// RocksDB iterators pin an implicit snapshot at creation, so the cursor is
/// consistent even while writes land concurrently.
pub struct PrefixIterator<'a> {
    iter: DBRawIteratorWithThreadMode<'a, DB>,
    prefix: Vec<u8>,
}

impl<'a> PrefixIterator<'a> {
    /// Seek to the first key with `prefix`.
    pub fn new(iter: DBRawIteratorWithThreadMode<'a, DB>, prefix: Vec<u8>) -> Self {
        let start = prefix.clone();
        Self::with_start(iter, prefix, &start)
    }

    /// Seek to `start` (which must itself carry `prefix`), e.g. for range
    /// scans over the time-ordered moment keys.
    pub fn with_start(
        mut iter: DBRawIteratorWithThreadMode<'a, DB>,
        prefix: Vec<u8>,
        start: &[u8],
    ) -> Self {
        iter.seek(start);
        Self { iter, prefix }
    }
}

impl<'a> Iterator for PrefixIterator<'a> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.iter.valid() {
            return None;
        }

        let key = self.iter.key()?;
        if !key.starts_with(&self.prefix) {
            return None;
        }

        let key = key.to_vec();
        let value = self.iter.value()?.to_vec();
        self.iter.next();

        Some((key, value))
    }
}

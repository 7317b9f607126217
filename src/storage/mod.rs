//! Storage layer: RocksDB wrapper, column families, key codecs, batches.

pub mod batch;
pub mod column_families;
pub mod db;
pub mod iterator;
pub mod keys;

pub use batch::BatchBuilder;
pub use db::Storage;
pub use iterator::PrefixIterator;

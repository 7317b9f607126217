//! Index managers: one per index kind.
//!
//! Every manager stages its mutations into the caller's [`BatchBuilder`]
//! so an entity write and all of its index maintenance commit atomically.
//!
//! [`BatchBuilder`]: crate::storage::BatchBuilder

pub mod columns;
pub mod hnsw;
pub mod inverted;
pub mod key;
pub mod moments;
pub mod vectors;

pub use columns::{ColumnIndex, ColumnStats};
pub use hnsw::{HnswIndex, HnswParams};
pub use inverted::InvertedIndex;
pub use key::KeyIndex;
pub use moments::MomentIndex;
pub use vectors::{VectorIndexManager, VectorRecord};

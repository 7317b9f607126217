//! Column family constants and setup for RocksDB.
//!
//! Each column family serves exactly one access pattern; keys are laid out
//! so that pattern is a point get or a single prefix scan.

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Main entity storage: `ent:{tenant}:{id}` -> Entity JSON
pub const CF_ENTITIES: &str = "entities";

/// Schema registry persistence: `sch:{tenant}:{short_name}` -> Schema JSON
pub const CF_SCHEMAS: &str = "schemas";

/// Forward graph edges: `eo:{tenant}:{src}:{type}:{dst}` -> EdgeValue
pub const CF_EDGES_OUT: &str = "edges_out";

/// Reverse graph edges: `ei:{tenant}:{dst}:{type}:{src}` -> EdgeValue
pub const CF_EDGES_IN: &str = "edges_in";

/// Key-field lookup: `key:{tenant}:{schema}:{key_value}` -> entity id
pub const CF_KEY_INDEX: &str = "key_index";

/// Secondary column index: `col:{tenant}:{schema}:{column}:{value}:{id}` -> ()
pub const CF_COL_INDEX: &str = "col_index";

/// BM25 postings: `inv:{tenant}:{schema}:{term}:{id}` -> term frequency
pub const CF_INVERTED: &str = "inverted";

/// Vector records: `vec:{tenant}:{schema}:{id}` -> packed f32[] + text hash
pub const CF_VECTORS: &str = "vectors";

/// HNSW adjacency: `hnsw:{tenant}:{schema}:{layer}:{id}` -> neighbor list
pub const CF_HNSW: &str = "hnsw_graph";

/// Moment time index: `mom:{tenant}:{ts_micros}:{id}` -> entity id
pub const CF_MOMENTS: &str = "moments";

/// Write-ahead log: `wal:{seq}` -> WalEntry JSON
pub const CF_WAL: &str = "wal";

/// Engine bookkeeping: sequence counters, HNSW entry points, column stats
pub const CF_META: &str = "meta";

/// All column family names, in creation order.
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        CF_ENTITIES,
        CF_SCHEMAS,
        CF_EDGES_OUT,
        CF_EDGES_IN,
        CF_KEY_INDEX,
        CF_COL_INDEX,
        CF_INVERTED,
        CF_VECTORS,
        CF_HNSW,
        CF_MOMENTS,
        CF_WAL,
        CF_META,
    ]
}

/// Create column family descriptors with per-CF tuning.
pub fn create_column_family_descriptors() -> Vec<ColumnFamilyDescriptor> {
    all_column_families()
        .into_iter()
        .map(|name| {
            let opts = match name {
                CF_VECTORS | CF_HNSW => vector_cf_options(),
                CF_KEY_INDEX | CF_COL_INDEX | CF_INVERTED | CF_MOMENTS => index_cf_options(),
                _ => Options::default(),
            };
            ColumnFamilyDescriptor::new(name, opts)
        })
        .collect()
}

/// Options for binary vector storage: no compression, larger blocks.
fn vector_cf_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::None);
    opts
}

/// Options for scan-heavy index CFs.
fn index_cf_options() -> Options {
    let mut opts = Options::default();
    opts.set_level_compaction_dynamic_level_bytes(true);
    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_column_families_listed() {
        let cfs = all_column_families();
        assert_eq!(cfs.len(), 12);
        assert!(cfs.contains(&CF_ENTITIES));
        assert!(cfs.contains(&CF_WAL));
        assert!(cfs.contains(&CF_META));
    }

    #[test]
    fn test_descriptor_count_matches() {
        assert_eq!(
            create_column_family_descriptors().len(),
            all_column_families().len()
        );
    }
}

//! Key encoding and decoding for all column families.
//!
//! Every key starts with a short CF tag and the tenant, so a tenant's data is
//! one contiguous key range per CF. Integer components are zero-padded to a
//! fixed width so lexicographic order equals numeric order. Variable string
//! segments are escaped so user values cannot forge segment boundaries.

use crate::types::{DatabaseError, Result};
use uuid::Uuid;

/// Width of zero-padded WAL sequence numbers.
pub const WAL_SEQ_WIDTH: usize = 20;

/// Width of zero-padded moment timestamps (microseconds).
pub const MOMENT_TS_WIDTH: usize = 16;

/// Escape a variable key segment: `%` -> `%25`, `:` -> `%3a`.
pub fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace(':', "%3a")
}

/// Reverse of [`escape_segment`].
pub fn unescape_segment(segment: &str) -> String {
    segment.replace("%3a", ":").replace("%25", "%")
}

/// `ent:{tenant}:{id}`
pub fn entity_key(tenant: &str, id: Uuid) -> Vec<u8> {
    format!("ent:{}:{}", escape_segment(tenant), id).into_bytes()
}

/// Prefix covering every entity of a tenant.
pub fn entity_prefix(tenant: &str) -> Vec<u8> {
    format!("ent:{}:", escape_segment(tenant)).into_bytes()
}

/// Decode `(tenant, id)` from an entity key.
pub fn decode_entity_key(key: &[u8]) -> Result<(String, Uuid)> {
    let text = std::str::from_utf8(key)
        .map_err(|_| DatabaseError::InternalError("non-utf8 entity key".to_string()))?;
    let mut parts = text.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("ent"), Some(tenant), Some(id)) => {
            Ok((unescape_segment(tenant), Uuid::parse_str(id)?))
        }
        _ => Err(DatabaseError::InternalError(format!(
            "invalid entity key: {text}"
        ))),
    }
}

/// `sch:{tenant}:{short_name}`
pub fn schema_key(tenant: &str, short_name: &str) -> Vec<u8> {
    format!(
        "sch:{}:{}",
        escape_segment(tenant),
        escape_segment(short_name)
    )
    .into_bytes()
}

/// Prefix covering every schema of a tenant.
pub fn schema_prefix(tenant: &str) -> Vec<u8> {
    format!("sch:{}:", escape_segment(tenant)).into_bytes()
}

/// `eo:{tenant}:{src}:{edge_type}:{dst}`
pub fn edge_out_key(tenant: &str, src: Uuid, edge_type: &str, dst: Uuid) -> Vec<u8> {
    format!(
        "eo:{}:{}:{}:{}",
        escape_segment(tenant),
        src,
        escape_segment(edge_type),
        dst
    )
    .into_bytes()
}

/// `ei:{tenant}:{dst}:{edge_type}:{src}`
pub fn edge_in_key(tenant: &str, dst: Uuid, edge_type: &str, src: Uuid) -> Vec<u8> {
    format!(
        "ei:{}:{}:{}:{}",
        escape_segment(tenant),
        dst,
        escape_segment(edge_type),
        src
    )
    .into_bytes()
}

/// Prefix for all outgoing edges of `src`, optionally narrowed by type.
pub fn edge_out_prefix(tenant: &str, src: Uuid, edge_type: Option<&str>) -> Vec<u8> {
    match edge_type {
        Some(t) => format!("eo:{}:{}:{}:", escape_segment(tenant), src, escape_segment(t)),
        None => format!("eo:{}:{}:", escape_segment(tenant), src),
    }
    .into_bytes()
}

/// Prefix for all incoming edges of `dst`, optionally narrowed by type.
pub fn edge_in_prefix(tenant: &str, dst: Uuid, edge_type: Option<&str>) -> Vec<u8> {
    match edge_type {
        Some(t) => format!("ei:{}:{}:{}:", escape_segment(tenant), dst, escape_segment(t)),
        None => format!("ei:{}:{}:", escape_segment(tenant), dst),
    }
    .into_bytes()
}

/// Decode `(entity_at_prefix, edge_type, entity_at_tail)` from an edge key.
///
/// For `edges_out` keys the prefix entity is the source; for `edges_in` it is
/// the destination.
pub fn decode_edge_key(key: &[u8]) -> Result<(String, Uuid, String, Uuid)> {
    let text = std::str::from_utf8(key)
        .map_err(|_| DatabaseError::InternalError("non-utf8 edge key".to_string()))?;
    let mut parts = text.splitn(5, ':');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some("eo") | Some("ei"), Some(tenant), Some(a), Some(edge_type), Some(b)) => Ok((
            unescape_segment(tenant),
            Uuid::parse_str(a)?,
            unescape_segment(edge_type),
            Uuid::parse_str(b)?,
        )),
        _ => Err(DatabaseError::InternalError(format!(
            "invalid edge key: {text}"
        ))),
    }
}

/// `key:{tenant}:{schema}:{key_value}`
pub fn key_index_key(tenant: &str, schema: &str, key_value: &str) -> Vec<u8> {
    format!(
        "key:{}:{}:{}",
        escape_segment(tenant),
        escape_segment(schema),
        escape_segment(key_value)
    )
    .into_bytes()
}

/// Prefix covering every key-index entry of a schema.
pub fn key_index_prefix(tenant: &str, schema: &str) -> Vec<u8> {
    format!(
        "key:{}:{}:",
        escape_segment(tenant),
        escape_segment(schema)
    )
    .into_bytes()
}

/// `col:{tenant}:{schema}:{column}:{encoded_value}:{id}`
pub fn col_index_key(
    tenant: &str,
    schema: &str,
    column: &str,
    encoded_value: &str,
    id: Uuid,
) -> Vec<u8> {
    format!(
        "col:{}:{}:{}:{}:{}",
        escape_segment(tenant),
        escape_segment(schema),
        escape_segment(column),
        encoded_value,
        id
    )
    .into_bytes()
}

/// Prefix for one column of a schema, optionally narrowed to one value.
pub fn col_index_prefix(
    tenant: &str,
    schema: &str,
    column: &str,
    encoded_value: Option<&str>,
) -> Vec<u8> {
    match encoded_value {
        Some(v) => format!(
            "col:{}:{}:{}:{}:",
            escape_segment(tenant),
            escape_segment(schema),
            escape_segment(column),
            v
        ),
        None => format!(
            "col:{}:{}:{}:",
            escape_segment(tenant),
            escape_segment(schema),
            escape_segment(column)
        ),
    }
    .into_bytes()
}

/// Extract the trailing entity id from a `col_index` key.
pub fn decode_col_index_id(key: &[u8]) -> Result<Uuid> {
    let text = std::str::from_utf8(key)
        .map_err(|_| DatabaseError::InternalError("non-utf8 col index key".to_string()))?;
    let id = text
        .rsplit(':')
        .next()
        .ok_or_else(|| DatabaseError::InternalError(format!("invalid col index key: {text}")))?;
    Ok(Uuid::parse_str(id)?)
}

/// `inv:{tenant}:{schema}:{term}:{id}`
pub fn inverted_key(tenant: &str, schema: &str, term: &str, id: Uuid) -> Vec<u8> {
    format!(
        "inv:{}:{}:{}:{}",
        escape_segment(tenant),
        escape_segment(schema),
        escape_segment(term),
        id
    )
    .into_bytes()
}

/// Prefix over one term's postings.
pub fn inverted_prefix(tenant: &str, schema: &str, term: &str) -> Vec<u8> {
    format!(
        "inv:{}:{}:{}:",
        escape_segment(tenant),
        escape_segment(schema),
        escape_segment(term)
    )
    .into_bytes()
}

/// `vec:{tenant}:{schema}:{id}`
pub fn vector_key(tenant: &str, schema: &str, id: Uuid) -> Vec<u8> {
    format!(
        "vec:{}:{}:{}",
        escape_segment(tenant),
        escape_segment(schema),
        id
    )
    .into_bytes()
}

/// Prefix covering every vector record of a schema.
pub fn vector_prefix(tenant: &str, schema: &str) -> Vec<u8> {
    format!(
        "vec:{}:{}:",
        escape_segment(tenant),
        escape_segment(schema)
    )
    .into_bytes()
}

/// `hnsw:{tenant}:{schema}:node:{id}` - per-node state record
pub fn hnsw_node_key(tenant: &str, schema: &str, id: Uuid) -> Vec<u8> {
    format!(
        "hnsw:{}:{}:node:{}",
        escape_segment(tenant),
        escape_segment(schema),
        id
    )
    .into_bytes()
}

/// `hnsw:{tenant}:{schema}:{layer:02}:{id}` - adjacency list at one layer
pub fn hnsw_adjacency_key(tenant: &str, schema: &str, layer: u8, id: Uuid) -> Vec<u8> {
    format!(
        "hnsw:{}:{}:{:02}:{}",
        escape_segment(tenant),
        escape_segment(schema),
        layer,
        id
    )
    .into_bytes()
}

/// Prefix covering the whole HNSW graph of a schema.
pub fn hnsw_prefix(tenant: &str, schema: &str) -> Vec<u8> {
    format!(
        "hnsw:{}:{}:",
        escape_segment(tenant),
        escape_segment(schema)
    )
    .into_bytes()
}

/// `mom:{tenant}:{ts_micros:016}:{id}`
pub fn moment_key(tenant: &str, ts_micros: u64, id: Uuid) -> Vec<u8> {
    format!(
        "mom:{}:{:0width$}:{}",
        escape_segment(tenant),
        ts_micros,
        id,
        width = MOMENT_TS_WIDTH
    )
    .into_bytes()
}

/// Prefix covering every moment of a tenant.
pub fn moment_prefix(tenant: &str) -> Vec<u8> {
    format!("mom:{}:", escape_segment(tenant)).into_bytes()
}

/// `wal:{seq:020}`
pub fn wal_key(seq: u64) -> Vec<u8> {
    format!("wal:{:0width$}", seq, width = WAL_SEQ_WIDTH).into_bytes()
}

/// Decode the sequence number from a WAL key.
pub fn decode_wal_key(key: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(key)
        .map_err(|_| DatabaseError::FatalCorruption("non-utf8 WAL key".to_string()))?;
    text.strip_prefix("wal:")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DatabaseError::FatalCorruption(format!("invalid WAL key: {text}")))
}

// --- meta CF bookkeeping keys ---

pub fn meta_wal_seq_key() -> Vec<u8> {
    b"meta:wal_seq".to_vec()
}

pub fn meta_applied_seq_key() -> Vec<u8> {
    b"meta:applied_seq".to_vec()
}

pub fn meta_hnsw_entry_key(tenant: &str, schema: &str) -> Vec<u8> {
    format!(
        "meta:hnsw_entry:{}:{}",
        escape_segment(tenant),
        escape_segment(schema)
    )
    .into_bytes()
}

pub fn meta_hnsw_params_key(tenant: &str, schema: &str) -> Vec<u8> {
    format!(
        "meta:hnsw_params:{}:{}",
        escape_segment(tenant),
        escape_segment(schema)
    )
    .into_bytes()
}

pub fn meta_col_stats_key(tenant: &str, schema: &str, column: &str) -> Vec<u8> {
    format!(
        "meta:colstats:{}:{}:{}",
        escape_segment(tenant),
        escape_segment(schema),
        escape_segment(column)
    )
    .into_bytes()
}

pub fn meta_doc_freq_key(tenant: &str, schema: &str, term: &str) -> Vec<u8> {
    format!(
        "meta:df:{}:{}:{}",
        escape_segment(tenant),
        escape_segment(schema),
        escape_segment(term)
    )
    .into_bytes()
}

pub fn meta_doc_count_key(tenant: &str, schema: &str) -> Vec<u8> {
    format!(
        "meta:doc_count:{}:{}",
        escape_segment(tenant),
        escape_segment(schema)
    )
    .into_bytes()
}

/// Derive a deterministic entity id.
///
/// UUIDv5 over `{tenant}:{schema}:{key_value}` so re-inserting the same key
/// always lands on the same entity.
pub fn deterministic_uuid(tenant: &str, schema: &str, key_value: &str) -> Uuid {
    let name = format!("{tenant}:{schema}:{key_value}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Encode a JSON scalar so lexicographic byte order equals natural order.
///
/// Numbers map to the IEEE-754 bit pattern with the sign bit flipped
/// (negatives fully complemented) rendered as 16 hex digits; booleans to a
/// single byte; strings are escaped as key segments.
pub fn encode_sortable_value(value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::Null => Ok("\u{0}null".to_string()),
        serde_json::Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        serde_json::Value::Number(n) => {
            let f = n
                .as_f64()
                .ok_or_else(|| DatabaseError::BadQuery(format!("unrepresentable number: {n}")))?;
            let bits = f.to_bits();
            let ordered = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
            Ok(format!("{ordered:016x}"))
        }
        serde_json::Value::String(s) => Ok(escape_segment(s)),
        other => Err(DatabaseError::ValidationFailed(format!(
            "cannot index non-scalar value: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_key_roundtrip() {
        let id = Uuid::new_v4();
        let key = entity_key("acme:inc", id);
        let (tenant, decoded) = decode_entity_key(&key).unwrap();
        assert_eq!(tenant, "acme:inc");
        assert_eq!(decoded, id);
    }

    #[test]
    fn test_escaping_prevents_segment_forgery() {
        // A tenant containing ':' must not collide with another tenant's range.
        let forged = entity_prefix("a:b");
        let honest = entity_prefix("a");
        assert!(!forged.starts_with(&honest));
    }

    #[test]
    fn test_wal_key_ordering() {
        let a = wal_key(9);
        let b = wal_key(10);
        let c = wal_key(100);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(decode_wal_key(&c).unwrap(), 100);
    }

    #[test]
    fn test_moment_key_ordering() {
        let id = Uuid::new_v4();
        assert!(moment_key("t", 999, id) < moment_key("t", 1_000, id));
    }

    #[test]
    fn test_deterministic_uuid_stability() {
        let a = deterministic_uuid("t1", "article", "hello");
        let b = deterministic_uuid("t1", "article", "hello");
        let c = deterministic_uuid("t2", "article", "hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn test_sortable_numbers() {
        let vals = [-1000.5, -1.0, -0.25, 0.0, 0.25, 1.0, 1000.5];
        let encoded: Vec<String> = vals
            .iter()
            .map(|v| encode_sortable_value(&json!(v)).unwrap())
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn test_sortable_integers_match_floats() {
        // Integers index identically whether the JSON carried 3 or 3.0.
        assert_eq!(
            encode_sortable_value(&json!(3)).unwrap(),
            encode_sortable_value(&json!(3.0)).unwrap()
        );
    }

    #[test]
    fn test_sortable_rejects_objects() {
        assert!(encode_sortable_value(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_edge_key_roundtrip() {
        let src = Uuid::new_v4();
        let dst = Uuid::new_v4();
        let key = edge_out_key("t1", src, "cites", dst);
        let (tenant, a, edge_type, b) = decode_edge_key(&key).unwrap();
        assert_eq!(tenant, "t1");
        assert_eq!(a, src);
        assert_eq!(edge_type, "cites");
        assert_eq!(b, dst);
    }
}

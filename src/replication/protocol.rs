//! Conversions between domain WAL entries and the wire protocol.

use crate::replication::pb;
use crate::replication::wal::{WalEntry, WalOp};
use crate::types::{DatabaseError, Result};
use uuid::Uuid;

/// Domain entry -> wire message.
pub fn to_proto(entry: &WalEntry) -> Result<pb::WalEntry> {
    Ok(pb::WalEntry {
        sequence: entry.seq,
        timestamp_micros: entry.ts,
        operation: entry.op.as_str().to_string(),
        tenant: entry.tenant.clone(),
        entity_id: entry.entity_id.as_bytes().to_vec(),
        schema_short_name: entry.schema.clone(),
        payload_json: serde_json::to_string(&entry.payload)?,
        vector_materialized: entry.vector_materialized,
    })
}

/// Wire message -> domain entry.
pub fn from_proto(message: pb::WalEntry) -> Result<WalEntry> {
    let entity_id = Uuid::from_slice(&message.entity_id)
        .map_err(|_| DatabaseError::ReplicationError("entity_id must be 16 bytes".to_string()))?;
    Ok(WalEntry {
        seq: message.sequence,
        ts: message.timestamp_micros,
        tenant: message.tenant,
        op: message.operation.parse::<WalOp>().map_err(|_| {
            DatabaseError::ReplicationError(format!("unknown operation: {}", message.operation))
        })?,
        entity_id,
        schema: message.schema_short_name,
        payload: serde_json::from_str(&message.payload_json).map_err(|e| {
            DatabaseError::ReplicationError(format!("undecodable payload: {e}"))
        })?,
        vector_materialized: message.vector_materialized,
    })
}

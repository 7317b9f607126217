//! Write-ahead log and primary/follower replication over gRPC streaming.

pub mod primary;
pub mod protocol;
pub mod replica;
pub mod sync;
pub mod wal;

pub use primary::ReplicationServer;
pub use replica::{ReplicaNode, ReplicaStatus};
pub use sync::{Backoff, SyncState};
pub use wal::{WalEntry, WalOp, WriteAheadLog};

/// Generated protobuf/tonic types.
pub mod pb {
    tonic::include_proto!("remdb.replication");
}

//! Primary-side replication: serves the WAL stream to followers.
//!
//! Each follower gets historical catch-up from its requested sequence, then a
//! live tail fed by the write pipeline's broadcast channel. A bounded send
//! buffer applies backpressure; a follower that falls behind the broadcast
//! buffer is disconnected rather than stalling the primary.

use crate::replication::pb;
use crate::replication::protocol;
use crate::replication::wal::{WalEntry, WriteAheadLog};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

/// Entries buffered per follower before it is considered too slow.
pub const FOLLOWER_BUFFER: usize = 100;

/// Batch size for historical catch-up reads.
const CATCHUP_BATCH: usize = 500;

/// Shared follower bookkeeping: replica id -> acknowledged sequence.
type FollowerMap = Arc<Mutex<HashMap<String, u64>>>;

/// gRPC replication service for a primary node.
pub struct ReplicationServer {
    wal: Arc<WriteAheadLog>,
    live: broadcast::Sender<WalEntry>,
    followers: FollowerMap,
}

impl ReplicationServer {
    pub fn new(wal: Arc<WriteAheadLog>, live: broadcast::Sender<WalEntry>) -> Self {
        Self {
            wal,
            live,
            followers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of connected followers.
    pub fn replica_count(&self) -> usize {
        self.followers.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Lowest acknowledged sequence across connected followers, if any.
    ///
    /// The WAL retention horizon never passes this point.
    pub fn min_acked_seq(&self) -> Option<u64> {
        self.followers
            .lock()
            .ok()
            .and_then(|m| m.values().min().copied())
    }

    /// Serve on a TCP address. Blocks until shutdown.
    pub async fn serve(self, addr: std::net::SocketAddr) -> crate::types::Result<()> {
        tracing::info!(%addr, "replication server listening");
        tonic::transport::Server::builder()
            .add_service(pb::replication_service_server::ReplicationServiceServer::new(self))
            .serve(addr)
            .await
            .map_err(|e| {
                crate::types::DatabaseError::ReplicationError(format!("server failed: {e}"))
            })
    }

    /// Serve on an already-bound listener (loopback tests).
    pub async fn serve_with_incoming(
        self,
        listener: tokio::net::TcpListener,
    ) -> crate::types::Result<()> {
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        tonic::transport::Server::builder()
            .add_service(pb::replication_service_server::ReplicationServiceServer::new(self))
            .serve_with_incoming(incoming)
            .await
            .map_err(|e| {
                crate::types::DatabaseError::ReplicationError(format!("server failed: {e}"))
            })
    }
}

#[tonic::async_trait]
impl pb::replication_service_server::ReplicationService for ReplicationServer {
    type SubscribeStream =
        Pin<Box<dyn Stream<Item = std::result::Result<pb::WalEntry, Status>> + Send + 'static>>;

    async fn subscribe(
        &self,
        request: Request<Streaming<pb::SubscribeRequest>>,
    ) -> std::result::Result<Response<Self::SubscribeStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .next()
            .await
            .ok_or_else(|| Status::invalid_argument("missing subscribe request"))?
            .map_err(|e| Status::invalid_argument(format!("bad subscribe request: {e}")))?;

        let replica_id = if first.replica_id.is_empty() {
            format!("replica-{}", uuid::Uuid::new_v4())
        } else {
            first.replica_id.clone()
        };
        let from_seq = first.from_seq;

        tracing::info!(replica = %replica_id, from_seq, "follower subscribed");

        if let Ok(mut followers) = self.followers.lock() {
            followers.insert(replica_id.clone(), first.ack_seq);
        }

        let (tx, rx) = mpsc::channel::<std::result::Result<pb::WalEntry, Status>>(FOLLOWER_BUFFER);
        let wal = Arc::clone(&self.wal);
        // Subscribe before catch-up so no entry falls between the historical
        // scan and the live tail.
        let mut live = self.live.subscribe();
        let followers = Arc::clone(&self.followers);

        // Ack reader: later requests on the inbound stream carry the
        // follower's durably applied sequence.
        let ack_followers = Arc::clone(&self.followers);
        let ack_replica = replica_id.clone();
        tokio::spawn(async move {
            while let Some(Ok(message)) = inbound.next().await {
                if let Ok(mut followers) = ack_followers.lock() {
                    followers.insert(ack_replica.clone(), message.ack_seq);
                }
            }
        });

        tokio::spawn(async move {
            let result: std::result::Result<(), Status> = async {
                // Historical catch-up.
                let mut cursor = from_seq.max(1);
                loop {
                    let entries = wal
                        .entries_from(cursor, CATCHUP_BATCH)
                        .map_err(|e| Status::internal(format!("WAL read: {e}")))?;
                    if entries.is_empty() {
                        break;
                    }
                    for entry in &entries {
                        cursor = entry.seq + 1;
                        let message = protocol::to_proto(entry)
                            .map_err(|e| Status::internal(format!("encode: {e}")))?;
                        tx.send(Ok(message))
                            .await
                            .map_err(|_| Status::cancelled("follower went away"))?;
                    }
                }

                // Live tail.
                loop {
                    match live.recv().await {
                        Ok(entry) => {
                            if entry.seq < cursor {
                                continue; // Already sent during catch-up.
                            }
                            cursor = entry.seq + 1;
                            let message = protocol::to_proto(&entry)
                                .map_err(|e| Status::internal(format!("encode: {e}")))?;
                            tx.send(Ok(message))
                                .await
                                .map_err(|_| Status::cancelled("follower went away"))?;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            return Err(Status::resource_exhausted(format!(
                                "follower too slow, missed {missed} entries"
                            )));
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(Status::unavailable("primary shutting down"));
                        }
                    }
                }
            }
            .await;

            if let Err(status) = result {
                tracing::warn!(replica = %replica_id, %status, "follower stream closed");
                let _ = tx.send(Err(status)).await;
            }
            if let Ok(mut followers) = followers.lock() {
                followers.remove(&replica_id);
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_status(
        &self,
        _request: Request<pb::StatusRequest>,
    ) -> std::result::Result<Response<pb::StatusResponse>, Status> {
        Ok(Response::new(pb::StatusResponse {
            current_sequence: self.wal.current_seq(),
            replica_count: self.replica_count() as u32,
        }))
    }
}

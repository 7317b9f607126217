//! Follower-side replication: connects to a primary, applies the WAL stream.

use crate::replication::pb;
use crate::replication::protocol;
use crate::replication::sync::{Backoff, SyncState};
use crate::replication::wal::WriteAheadLog;
use crate::types::{DatabaseError, Result};
use crate::write::WritePipeline;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio_stream::StreamExt;
use tonic::transport::Channel;

/// How many applied entries between acknowledgements to the primary.
const ACK_EVERY: u64 = 50;

/// Follower replication status.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub connected: bool,
    pub state: SyncState,
    pub local_seq: u64,
    pub primary_seq: u64,
    pub lag: u64,
}

/// A follower node: streams the primary's WAL and applies each entry through
/// the local write pipeline.
pub struct ReplicaNode {
    pipeline: Arc<WritePipeline>,
    wal: Arc<WriteAheadLog>,
    primary_addr: String,
    replica_id: String,
    state: Arc<RwLock<SyncState>>,
    primary_seq: Arc<AtomicU64>,
}

impl ReplicaNode {
    pub fn new(
        pipeline: Arc<WritePipeline>,
        wal: Arc<WriteAheadLog>,
        primary_addr: String,
        replica_id: String,
    ) -> Self {
        Self {
            pipeline,
            wal,
            primary_addr,
            replica_id,
            state: Arc::new(RwLock::new(SyncState::Disconnected)),
            primary_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn set_state(&self, state: SyncState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = state;
        }
    }

    /// Current replication status.
    pub fn status(&self) -> ReplicaStatus {
        let state = self
            .state
            .read()
            .map(|s| s.clone())
            .unwrap_or(SyncState::Disconnected);
        let local_seq = self.wal.applied_seq().unwrap_or(0);
        let primary_seq = self.primary_seq.load(Ordering::SeqCst);
        ReplicaStatus {
            connected: state.is_connected(),
            state,
            local_seq,
            primary_seq,
            lag: primary_seq.saturating_sub(local_seq),
        }
    }

    /// Follow the primary. Blocks; reconnects with exponential backoff and
    /// returns a hard error once retries are exhausted.
    pub async fn follow(&self) -> Result<()> {
        let mut backoff = Backoff::default();

        loop {
            match self.follow_once().await {
                Ok(()) => {
                    // Clean stream end (primary shut down); retry from the
                    // top of the schedule.
                    backoff.reset();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "replication stream failed");
                }
            }
            self.set_state(SyncState::Disconnected);

            match backoff.next_delay() {
                Some(delay) => {
                    tracing::info!(
                        attempt = backoff.attempts(),
                        delay_secs = delay.as_secs(),
                        "reconnecting to primary"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    let reason = format!(
                        "gave up connecting to {} after {} attempts",
                        self.primary_addr,
                        backoff.attempts()
                    );
                    self.set_state(SyncState::Error {
                        reason: reason.clone(),
                    });
                    return Err(DatabaseError::ReplicationError(reason));
                }
            }
        }
    }

    /// One connect-subscribe-apply cycle. Returns `Ok(())` on clean stream
    /// end, `Err` on transport or apply failure.
    pub async fn follow_once(&self) -> Result<()> {
        self.set_state(SyncState::Connecting);

        let channel = Channel::from_shared(self.primary_addr.clone())
            .map_err(|e| DatabaseError::ReplicationError(format!("bad primary address: {e}")))?
            .connect()
            .await
            .map_err(|e| DatabaseError::ReplicationError(format!("connect failed: {e}")))?;

        let mut client = pb::replication_service_client::ReplicationServiceClient::new(channel);

        // Learn the primary's position for lag reporting.
        if let Ok(response) = client.get_status(pb::StatusRequest {}).await {
            self.primary_seq
                .store(response.into_inner().current_sequence, Ordering::SeqCst);
        }

        let applied = self.wal.applied_seq()?;
        let from_seq = applied + 1;
        self.set_state(SyncState::Syncing { from_seq });

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tx.send(pb::SubscribeRequest {
            from_seq,
            replica_id: self.replica_id.clone(),
            ack_seq: applied,
        })
        .await
        .map_err(|e| DatabaseError::ReplicationError(format!("send failed: {e}")))?;

        let outbound = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut stream = client
            .subscribe(outbound)
            .await
            .map_err(|e| DatabaseError::ReplicationError(format!("subscribe failed: {e}")))?
            .into_inner();

        let mut applied_since_ack = 0u64;
        while let Some(message) = stream.next().await {
            let message =
                message.map_err(|e| DatabaseError::ReplicationError(format!("stream error: {e}")))?;
            let entry = protocol::from_proto(message)?;
            let seq = entry.seq;

            self.pipeline.apply_wal_entry(entry)?;
            self.primary_seq.fetch_max(seq, Ordering::SeqCst);
            self.set_state(SyncState::Streaming);

            applied_since_ack += 1;
            if applied_since_ack >= ACK_EVERY {
                applied_since_ack = 0;
                // Ack so the primary can advance its retention horizon.
                let _ = tx
                    .send(pb::SubscribeRequest {
                        from_seq: 0,
                        replica_id: self.replica_id.clone(),
                        ack_seq: seq,
                    })
                    .await;
            }
        }

        Ok(())
    }
}

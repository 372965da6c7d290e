//! Replication state tracking
//!
//! Holds the replication identity and byte offsets for both roles. On
//! the leader, `offset` is the number of propagated stream bytes and
//! `replicas` the registered follower connections; on a follower,
//! `offset` counts the replication stream bytes consumed so far and
//! `replid` is learned from the leader's FULLRESYNC line.

use std::sync::Arc;

use rand::Rng;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// A registered replica connection, leader-side view.
#[derive(Debug, Clone)]
pub struct Replica {
    /// Connection ID of the client that sent PSYNC.
    pub conn_id: u64,
    /// Write half of the replica connection, shared with the
    /// connection task that keeps reading acknowledgements.
    pub writer: Arc<Mutex<OwnedWriteHalf>>,
    /// Bytes this leader has written to the replica.
    pub offset: u64,
}

/// Mutable replication state, guarded by one mutex in the context.
#[derive(Debug)]
pub struct ReplicationState {
    pub replid: String,
    pub offset: u64,
    pub replicas: Vec<Replica>,
}

impl ReplicationState {
    /// Fresh state with a 40-hex-char replication ID chosen for this
    /// process lifetime.
    pub fn new() -> Self {
        Self {
            replid: generate_replid(),
            offset: 0,
            replicas: Vec::new(),
        }
    }

    /// Register a replica connection at offset zero.
    pub fn register(&mut self, conn_id: u64, writer: Arc<Mutex<OwnedWriteHalf>>) {
        self.replicas.push(Replica {
            conn_id,
            writer,
            offset: 0,
        });
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Advance the propagated-stream offset.
    pub fn advance_offset(&mut self, bytes: u64) {
        self.offset += bytes;
    }

    /// Credit `bytes` written to the replica registered for `conn_id`.
    pub fn credit_replica(&mut self, conn_id: u64, bytes: u64) {
        if let Some(replica) = self.replicas.iter_mut().find(|r| r.conn_id == conn_id) {
            replica.offset += bytes;
        }
    }
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new()
    }
}

// 40 lowercase hex characters, matching the advertised replid format.
fn generate_replid() -> String {
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).expect("digit below 16"))
        .collect()
}

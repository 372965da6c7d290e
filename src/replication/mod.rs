//! Leader/follower replication
//!
//! The leader registers replica connections on PSYNC, feeds them a
//! full-resync snapshot, forwards every accepted write verbatim, and
//! answers WAIT by fanning out acknowledgement probes. The follower
//! performs the startup handshake, ingests the snapshot, and applies
//! the propagated command stream with replies suppressed.

pub mod follower;
pub mod leader;
pub mod state;

pub use state::{Replica, ReplicationState};

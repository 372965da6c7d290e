//! Server configuration
//!
//! Translates the command-line flags into a validated `ServerConfig`
//! and decides whether this process runs as the leader or as a
//! follower of another instance.

use std::path::PathBuf;

use crate::errors::{ServerError, ServerResult};

/// Replication role of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower { host: String, port: u16 },
}

/// Process-wide configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub role: Role,
    pub port: u16,
    pub dir: String,
    pub dbfilename: String,
}

impl ServerConfig {
    /// Build a configuration from raw flag values.
    ///
    /// `replicaof` is the literal `master` for a leader; anything else
    /// must be `"<host> <port>"` designating the leader to follow.
    pub fn new(
        dir: String,
        dbfilename: String,
        port: u16,
        replicaof: &str,
    ) -> ServerResult<Self> {
        if dir.trim().is_empty() {
            return Err(ServerError::config("Snapshot directory cannot be empty"));
        }
        if dbfilename.trim().is_empty() {
            return Err(ServerError::config("Snapshot filename cannot be empty"));
        }

        let role = if replicaof == "master" {
            Role::Leader
        } else {
            let mut parts = replicaof.split_whitespace();
            let (Some(host), Some(leader_port), None) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(ServerError::config(
                    "--replicaof must be 'master' or '<host> <port>'",
                ));
            };
            let leader_port: u16 = leader_port.parse().map_err(|_| {
                ServerError::config("--replicaof port is not a valid port number")
            })?;
            Role::Follower {
                host: host.to_string(),
                port: leader_port,
            }
        };

        Ok(Self {
            role,
            port,
            dir,
            dbfilename,
        })
    }

    /// Full path of the snapshot file read at startup.
    pub fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.dir).join(&self.dbfilename)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self.role, Role::Follower { .. })
    }
}

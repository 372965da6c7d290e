//! Redis-compatible in-memory data server
//!
//! A TCP server speaking the RESP protocol: keyed string store with
//! per-key expiry, streams with blocking reads, per-connection
//! transactions, and leader/follower replication with byte-accurate
//! offset tracking. A previously persisted snapshot file is decoded at
//! startup.

mod buffer;
mod command;
mod config;
mod errors;
mod replication;
mod resp;
mod server;
mod snapshot;
mod store;
mod stream;
mod transaction;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::ServerConfig;
use crate::server::ServerContext;

#[derive(Parser, Debug)]
#[command(
    name = "redlite",
    about = "Redis-compatible in-memory data server with replication",
    version
)]
struct Args {
    /// Directory containing the snapshot file
    #[arg(long, default_value = "dump")]
    dir: String,

    /// Snapshot filename
    #[arg(long, default_value = "dump.rdb")]
    dbfilename: String,

    /// TCP listen port
    #[arg(long, default_value_t = 6379)]
    port: u16,

    /// Literal 'master' to lead, or '<host> <port>' of the leader to
    /// follow
    #[arg(long, default_value = "master")]
    replicaof: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    let config = match ServerConfig::new(args.dir, args.dbfilename, args.port, &args.replicaof) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "Starting as {} on port {}",
        if config.is_follower() { "follower" } else { "leader" },
        config.port
    );

    let ctx = ServerContext::new(config);

    // Snapshot load failure is non-fatal; the keyspace starts empty.
    let path = ctx.config.snapshot_path();
    {
        let mut keyspace = ctx.keyspace.lock().await;
        match snapshot::load_file(&path, &mut keyspace) {
            Ok(0) => {}
            Ok(records) => info!("Loaded {records} records from {}", path.display()),
            Err(e) => warn!("Ignoring unreadable snapshot {}: {e}", path.display()),
        }
    }

    if let Err(e) = server::run(ctx).await {
        // Almost always a failure to bind the listen port.
        error!("Server failed: {e}");
        std::process::exit(1);
    }
    Ok(())
}

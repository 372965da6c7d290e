//! TCP listener and per-connection read loop
//!
//! One task per accepted connection. Each task owns its read buffer,
//! decodes as many complete frames as a read produced (TCP may
//! coalesce requests), and pushes every command through the
//! dispatcher. PSYNC is intercepted here because it turns the
//! connection into a replica channel: the write half moves into the
//! replica registry while this task keeps reading acknowledgements.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::command::{self, Source};
use crate::config::ServerConfig;
use crate::errors::ServerResult;
use crate::replication::{ReplicationState, follower, leader};
use crate::resp;
use crate::store::Keyspace;
use crate::stream::StreamStore;
use crate::transaction::TransactionTable;

/// Shared server state passed by reference to every handler. One
/// mutex per store; no lock is held across a network write.
pub struct ServerContext {
    pub config: ServerConfig,
    pub keyspace: Mutex<Keyspace>,
    pub streams: Mutex<StreamStore>,
    pub transactions: Mutex<TransactionTable>,
    pub replication: Mutex<ReplicationState>,
    /// Acknowledgement rendezvous: every REPLCONF ACK received from a
    /// replica is published here; each WAIT takes its own
    /// subscription.
    pub acks: broadcast::Sender<u64>,
    next_conn_id: AtomicU64,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (acks, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            keyspace: Mutex::new(Keyspace::new()),
            streams: Mutex::new(StreamStore::new()),
            transactions: Mutex::new(TransactionTable::new()),
            replication: Mutex::new(ReplicationState::new()),
            acks,
            next_conn_id: AtomicU64::new(1),
        })
    }

    // Stable connection identity; transaction slots are keyed by it.
    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Bind the configured port and serve until the process exits. A bind
/// failure propagates to the caller, which treats it as fatal.
pub async fn run(ctx: Arc<ServerContext>) -> ServerResult<()> {
    let listener = TcpListener::bind(("0.0.0.0", ctx.config.port)).await?;
    info!("Listening on port {}", ctx.config.port);

    if ctx.config.is_follower() {
        tokio::spawn(follower::run(ctx.clone()));
    }

    serve(listener, ctx).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) -> ServerResult<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let conn_id = ctx.next_conn_id();
        debug!("Accepted connection {conn_id} from {peer}");

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&ctx, stream, conn_id).await {
                debug!("Connection {conn_id} ended: {e}");
            }
            // Any in-flight transaction dies with the connection.
            ctx.transactions.lock().await.remove(conn_id);
        });
    }
}

async fn handle_connection(
    ctx: &Arc<ServerContext>,
    stream: tokio::net::TcpStream,
    conn_id: u64,
) -> ServerResult<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);

        let (frames, consumed) = match resp::decode_all(&pending) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Discarding malformed buffer from connection {conn_id}: {e}");
                pending.clear();
                continue;
            }
        };

        let mut at = 0;
        for frame in &frames {
            let raw = &pending[at..at + frame.consumed];
            at += frame.consumed;

            let Some(cmd) = resp::extract_command(frame, raw) else {
                debug!("Ignoring non-command frame on connection {conn_id}");
                continue;
            };

            if cmd.verb == "psync" {
                leader::handle_psync(ctx, conn_id, writer.clone()).await?;
                continue;
            }

            let outcome = command::dispatch(ctx, cmd, Source::Client { conn_id }).await;
            if let Some(reply) = outcome.reply {
                writer.lock().await.write_all(&reply).await?;
            }
            // Propagation strictly after the client got its reply.
            for write in outcome.propagate {
                leader::propagate(ctx, &write).await;
            }
        }
        pending.drain(..consumed);
    }
    Ok(())
}

//! Follower-side replication
//!
//! Connects to the configured leader, performs the handshake, ingests
//! the full-resync snapshot, and then applies the propagated command
//! stream. Commands from the leader run through the normal dispatcher
//! with replies suppressed; the only bytes sent back are the
//! acknowledgements answering `REPLCONF GETACK *`.
//!
//! Offset accounting: every byte read from the leader after the
//! snapshot counts toward the consumed offset, and the count is bumped
//! before the buffer's commands are dispatched, so a GETACK answers
//! with an offset that includes its own bytes.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::command::{self, Source};
use crate::config::Role;
use crate::errors::{ServerError, ServerResult};
use crate::resp::{self, RespValue};
use crate::server::ServerContext;
use crate::snapshot;

/// Entry point for the follower task spawned at startup.
pub async fn run(ctx: Arc<ServerContext>) {
    let Role::Follower { host, port } = ctx.config.role.clone() else {
        return;
    };
    match replicate_from(&ctx, &host, port).await {
        Ok(()) => info!("Replication link to {host}:{port} closed"),
        Err(e) => error!("Replication link to {host}:{port} failed: {e}"),
    }
}

async fn replicate_from(ctx: &Arc<ServerContext>, host: &str, port: u16) -> ServerResult<()> {
    let mut stream = TcpStream::connect((host, port)).await?;
    info!("Connected to leader at {host}:{port}");

    // Bytes read from the leader but not yet decoded. Shared across
    // the handshake steps because the leader may coalesce replies.
    let mut pending: Vec<u8> = Vec::new();

    handshake(ctx, &mut stream, &mut pending).await?;

    // Everything left over after the snapshot is already replication
    // stream and counts toward the consumed offset.
    if !pending.is_empty() {
        ctx.replication.lock().await.offset += pending.len() as u64;
    }

    let mut buf = [0u8; 4096];
    loop {
        apply_pending(ctx, &mut stream, &mut pending).await?;

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        // Counted before dispatching this read's commands.
        ctx.replication.lock().await.offset += n as u64;
        pending.extend_from_slice(&buf[..n]);
    }
    Ok(())
}

// PING, REPLCONF x2, PSYNC, snapshot transfer, ACK 0.
async fn handshake(
    ctx: &Arc<ServerContext>,
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
) -> ServerResult<()> {
    send_and_expect(stream, pending, &["PING"], "PONG").await?;

    let listening_port = ctx.config.port.to_string();
    send_and_expect(
        stream,
        pending,
        &["REPLCONF", "listening-port", &listening_port],
        "OK",
    )
    .await?;
    send_and_expect(stream, pending, &["REPLCONF", "capa", "psync2"], "OK").await?;

    stream
        .write_all(&resp::string_array(&["PSYNC", "?", "-1"]))
        .await?;

    let (replid, baseline) = read_fullresync(stream, pending).await?;
    ctx.replication.lock().await.replid = replid;

    let payload = read_snapshot_payload(stream, pending).await?;
    {
        let mut keyspace = ctx.keyspace.lock().await;
        match snapshot::load_bytes(&payload, &mut keyspace) {
            Ok(records) => debug!("Ingested snapshot with {records} records"),
            Err(e) => warn!("Discarding unreadable snapshot payload: {e}"),
        }
    }

    stream
        .write_all(&resp::string_array(&["REPLCONF", "ACK", "0"]))
        .await?;
    info!("Full resync complete, leader offset baseline {baseline}");
    Ok(())
}

async fn send_and_expect(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
    request: &[&str],
    expected: &str,
) -> ServerResult<()> {
    stream.write_all(&resp::string_array(request)).await?;
    let reply = read_frame(stream, pending).await?;
    match reply {
        RespValue::Simple(ref s) if s == expected => Ok(()),
        other => Err(ServerError::protocol(format!(
            "handshake step {:?} expected +{expected}, got {other:?}",
            request[0]
        ))),
    }
}

async fn read_fullresync(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
) -> ServerResult<(String, u64)> {
    let reply = read_frame(stream, pending).await?;
    let RespValue::Simple(line) = reply else {
        return Err(ServerError::protocol("PSYNC reply is not a simple string"));
    };

    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("FULLRESYNC"), Some(replid), Some(offset)) => {
            let offset = offset
                .parse()
                .map_err(|_| ServerError::protocol("FULLRESYNC offset is not a number"))?;
            Ok((replid.to_string(), offset))
        }
        _ => Err(ServerError::protocol(format!(
            "unexpected PSYNC reply '{line}'"
        ))),
    }
}

// The snapshot arrives as `$<len>\r\n<bytes>` with no trailing CRLF.
async fn read_snapshot_payload(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
) -> ServerResult<Vec<u8>> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(crlf) = pending.windows(2).position(|w| w == b"\r\n") {
            if pending.first() != Some(&b'$') {
                return Err(ServerError::protocol("snapshot transfer missing bulk header"));
            }
            let len: usize = std::str::from_utf8(&pending[1..crlf])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ServerError::protocol("snapshot length is not a number"))?;

            let total = crlf + 2 + len;
            if pending.len() >= total {
                let payload = pending[crlf + 2..total].to_vec();
                pending.drain(..total);
                return Ok(payload);
            }
        }

        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ServerError::protocol("leader closed during snapshot transfer"));
        }
        pending.extend_from_slice(&buf[..n]);
    }
}

// Read exactly one frame, pulling more bytes as needed. Handshake
// reads happen before offset accounting starts, so nothing is counted
// here.
async fn read_frame(stream: &mut TcpStream, pending: &mut Vec<u8>) -> ServerResult<RespValue> {
    let mut buf = [0u8; 4096];
    loop {
        match resp::decode_one(pending) {
            Ok(frame) => {
                pending.drain(..frame.consumed);
                return Ok(frame.value);
            }
            Err(ServerError::Truncated) => {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Err(ServerError::protocol("leader closed during handshake"));
                }
                pending.extend_from_slice(&buf[..n]);
            }
            Err(e) => return Err(e),
        }
    }
}

// Decode and apply every complete frame in `pending`. Replies are
// suppressed except for GETACK answers.
async fn apply_pending(
    ctx: &Arc<ServerContext>,
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
) -> ServerResult<()> {
    if pending.is_empty() {
        return Ok(());
    }

    let (frames, consumed) = match resp::decode_all(pending) {
        Ok(decoded) => decoded,
        Err(e) => {
            // A malformed replication stream cannot be resynchronised
            // frame-by-frame; drop the buffer and keep counting.
            warn!("Discarding malformed replication buffer: {e}");
            pending.clear();
            return Ok(());
        }
    };

    let mut offset_in_buffer = 0;
    for frame in &frames {
        let raw = &pending[offset_in_buffer..offset_in_buffer + frame.consumed];
        offset_in_buffer += frame.consumed;

        let Some(cmd) = resp::extract_command(frame, raw) else {
            debug!("Skipping non-command frame from leader");
            continue;
        };
        let verb = cmd.verb.clone();
        let outcome = command::dispatch(ctx, cmd, Source::Replication).await;
        if let Some(reply) = outcome.reply {
            debug!("Answering {verb} on the replication channel");
            stream.write_all(&reply).await?;
        }
    }

    pending.drain(..consumed);
    Ok(())
}

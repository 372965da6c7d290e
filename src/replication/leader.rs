//! Leader-side replication
//!
//! PSYNC registration with full-resync, verbatim write propagation,
//! and the WAIT acknowledgement protocol.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::errors::ServerResult;
use crate::resp;
use crate::server::ServerContext;
use crate::snapshot;

/// Serve a PSYNC request: register the connection as a replica at
/// offset zero, emit the FULLRESYNC line, then transfer the snapshot
/// payload with bulk framing and no trailing CRLF.
///
/// The writer lock is held across the whole transfer so a concurrent
/// propagation cannot interleave bytes into the snapshot.
pub async fn handle_psync(
    ctx: &Arc<ServerContext>,
    conn_id: u64,
    writer: Arc<Mutex<OwnedWriteHalf>>,
) -> ServerResult<()> {
    let mut guard = writer.lock().await;

    let (replid, offset) = {
        let mut replication = ctx.replication.lock().await;
        replication.register(conn_id, writer.clone());
        (replication.replid.clone(), replication.offset)
    };
    info!("Registered replica on connection {conn_id}");

    guard
        .write_all(&resp::simple(&format!("FULLRESYNC {replid} {offset}")))
        .await?;
    guard
        .write_all(&resp::bulk_no_trailer(&snapshot::empty_payload()))
        .await?;
    Ok(())
}

/// Forward the original wire bytes of an accepted write to every
/// registered replica and advance the propagated-stream offset by the
/// same count. A replica that fails to accept the write is logged and
/// skipped; propagation to the others continues.
pub async fn propagate(ctx: &Arc<ServerContext>, raw: &[u8]) {
    let targets: Vec<(u64, Arc<Mutex<OwnedWriteHalf>>)> = {
        let mut replication = ctx.replication.lock().await;
        replication.advance_offset(raw.len() as u64);
        replication
            .replicas
            .iter()
            .map(|r| (r.conn_id, r.writer.clone()))
            .collect()
    };

    for (conn_id, writer) in targets {
        let result = writer.lock().await.write_all(raw).await;
        match result {
            Ok(()) => {
                let mut replication = ctx.replication.lock().await;
                replication.credit_replica(conn_id, raw.len() as u64);
            }
            Err(e) => {
                warn!("Failed to propagate {} bytes to replica {conn_id}: {e}", raw.len());
            }
        }
    }
}

/// Record an acknowledgement received from a replica connection. Any
/// WAIT currently pending picks it up through its own subscription.
pub fn record_ack(ctx: &Arc<ServerContext>, acked_offset: u64) {
    // No subscriber means no WAIT in flight; dropping is fine.
    let _ = ctx.acks.send(acked_offset);
}

/// Serve WAIT: probe every replica with `REPLCONF GETACK *` and count
/// acknowledgements until `numreplicas` arrive or the timeout elapses.
///
/// Ack counting is scoped to this invocation: the subscription is
/// taken before any probe is written, so concurrent WAITs each see the
/// full set of notifications instead of racing for them.
pub async fn wait_for_acks(ctx: &Arc<ServerContext>, numreplicas: usize, timeout_ms: u64) -> i64 {
    let (replica_count, offset) = {
        let replication = ctx.replication.lock().await;
        (replication.replica_count(), replication.offset)
    };

    // Nothing has been propagated yet, so no replica can have
    // drifted; answer with the live replica count.
    if offset == 0 {
        return replica_count as i64;
    }

    let mut acks_rx = ctx.acks.subscribe();
    send_getack_probes(ctx).await;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut acks: i64 = 0;
    while (acks as usize) < numreplicas {
        match tokio::time::timeout_at(deadline, acks_rx.recv()).await {
            Ok(Ok(acked)) => {
                debug!("WAIT observed ack at offset {acked}");
                acks += 1;
            }
            Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                acks += missed as i64;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => {
                debug!("WAIT timed out with {acks} acks");
                break;
            }
        }
    }
    acks
}

// One probe task per replica, so a stalled connection cannot hold up
// the others. Probe bytes count toward the per-replica offset.
async fn send_getack_probes(ctx: &Arc<ServerContext>) {
    let probe = resp::string_array(&["REPLCONF", "GETACK", "*"]);
    let targets: Vec<(u64, Arc<Mutex<OwnedWriteHalf>>)> = {
        let replication = ctx.replication.lock().await;
        replication
            .replicas
            .iter()
            .map(|r| (r.conn_id, r.writer.clone()))
            .collect()
    };

    for (conn_id, writer) in targets {
        let ctx = ctx.clone();
        let probe = probe.clone();
        tokio::spawn(async move {
            let result = writer.lock().await.write_all(&probe).await;
            match result {
                Ok(()) => {
                    let mut replication = ctx.replication.lock().await;
                    replication.credit_replica(conn_id, probe.len() as u64);
                }
                Err(e) => warn!("Failed to probe replica {conn_id}: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn test_context() -> Arc<ServerContext> {
        let config = ServerConfig::new("dump".into(), "dump.rdb".into(), 0, "master").unwrap();
        ServerContext::new(config)
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_wait_before_any_write_returns_replica_count() {
        let ctx = test_context();
        assert_eq!(wait_for_acks(&ctx, 5, 100).await, 0);

        let (client, _server) = loopback_pair().await;
        let (_read_half, write_half) = client.into_split();
        ctx.replication
            .lock()
            .await
            .register(1, Arc::new(Mutex::new(write_half)));

        // master_repl_offset is still zero: reply immediately
        assert_eq!(wait_for_acks(&ctx, 1, 100).await, 1);
    }

    #[tokio::test]
    async fn test_wait_counts_acks_from_subscription() {
        let ctx = test_context();
        let (client, _server) = loopback_pair().await;
        let (_read_half, write_half) = client.into_split();
        {
            let mut replication = ctx.replication.lock().await;
            replication.register(1, Arc::new(Mutex::new(write_half)));
            replication.advance_offset(31);
        }

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { wait_for_acks(&ctx, 1, 1_000).await })
        };
        // Give the waiter time to subscribe before the ack arrives
        tokio::time::sleep(Duration::from_millis(50)).await;
        record_ack(&ctx, 31);

        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_with_partial_acks() {
        let ctx = test_context();
        let (client, _server) = loopback_pair().await;
        let (_read_half, write_half) = client.into_split();
        {
            let mut replication = ctx.replication.lock().await;
            replication.register(1, Arc::new(Mutex::new(write_half)));
            replication.advance_offset(10);
        }

        let started = std::time::Instant::now();
        assert_eq!(wait_for_acks(&ctx, 3, 80).await, 0);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_propagate_writes_raw_bytes_and_advances_offset() {
        let ctx = test_context();
        let (client, mut server) = loopback_pair().await;
        let (_read_half, write_half) = client.into_split();
        ctx.replication
            .lock()
            .await
            .register(1, Arc::new(Mutex::new(write_half)));

        let raw = resp::string_array(&["SET", "foo", "bar"]);
        propagate(&ctx, &raw).await;

        let mut received = vec![0u8; raw.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, raw);

        let replication = ctx.replication.lock().await;
        assert_eq!(replication.offset, raw.len() as u64);
        assert_eq!(replication.replicas[0].offset, raw.len() as u64);
    }

    #[tokio::test]
    async fn test_handle_psync_sends_fullresync_then_snapshot() {
        let ctx = test_context();
        let (client, mut server) = loopback_pair().await;
        let (_read_half, write_half) = client.into_split();

        handle_psync(&ctx, 7, Arc::new(Mutex::new(write_half)))
            .await
            .unwrap();
        assert_eq!(ctx.replication.lock().await.replica_count(), 1);

        let replid = ctx.replication.lock().await.replid.clone();
        let payload = snapshot::empty_payload();
        let mut expected = format!("+FULLRESYNC {replid} 0\r\n").into_bytes();
        expected.extend(format!("${}\r\n", payload.len()).into_bytes());
        expected.extend_from_slice(&payload);

        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while received.len() < expected.len() {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "leader closed mid-transfer");
            received.extend_from_slice(&buf[..n]);
        }
        // Bulk framing without trailing CRLF: payload runs to the end
        assert_eq!(received, expected);
    }
}

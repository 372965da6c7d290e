//! Command dispatcher
//!
//! Routes a decoded command array to its handler and produces the
//! encoded reply. Replies for Redis-defined failures are RESP error
//! strings; anything else is logged and answered with silence, which
//! keeps the connection usable.
//!
//! Commands arriving on the replication channel run through the same
//! handlers but have their replies suppressed, except for the
//! acknowledgement that answers `REPLCONF GETACK *`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Role;
use crate::errors::{ServerError, ServerResult};
use crate::replication::leader;
use crate::resp::{self, Command};
use crate::server::ServerContext;
use crate::stream::{StreamEntry, StreamId};
use crate::transaction::QueuedCommand;

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A regular client connection.
    Client { conn_id: u64 },
    /// The leader-to-follower replication channel.
    Replication,
}

/// What the connection loop must do with a dispatched command.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Encoded reply bytes, if the command produces one.
    pub reply: Option<Vec<u8>>,
    /// Wire bytes of write commands to forward to replicas, in
    /// execution order. Written only after the reply.
    pub propagate: Vec<Vec<u8>>,
}

impl Outcome {
    fn none() -> Self {
        Self::default()
    }

    fn reply(bytes: Vec<u8>) -> Self {
        Self {
            reply: Some(bytes),
            propagate: Vec::new(),
        }
    }
}

/// Dispatch one command and encode its reply.
pub async fn dispatch(ctx: &Arc<ServerContext>, cmd: Command, source: Source) -> Outcome {
    // A queuing transaction captures everything except its own
    // control verbs, with no side effects until EXEC.
    if let Source::Client { conn_id } = source {
        let control = matches!(cmd.verb.as_str(), "multi" | "exec" | "discard");
        let mut transactions = ctx.transactions.lock().await;
        if transactions.is_queuing(conn_id) && !control {
            transactions.enqueue(
                conn_id,
                QueuedCommand {
                    verb: cmd.verb.clone(),
                    args: cmd.args.clone(),
                    raw: cmd.raw.clone(),
                },
            );
            return Outcome::reply(resp::simple("QUEUED"));
        }
    }

    let verb = cmd.verb.clone();
    let mut outcome = match dispatch_inner(ctx, &cmd, source).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Command {verb} failed: {e}");
            Outcome::none()
        }
    };

    // Writes received over replication produce no client reply
    // regardless of outcome; only REPLCONF answers pass through.
    if source == Source::Replication && verb != "replconf" {
        outcome.reply = None;
        outcome.propagate.clear();
    }
    outcome
}

async fn dispatch_inner(
    ctx: &Arc<ServerContext>,
    cmd: &Command,
    source: Source,
) -> ServerResult<Outcome> {
    let args = &cmd.args;
    match cmd.verb.as_str() {
        "ping" => Ok(Outcome::reply(resp::simple("PONG"))),
        "echo" => {
            let msg = first_arg(cmd)?;
            Ok(Outcome::reply(resp::bulk(msg.as_bytes())))
        }
        // redis-cli opens with COMMAND DOCS; a PONG keeps it happy.
        "command" => Ok(Outcome::reply(resp::simple("PONG"))),
        "set" => handle_set(ctx, cmd, source).await,
        "get" => handle_get(ctx, cmd).await,
        "incr" => handle_incr(ctx, cmd).await,
        "keys" => handle_keys(ctx, cmd).await,
        "type" => handle_type(ctx, cmd).await,
        "config" => handle_config(ctx, cmd).await,
        "info" => handle_info(ctx, cmd).await,
        "xadd" => handle_xadd(ctx, cmd).await,
        "xrange" => handle_xrange(ctx, cmd).await,
        "xread" => handle_xread(ctx, cmd).await,
        "multi" => handle_multi(ctx, source).await,
        "exec" => handle_exec(ctx, source).await,
        "discard" => handle_discard(ctx, source).await,
        "replconf" => handle_replconf(ctx, cmd).await,
        "wait" => {
            let numreplicas: usize = parse_arg(cmd, 0, "numreplicas")?;
            let timeout_ms: u64 = parse_arg(cmd, 1, "timeout")?;
            let acks = leader::wait_for_acks(ctx, numreplicas, timeout_ms).await;
            Ok(Outcome::reply(resp::integer(acks)))
        }
        "psync" => Err(ServerError::protocol(
            "PSYNC is handled by the connection loop",
        )),
        _ => {
            if !args.is_empty() {
                debug!("Arguments of unknown command: {args:?}");
            }
            Err(ServerError::UnknownCommand {
                verb: cmd.verb.clone(),
            })
        }
    }
}

async fn handle_set(
    ctx: &Arc<ServerContext>,
    cmd: &Command,
    source: Source,
) -> ServerResult<Outcome> {
    let [key, value, options @ ..] = &cmd.args[..] else {
        return Err(ServerError::bad_arguments("set", "expected key and value"));
    };

    let mut ttl = None;
    let mut i = 0;
    while i < options.len() {
        match options[i].to_lowercase().as_str() {
            "px" => {
                let ms: u64 = parse_option(options, i + 1, "PX milliseconds")?;
                ttl = Some(Duration::from_millis(ms));
                i += 2;
            }
            "ex" => {
                let secs: u64 = parse_option(options, i + 1, "EX seconds")?;
                ttl = Some(Duration::from_secs(secs));
                i += 2;
            }
            other => {
                return Err(ServerError::bad_arguments(
                    "set",
                    format!("unsupported option '{other}'"),
                ));
            }
        }
    }

    ctx.keyspace
        .lock()
        .await
        .set(key.clone(), value.clone(), ttl);

    let mut outcome = Outcome::reply(resp::simple("OK"));
    // The original wire bytes go to the replicas so offsets stay
    // byte-aligned; a re-encoded form would not.
    if matches!(source, Source::Client { .. }) {
        outcome.propagate.push(cmd.raw.clone());
    }
    Ok(outcome)
}

async fn handle_get(ctx: &Arc<ServerContext>, cmd: &Command) -> ServerResult<Outcome> {
    let key = first_arg(cmd)?;
    let value = ctx.keyspace.lock().await.get(key);
    Ok(Outcome::reply(match value {
        Some(value) => resp::bulk(value.as_bytes()),
        None => resp::bulk_null(),
    }))
}

async fn handle_incr(ctx: &Arc<ServerContext>, cmd: &Command) -> ServerResult<Outcome> {
    let key = first_arg(cmd)?;
    Ok(Outcome::reply(match ctx.keyspace.lock().await.incr(key) {
        Some(value) => resp::integer(value),
        None => resp::error("ERR value is not an integer or out of range"),
    }))
}

async fn handle_keys(ctx: &Arc<ServerContext>, cmd: &Command) -> ServerResult<Outcome> {
    let pattern = first_arg(cmd)?;
    if pattern != "*" {
        return Err(ServerError::bad_arguments(
            "keys",
            "only the '*' pattern is supported",
        ));
    }
    let keys = ctx.keyspace.lock().await.keys();
    let mut reply = resp::array_header(keys.len());
    for key in keys {
        reply.extend(resp::bulk(key.as_bytes()));
    }
    Ok(Outcome::reply(reply))
}

async fn handle_type(ctx: &Arc<ServerContext>, cmd: &Command) -> ServerResult<Outcome> {
    let key = first_arg(cmd)?;
    let kind = if ctx.keyspace.lock().await.contains(key) {
        "string"
    } else if ctx.streams.lock().await.contains(key) {
        "stream"
    } else {
        "none"
    };
    Ok(Outcome::reply(resp::simple(kind)))
}

async fn handle_config(ctx: &Arc<ServerContext>, cmd: &Command) -> ServerResult<Outcome> {
    if cmd.args.first().map(|s| s.to_lowercase()).as_deref() != Some("get") {
        return Err(ServerError::bad_arguments("config", "only GET is supported"));
    }

    // Unknown parameters are omitted silently.
    let mut pairs: Vec<(&str, &str)> = Vec::new();
    for parameter in &cmd.args[1..] {
        match parameter.to_lowercase().as_str() {
            "dir" => pairs.push(("dir", ctx.config.dir.as_str())),
            "dbfilename" => pairs.push(("dbfilename", ctx.config.dbfilename.as_str())),
            _ => {}
        }
    }

    let mut reply = resp::array_header(pairs.len() * 2);
    for (name, value) in pairs {
        reply.extend(resp::bulk(name.as_bytes()));
        reply.extend(resp::bulk(value.as_bytes()));
    }
    Ok(Outcome::reply(reply))
}

async fn handle_info(ctx: &Arc<ServerContext>, cmd: &Command) -> ServerResult<Outcome> {
    let section = cmd.args.first().map(|s| s.to_lowercase());
    if !matches!(section.as_deref(), None | Some("replication")) {
        return Err(ServerError::bad_arguments(
            "info",
            "only the replication section is supported",
        ));
    }

    let role = match ctx.config.role {
        Role::Leader => "master",
        Role::Follower { .. } => "slave",
    };
    let (offset, replid) = {
        let replication = ctx.replication.lock().await;
        (replication.offset, replication.replid.clone())
    };
    let body = format!("role:{role}\r\nmaster_repl_offset:{offset}\r\nmaster_replid:{replid}");
    Ok(Outcome::reply(resp::bulk(body.as_bytes())))
}

async fn handle_xadd(ctx: &Arc<ServerContext>, cmd: &Command) -> ServerResult<Outcome> {
    let [key, id_text, fields @ ..] = &cmd.args[..] else {
        return Err(ServerError::bad_arguments("xadd", "expected key and ID"));
    };
    if fields.is_empty() || fields.len() % 2 != 0 {
        return Err(ServerError::bad_arguments(
            "xadd",
            "field/value arguments must come in pairs",
        ));
    }

    let pairs = fields
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    let result = ctx.streams.lock().await.add(key, id_text, pairs);
    Ok(Outcome::reply(match result {
        Ok(id) => resp::bulk(id.as_bytes()),
        Err(e) => resp::error(&e.to_string()),
    }))
}

async fn handle_xrange(ctx: &Arc<ServerContext>, cmd: &Command) -> ServerResult<Outcome> {
    let [key, start, end] = &cmd.args[..] else {
        return Err(ServerError::bad_arguments(
            "xrange",
            "expected key, start, and end",
        ));
    };

    let bounds = StreamId::parse_bound(start, true)
        .and_then(|s| StreamId::parse_bound(end, false).map(|e| (s, e)));
    let (start, end) = match bounds {
        Ok(bounds) => bounds,
        Err(e) => return Ok(Outcome::reply(resp::error(&e.to_string()))),
    };

    let entries = ctx.streams.lock().await.range(key, start, end);
    Ok(Outcome::reply(encode_entries(&entries)))
}

async fn handle_xread(ctx: &Arc<ServerContext>, cmd: &Command) -> ServerResult<Outcome> {
    let args = &cmd.args;
    let mut idx = 0;

    // Optional BLOCK <ms> prefix, then the STREAMS keyword at a fixed
    // position. Other option prefixes are not supported.
    let mut block_ms: Option<u64> = None;
    if args.first().map(|s| s.to_lowercase()).as_deref() == Some("block") {
        block_ms = Some(parse_arg(cmd, 1, "BLOCK milliseconds")?);
        idx = 2;
    }
    if args.get(idx).map(|s| s.to_lowercase()).as_deref() != Some("streams") {
        return Err(ServerError::bad_arguments(
            "xread",
            "expected 'STREAMS key... id...'",
        ));
    }
    idx += 1;

    let rest = &args[idx..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(ServerError::bad_arguments(
            "xread",
            "number of keys and IDs must match",
        ));
    }
    let count = rest.len() / 2;
    let keys: Vec<String> = rest[..count].to_vec();
    let id_texts = &rest[count..];

    // Resolve start IDs up front; `$` pins to the last ID at call
    // time, so a blocking read only sees entries appended after it.
    let starts = {
        let streams = ctx.streams.lock().await;
        let mut starts = Vec::with_capacity(count);
        for text in id_texts {
            let id = if text == "$" {
                StreamId::parse(streams.last_id()).unwrap_or(StreamId::ZERO)
            } else {
                match StreamId::parse_bound(text, true) {
                    Ok(id) => id,
                    Err(e) => return Ok(Outcome::reply(resp::error(&e.to_string()))),
                }
            };
            starts.push(id);
        }
        starts
    };

    let results = match block_ms {
        None => {
            let streams = ctx.streams.lock().await;
            scan_streams(&streams, &keys, &starts)
        }
        Some(ms) => match blocking_scan(ctx, &keys, &starts, ms).await {
            Some(results) => results,
            None => return Ok(Outcome::reply(resp::bulk_null())),
        },
    };

    if results.is_empty() {
        return Ok(Outcome::reply(resp::bulk_null()));
    }

    let mut reply = resp::array_header(results.len());
    for (key, entries) in results {
        reply.extend(resp::array_header(2));
        reply.extend(resp::bulk(key.as_bytes()));
        reply.extend(encode_entries(&entries));
    }
    Ok(Outcome::reply(reply))
}

// Wait until any requested stream gains a qualifying entry or the
// timeout elapses. Returns None on timeout with nothing to report.
async fn blocking_scan(
    ctx: &Arc<ServerContext>,
    keys: &[String],
    starts: &[StreamId],
    block_ms: u64,
) -> Option<Vec<(String, Vec<StreamEntry>)>> {
    let deadline =
        (block_ms > 0).then(|| tokio::time::Instant::now() + Duration::from_millis(block_ms));

    loop {
        // Scan and subscribe under one lock so an append between the
        // two cannot be missed.
        let (results, mut receivers) = {
            let mut streams = ctx.streams.lock().await;
            let results = scan_streams(&streams, keys, starts);
            if !results.is_empty() {
                return Some(results);
            }
            let receivers: Vec<_> = keys.iter().map(|k| streams.subscribe(k)).collect();
            (results, receivers)
        };
        debug_assert!(results.is_empty());

        // Any append on any requested stream wakes us; the rescan
        // decides whether it qualifies.
        let wake = async {
            let recvs: Vec<_> = receivers.iter_mut().map(|rx| Box::pin(rx.recv())).collect();
            futures::future::select_all(recvs).await
        };
        match deadline {
            Some(deadline) => {
                if tokio::time::timeout_at(deadline, wake).await.is_err() {
                    return None;
                }
            }
            None => {
                wake.await;
            }
        }
    }
}

fn scan_streams(
    streams: &crate::stream::StreamStore,
    keys: &[String],
    starts: &[StreamId],
) -> Vec<(String, Vec<StreamEntry>)> {
    keys.iter()
        .zip(starts)
        .filter_map(|(key, start)| {
            let entries = streams.entries_after(key, *start);
            (!entries.is_empty()).then(|| (key.clone(), entries))
        })
        .collect()
}

// Entries encode as [id, [field, value, ...]] with fields in
// insertion order.
fn encode_entries(entries: &[StreamEntry]) -> Vec<u8> {
    let mut out = resp::array_header(entries.len());
    for entry in entries {
        out.extend(resp::array_header(2));
        out.extend(resp::bulk(entry.id.as_bytes()));
        out.extend(resp::array_header(entry.fields.len() * 2));
        for (field, value) in &entry.fields {
            out.extend(resp::bulk(field.as_bytes()));
            out.extend(resp::bulk(value.as_bytes()));
        }
    }
    out
}

async fn handle_multi(ctx: &Arc<ServerContext>, source: Source) -> ServerResult<Outcome> {
    let Source::Client { conn_id } = source else {
        return Ok(Outcome::none());
    };
    Ok(Outcome::reply(
        if ctx.transactions.lock().await.begin(conn_id) {
            resp::simple("OK")
        } else {
            resp::error("ERR MULTI calls can not be nested")
        },
    ))
}

async fn handle_exec(ctx: &Arc<ServerContext>, source: Source) -> ServerResult<Outcome> {
    let Source::Client { conn_id } = source else {
        return Ok(Outcome::none());
    };

    let Some(queued) = ctx.transactions.lock().await.take(conn_id) else {
        return Ok(Outcome::reply(resp::error("ERR EXEC without MULTI")));
    };
    if queued.is_empty() {
        return Ok(Outcome::reply(resp::array_header(0)));
    }

    // Each queued command runs as if freshly received on this
    // connection; the transaction is already closed, so nothing
    // re-queues.
    let mut replies: Vec<Vec<u8>> = Vec::with_capacity(queued.len());
    let mut propagate = Vec::new();
    for command in queued {
        let cmd = Command {
            verb: command.verb,
            args: command.args,
            raw: command.raw,
        };
        let outcome = Box::pin(dispatch(ctx, cmd, source)).await;
        if let Some(reply) = outcome.reply {
            replies.push(reply);
        }
        propagate.extend(outcome.propagate);
    }

    let mut reply = resp::array_header(replies.len());
    for r in &replies {
        reply.extend_from_slice(r);
    }
    Ok(Outcome {
        reply: Some(reply),
        propagate,
    })
}

async fn handle_discard(ctx: &Arc<ServerContext>, source: Source) -> ServerResult<Outcome> {
    let Source::Client { conn_id } = source else {
        return Ok(Outcome::none());
    };
    Ok(Outcome::reply(
        if ctx.transactions.lock().await.discard(conn_id) {
            resp::simple("OK")
        } else {
            resp::error("ERR DISCARD without MULTI")
        },
    ))
}

async fn handle_replconf(ctx: &Arc<ServerContext>, cmd: &Command) -> ServerResult<Outcome> {
    match cmd.args.first().map(|s| s.to_lowercase()).as_deref() {
        Some("getack") if cmd.args.get(1).map(String::as_str) == Some("*") => {
            let offset = ctx.replication.lock().await.offset;
            Ok(Outcome::reply(resp::string_array(&[
                "REPLCONF",
                "ACK",
                &offset.to_string(),
            ])))
        }
        Some("ack") => {
            let acked: u64 = parse_arg(cmd, 1, "ack offset")?;
            leader::record_ack(ctx, acked);
            Ok(Outcome::none())
        }
        // listening-port and capa during the handshake
        Some(_) => Ok(Outcome::reply(resp::simple("OK"))),
        None => Err(ServerError::bad_arguments("replconf", "missing subcommand")),
    }
}

fn first_arg(cmd: &Command) -> ServerResult<&String> {
    cmd.args
        .first()
        .ok_or_else(|| ServerError::bad_arguments(cmd.verb.clone(), "missing argument"))
}

fn parse_arg<T: std::str::FromStr>(cmd: &Command, index: usize, what: &str) -> ServerResult<T> {
    cmd.args
        .get(index)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ServerError::bad_arguments(cmd.verb.clone(), format!("{what} is missing or invalid"))
        })
}

fn parse_option<T: std::str::FromStr>(
    options: &[String],
    index: usize,
    what: &str,
) -> ServerResult<T> {
    options
        .get(index)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ServerError::bad_arguments("set", format!("{what} is missing or invalid"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn test_context() -> Arc<ServerContext> {
        let config = ServerConfig::new("dump".into(), "dump.rdb".into(), 0, "master").unwrap();
        ServerContext::new(config)
    }

    fn command(parts: &[&str]) -> Command {
        let raw = resp::string_array(parts);
        let frame = resp::decode_one(&raw).unwrap();
        resp::extract_command(&frame, &raw).unwrap()
    }

    const CLIENT: Source = Source::Client { conn_id: 1 };

    async fn run(ctx: &Arc<ServerContext>, parts: &[&str]) -> Option<Vec<u8>> {
        dispatch(ctx, command(parts), CLIENT).await.reply
    }

    async fn run_str(ctx: &Arc<ServerContext>, parts: &[&str]) -> String {
        String::from_utf8(run(ctx, parts).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_ping_pongs() {
        let ctx = test_context();
        assert_eq!(run_str(&ctx, &["PING"]).await, "+PONG\r\n");
    }

    #[tokio::test]
    async fn test_echo_returns_argument() {
        let ctx = test_context();
        assert_eq!(run_str(&ctx, &["ECHO", "hey"]).await, "$3\r\nhey\r\n");
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let ctx = test_context();
        assert_eq!(run_str(&ctx, &["SET", "foo", "bar"]).await, "+OK\r\n");
        assert_eq!(run_str(&ctx, &["GET", "foo"]).await, "$3\r\nbar\r\n");
        assert_eq!(run_str(&ctx, &["GET", "missing"]).await, "$-1\r\n");
    }

    #[tokio::test]
    async fn test_set_px_expires() {
        let ctx = test_context();
        run(&ctx, &["SET", "foo", "baz", "px", "50"]).await;
        assert_eq!(run_str(&ctx, &["GET", "foo"]).await, "$3\r\nbaz\r\n");
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(run_str(&ctx, &["GET", "foo"]).await, "$-1\r\n");
    }

    #[tokio::test]
    async fn test_set_propagates_original_bytes() {
        let ctx = test_context();
        let cmd = command(&["SET", "foo", "bar"]);
        let raw = cmd.raw.clone();
        let outcome = dispatch(&ctx, cmd, CLIENT).await;
        assert_eq!(outcome.propagate, vec![raw]);

        // Reads are not propagated
        let outcome = dispatch(&ctx, command(&["GET", "foo"]), CLIENT).await;
        assert!(outcome.propagate.is_empty());
    }

    #[tokio::test]
    async fn test_incr_counts_and_rejects_non_integers() {
        let ctx = test_context();
        assert_eq!(run_str(&ctx, &["INCR", "n"]).await, ":1\r\n");
        assert_eq!(run_str(&ctx, &["INCR", "n"]).await, ":2\r\n");
        run(&ctx, &["SET", "s", "abc"]).await;
        assert_eq!(
            run_str(&ctx, &["INCR", "s"]).await,
            "-ERR value is not an integer or out of range\r\n"
        );
    }

    #[tokio::test]
    async fn test_keys_star_lists_live_keys() {
        let ctx = test_context();
        run(&ctx, &["SET", "a", "1"]).await;
        let reply = run_str(&ctx, &["KEYS", "*"]).await;
        assert_eq!(reply, "*1\r\n$1\r\na\r\n");
        // Unsupported patterns produce no reply
        assert!(run(&ctx, &["KEYS", "a*"]).await.is_none());
    }

    #[tokio::test]
    async fn test_type_classifies_both_stores() {
        let ctx = test_context();
        run(&ctx, &["SET", "k", "v"]).await;
        run(&ctx, &["XADD", "s", "1-1", "f", "v"]).await;
        assert_eq!(run_str(&ctx, &["TYPE", "k"]).await, "+string\r\n");
        assert_eq!(run_str(&ctx, &["TYPE", "s"]).await, "+stream\r\n");
        assert_eq!(run_str(&ctx, &["TYPE", "nope"]).await, "+none\r\n");
    }

    #[tokio::test]
    async fn test_config_get_returns_known_pairs_only() {
        let ctx = test_context();
        assert_eq!(
            run_str(&ctx, &["CONFIG", "GET", "dir", "mystery"]).await,
            "*2\r\n$3\r\ndir\r\n$4\r\ndump\r\n"
        );
    }

    #[tokio::test]
    async fn test_info_replication_reports_role_and_offset() {
        let ctx = test_context();
        let reply = run_str(&ctx, &["INFO", "replication"]).await;
        assert!(reply.contains("role:master"));
        assert!(reply.contains("master_repl_offset:0"));
        assert!(reply.contains("master_replid:"));
    }

    #[tokio::test]
    async fn test_xadd_validation_error_texts() {
        let ctx = test_context();
        assert_eq!(
            run_str(&ctx, &["XADD", "s", "0-0", "k", "v"]).await,
            "-ERR The ID specified in XADD must be greater than 0-0\r\n"
        );
        run(&ctx, &["XADD", "s", "1-1", "k", "v"]).await;
        assert_eq!(
            run_str(&ctx, &["XADD", "s", "1-1", "k", "v"]).await,
            "-ERR The ID specified in XADD is equal or smaller than the target stream top item\r\n"
        );
    }

    #[tokio::test]
    async fn test_xadd_auto_seq_then_xrange() {
        let ctx = test_context();
        run(&ctx, &["XADD", "s", "5-*", "a", "1"]).await;
        run(&ctx, &["XADD", "s", "5-*", "a", "2"]).await;
        let reply = run_str(&ctx, &["XRANGE", "s", "-", "+"]).await;
        assert_eq!(
            reply,
            "*2\r\n\
             *2\r\n$3\r\n5-0\r\n*2\r\n$1\r\na\r\n$1\r\n1\r\n\
             *2\r\n$3\r\n5-1\r\n*2\r\n$1\r\na\r\n$1\r\n2\r\n"
        );
    }

    #[tokio::test]
    async fn test_xread_returns_strictly_newer_entries() {
        let ctx = test_context();
        run(&ctx, &["XADD", "s", "1-0", "a", "1"]).await;
        run(&ctx, &["XADD", "s", "2-0", "a", "2"]).await;
        let reply = run_str(&ctx, &["XREAD", "streams", "s", "1-0"]).await;
        assert!(reply.starts_with("*1\r\n*2\r\n$1\r\ns\r\n*1\r\n"));
        assert!(reply.contains("2-0"));
        assert!(!reply.contains("1-0\r\n*2\r\n$1\r\na\r\n$1\r\n1"));
    }

    #[tokio::test]
    async fn test_xread_with_no_new_entries_is_null() {
        let ctx = test_context();
        run(&ctx, &["XADD", "s", "1-0", "a", "1"]).await;
        assert_eq!(run_str(&ctx, &["XREAD", "streams", "s", "1-0"]).await, "$-1\r\n");
    }

    #[tokio::test]
    async fn test_xread_block_wakes_on_append() {
        let ctx = test_context();
        run(&ctx, &["XADD", "s", "1-0", "a", "1"]).await;

        let reader = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                dispatch(
                    &ctx,
                    command(&["XREAD", "block", "0", "streams", "s", "$"]),
                    CLIENT,
                )
                .await
                .reply
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        run(&ctx, &["XADD", "s", "2-0", "a", "2"]).await;

        let reply = String::from_utf8(reader.await.unwrap().unwrap()).unwrap();
        // Only the entry appended after the read began is visible
        assert!(reply.contains("2-0"));
        assert!(!reply.contains("1-0\r\n*"));
    }

    #[tokio::test]
    async fn test_xread_block_times_out_to_null() {
        let ctx = test_context();
        run(&ctx, &["XADD", "s", "1-0", "a", "1"]).await;
        let reply = run_str(&ctx, &["XREAD", "block", "60", "streams", "s", "$"]).await;
        assert_eq!(reply, "$-1\r\n");
    }

    #[tokio::test]
    async fn test_transaction_queues_then_executes() {
        let ctx = test_context();
        assert_eq!(run_str(&ctx, &["MULTI"]).await, "+OK\r\n");
        assert_eq!(run_str(&ctx, &["SET", "k", "1"]).await, "+QUEUED\r\n");
        assert_eq!(run_str(&ctx, &["INCR", "k"]).await, "+QUEUED\r\n");
        assert_eq!(run_str(&ctx, &["EXEC"]).await, "*2\r\n+OK\r\n:2\r\n");
        assert_eq!(run_str(&ctx, &["GET", "k"]).await, "$1\r\n2\r\n");
    }

    #[tokio::test]
    async fn test_transaction_has_no_side_effects_before_exec() {
        let ctx = test_context();
        run(&ctx, &["MULTI"]).await;
        run(&ctx, &["SET", "k", "1"]).await;
        // Another connection sees nothing yet
        let other = Source::Client { conn_id: 2 };
        let reply = dispatch(&ctx, command(&["GET", "k"]), other).await.reply;
        assert_eq!(String::from_utf8(reply.unwrap()).unwrap(), "$-1\r\n");
    }

    #[tokio::test]
    async fn test_exec_and_discard_require_multi() {
        let ctx = test_context();
        assert_eq!(run_str(&ctx, &["EXEC"]).await, "-ERR EXEC without MULTI\r\n");
        assert_eq!(
            run_str(&ctx, &["DISCARD"]).await,
            "-ERR DISCARD without MULTI\r\n"
        );
    }

    #[tokio::test]
    async fn test_nested_multi_is_rejected() {
        let ctx = test_context();
        run(&ctx, &["MULTI"]).await;
        assert_eq!(
            run_str(&ctx, &["MULTI"]).await,
            "-ERR MULTI calls can not be nested\r\n"
        );
    }

    #[tokio::test]
    async fn test_exec_with_empty_queue_returns_empty_array() {
        let ctx = test_context();
        run(&ctx, &["MULTI"]).await;
        assert_eq!(run_str(&ctx, &["EXEC"]).await, "*0\r\n");
    }

    #[tokio::test]
    async fn test_discard_drops_queued_commands() {
        let ctx = test_context();
        run(&ctx, &["MULTI"]).await;
        run(&ctx, &["SET", "k", "1"]).await;
        assert_eq!(run_str(&ctx, &["DISCARD"]).await, "+OK\r\n");
        assert_eq!(run_str(&ctx, &["GET", "k"]).await, "$-1\r\n");
    }

    #[tokio::test]
    async fn test_exec_propagates_queued_writes() {
        let ctx = test_context();
        run(&ctx, &["MULTI"]).await;
        let set = command(&["SET", "k", "1"]);
        let raw = set.raw.clone();
        dispatch(&ctx, set, CLIENT).await;
        let outcome = dispatch(&ctx, command(&["EXEC"]), CLIENT).await;
        assert_eq!(outcome.propagate, vec![raw]);
    }

    #[tokio::test]
    async fn test_replication_source_suppresses_replies() {
        let ctx = test_context();
        let outcome = dispatch(&ctx, command(&["SET", "k", "v"]), Source::Replication).await;
        assert!(outcome.reply.is_none());
        assert!(outcome.propagate.is_empty());
        // The write itself was applied
        assert_eq!(run_str(&ctx, &["GET", "k"]).await, "$1\r\nv\r\n");
    }

    #[tokio::test]
    async fn test_getack_answers_with_consumed_offset() {
        let ctx = test_context();
        ctx.replication.lock().await.offset = 37;
        let outcome = dispatch(
            &ctx,
            command(&["REPLCONF", "GETACK", "*"]),
            Source::Replication,
        )
        .await;
        let reply = String::from_utf8(outcome.reply.unwrap()).unwrap();
        assert_eq!(reply, "*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$2\r\n37\r\n");
    }

    #[tokio::test]
    async fn test_replconf_ack_feeds_waiters() {
        let ctx = test_context();
        let mut acks = ctx.acks.subscribe();
        let outcome = dispatch(&ctx, command(&["REPLCONF", "ACK", "42"]), CLIENT).await;
        assert!(outcome.reply.is_none());
        assert_eq!(acks.try_recv().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_replconf_handshake_subcommands_reply_ok() {
        let ctx = test_context();
        assert_eq!(
            run_str(&ctx, &["REPLCONF", "listening-port", "6380"]).await,
            "+OK\r\n"
        );
        assert_eq!(run_str(&ctx, &["REPLCONF", "capa", "psync2"]).await, "+OK\r\n");
    }

    #[tokio::test]
    async fn test_unknown_command_is_silent() {
        let ctx = test_context();
        assert!(run(&ctx, &["FROBNICATE", "x"]).await.is_none());
    }

    #[tokio::test]
    async fn test_verbs_are_case_insensitive() {
        let ctx = test_context();
        assert_eq!(run_str(&ctx, &["PiNg"]).await, "+PONG\r\n");
        assert_eq!(run_str(&ctx, &["sEt", "k", "V"]).await, "+OK\r\n");
        // Argument case is preserved
        assert_eq!(run_str(&ctx, &["get", "k"]).await, "$1\r\nV\r\n");
    }

    #[tokio::test]
    async fn test_command_docs_probe() {
        let ctx = test_context();
        assert_eq!(run_str(&ctx, &["COMMAND", "DOCS"]).await, "+PONG\r\n");
    }
}

//! RESP wire protocol codec
//!
//! Decodes one or more concatenated RESP frames from a byte buffer and
//! encodes the reply shapes the server produces. Every decoded frame
//! carries the number of bytes it consumed so the connection loop can
//! slice the exact wire bytes of a command; the leader forwards those
//! bytes verbatim to its replicas, which keeps replication offsets
//! byte-aligned on both sides.

use crate::errors::{ServerError, ServerResult};

/// Largest bulk-string length the decoder accepts. Anything bigger is
/// treated as garbage rather than a frame still in flight.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest element count the decoder accepts for an array frame. The
/// count comes off the wire, so it must be rejected before it sizes
/// an allocation.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// A decoded RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple string, `+...\r\n`
    Simple(String),
    /// Error string, `-...\r\n`
    Error(String),
    /// Signed integer, `:n\r\n`
    Integer(i64),
    /// Binary-safe bulk string, `$<len>\r\n<bytes>\r\n`
    Bulk(Vec<u8>),
    /// Null bulk, `$-1\r\n`
    NullBulk,
    /// Array of nested values, `*<count>\r\n...`
    Array(Vec<RespValue>),
}

/// A decoded top-level frame annotated with its consumed byte span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub value: RespValue,
    pub consumed: usize,
}

/// A client request extracted from a top-level array frame.
///
/// The verb is lowercased for dispatch; argument bytes keep their
/// original form and `raw` holds the frame exactly as received.
#[derive(Debug, Clone)]
pub struct Command {
    pub verb: String,
    pub args: Vec<String>,
    pub raw: Vec<u8>,
}

/// Decode as many complete top-level frames as the buffer holds.
///
/// Returns the frames in order together with the total number of bytes
/// they consumed; a trailing partial frame is left unconsumed for the
/// caller to complete with another read. Fails only on data that can
/// never become a valid frame.
pub fn decode_all(buf: &[u8]) -> ServerResult<(Vec<Frame>, usize)> {
    let mut frames = Vec::new();
    let mut consumed = 0;

    while consumed < buf.len() {
        match decode_one(&buf[consumed..]) {
            Ok(frame) => {
                consumed += frame.consumed;
                frames.push(frame);
            }
            Err(ServerError::Truncated) => break,
            Err(e) => return Err(e),
        }
    }

    Ok((frames, consumed))
}

/// Decode a single frame from the start of the buffer.
pub fn decode_one(buf: &[u8]) -> ServerResult<Frame> {
    let Some(&type_byte) = buf.first() else {
        return Err(ServerError::Truncated);
    };

    match type_byte {
        b'+' => decode_line(buf).map(|(s, n)| Frame {
            value: RespValue::Simple(s),
            consumed: n,
        }),
        b'-' => decode_line(buf).map(|(s, n)| Frame {
            value: RespValue::Error(s),
            consumed: n,
        }),
        b':' => decode_integer(buf),
        b'$' => decode_bulk(buf),
        b'*' => decode_array(buf),
        other => Err(ServerError::frame(format!(
            "unknown type byte 0x{other:02x}"
        ))),
    }
}

/// Find the first CRLF at or after `from`, or report truncation.
fn find_crlf(buf: &[u8], from: usize) -> ServerResult<usize> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Ok(i);
        }
        i += 1;
    }
    Err(ServerError::Truncated)
}

// Simple string / error: raw bytes up to the first CRLF.
fn decode_line(buf: &[u8]) -> ServerResult<(String, usize)> {
    let crlf = find_crlf(buf, 1)?;
    let line = String::from_utf8_lossy(&buf[1..crlf]).into_owned();
    Ok((line, crlf + 2))
}

fn decode_integer(buf: &[u8]) -> ServerResult<Frame> {
    let crlf = find_crlf(buf, 1)?;
    let digits = std::str::from_utf8(&buf[1..crlf])
        .map_err(|_| ServerError::frame("integer is not ASCII"))?;
    let value: i64 = digits
        .parse()
        .map_err(|_| ServerError::frame(format!("cannot parse integer '{digits}'")))?;
    Ok(Frame {
        value: RespValue::Integer(value),
        consumed: crlf + 2,
    })
}

// Decode the decimal length that follows a `$` or `*` type byte.
fn decode_length(buf: &[u8]) -> ServerResult<(i64, usize)> {
    let crlf = find_crlf(buf, 1)?;
    let digits = std::str::from_utf8(&buf[1..crlf])
        .map_err(|_| ServerError::frame("length is not ASCII"))?;
    let len: i64 = digits
        .parse()
        .map_err(|_| ServerError::frame(format!("cannot parse length '{digits}'")))?;
    Ok((len, crlf + 2))
}

fn decode_bulk(buf: &[u8]) -> ServerResult<Frame> {
    let (len, header) = decode_length(buf)?;

    if len == -1 {
        return Ok(Frame {
            value: RespValue::NullBulk,
            consumed: header,
        });
    }
    if len < 0 || len > MAX_BULK_LEN {
        return Err(ServerError::frame(format!("bulk length {len} out of range")));
    }

    let len = len as usize;
    if buf.len() < header + len + 2 {
        return Err(ServerError::Truncated);
    }
    if &buf[header + len..header + len + 2] != b"\r\n" {
        return Err(ServerError::frame("bulk string missing trailing CRLF"));
    }

    Ok(Frame {
        value: RespValue::Bulk(buf[header..header + len].to_vec()),
        consumed: header + len + 2,
    })
}

fn decode_array(buf: &[u8]) -> ServerResult<Frame> {
    let (count, header) = decode_length(buf)?;
    if count < 0 || count > MAX_ARRAY_LEN {
        return Err(ServerError::frame(format!("array count {count} out of range")));
    }

    let mut elements = Vec::with_capacity(count as usize);
    let mut consumed = header;
    for _ in 0..count {
        let element = decode_one(&buf[consumed..])?;
        consumed += element.consumed;
        elements.push(element.value);
    }

    Ok(Frame {
        value: RespValue::Array(elements),
        consumed,
    })
}

/// Encode a value back to its canonical wire form.
pub fn encode(value: &RespValue) -> Vec<u8> {
    match value {
        RespValue::Simple(s) => simple(s),
        RespValue::Error(s) => error(s),
        RespValue::Integer(n) => integer(*n),
        RespValue::Bulk(b) => bulk(b),
        RespValue::NullBulk => bulk_null(),
        RespValue::Array(items) => {
            let mut out = array_header(items.len());
            for item in items {
                out.extend(encode(item));
            }
            out
        }
    }
}

/// `+s\r\n`
pub fn simple(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

/// `-s\r\n`
pub fn error(s: &str) -> Vec<u8> {
    format!("-{s}\r\n").into_bytes()
}

/// `:n\r\n`
pub fn integer(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

/// `$<len>\r\n<bytes>\r\n`
pub fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

/// Bulk framing without the trailing CRLF. Used exclusively to deliver
/// the snapshot payload during full-resync.
pub fn bulk_no_trailer(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

/// `$-1\r\n`
pub fn bulk_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

/// `*<count>\r\n`
pub fn array_header(count: usize) -> Vec<u8> {
    format!("*{count}\r\n").into_bytes()
}

/// Encode a slice of strings as an array of bulk strings. This is the
/// request shape for every command the handshake sends.
pub fn string_array(items: &[&str]) -> Vec<u8> {
    let mut out = array_header(items.len());
    for item in items {
        out.extend(bulk(item.as_bytes()));
    }
    out
}

/// Extract `[verb, arg...]` from a decoded top-level frame.
///
/// The verb is lowercased; argument bytes are kept as received. `raw`
/// must be the wire bytes of exactly this frame.
pub fn extract_command(frame: &Frame, raw: &[u8]) -> Option<Command> {
    let RespValue::Array(elements) = &frame.value else {
        return None;
    };

    let mut parts = Vec::with_capacity(elements.len());
    for element in elements {
        match element {
            RespValue::Bulk(b) => parts.push(String::from_utf8_lossy(b).into_owned()),
            RespValue::Simple(s) => parts.push(s.clone()),
            _ => return None,
        }
    }

    let verb = parts.first()?.to_lowercase();
    Some(Command {
        verb,
        args: parts[1..].to_vec(),
        raw: raw.to_vec(),
    })
}

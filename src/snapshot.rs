//! Snapshot file decoder
//!
//! Parses the bit-packed, opcode-driven binary dump format into the
//! keyspace at startup. Only string values are supported; auxiliary
//! metadata is consumed and discarded. Records whose expiry already
//! passed are still inserted, because expiry is passive and the first
//! read drops them.
//!
//! The module also owns the fixed empty-snapshot payload a leader
//! sends during full-resync; snapshot writing is otherwise out of
//! scope.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::buffer::BufferReader;
use crate::errors::{ServerError, ServerResult};
use crate::store::Keyspace;

// Single-byte opcodes between records.
const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_EXPIRETIME_SECS: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

// Value type bytes. Only plain strings are recognised.
const TYPE_STRING: u8 = 0x00;

// Integer-encoded string variants selected by the low six bits when
// the length tag is 0b11.
const ENC_INT8: u8 = 0;
const ENC_INT16: u8 = 1;
const ENC_INT32: u8 = 2;
const ENC_INT64: u8 = 3;

/// The canonical empty dump, sent as the full-resync payload.
const EMPTY_SNAPSHOT_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a72656469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c000fff06e3bfec0ff5aa2";

/// Decoded length field: either a plain size or a marker selecting an
/// integer-encoded string.
enum Length {
    Plain(u64),
    Encoded(u8),
}

/// Byte payload of the empty snapshot used for full-resync.
pub fn empty_payload() -> Vec<u8> {
    hex::decode(EMPTY_SNAPSHOT_HEX).expect("embedded snapshot payload is valid hex")
}

/// Load the snapshot at `path` into `keyspace`, returning the number
/// of records inserted. A missing file is not an error; the keyspace
/// simply starts empty.
pub fn load_file(path: &Path, keyspace: &mut Keyspace) -> ServerResult<usize> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No snapshot file at {}, starting empty", path.display());
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };
    load_bytes(&bytes, keyspace)
}

/// Decode a complete snapshot image from memory into `keyspace`.
pub fn load_bytes(bytes: &[u8], keyspace: &mut Keyspace) -> ServerResult<usize> {
    let mut reader = BufferReader::new(bytes);

    // "REDIS" magic plus four ASCII version digits.
    let magic = reader.read_bytes(5)?;
    if magic != b"REDIS" {
        return Err(ServerError::snapshot("missing REDIS header magic"));
    }
    reader.skip(4)?;

    let mut loaded = 0;
    loop {
        let opcode = reader.read_u8()?;
        match opcode {
            OP_EOF => break,
            OP_AUX => {
                let field = read_string(&mut reader)?;
                let value = read_string(&mut reader)?;
                debug!("Snapshot aux field {field}={value}");
            }
            OP_SELECTDB => {
                // Single keyspace; the index is read and ignored.
                read_length(&mut reader)?;
            }
            OP_RESIZEDB => {
                read_length(&mut reader)?;
                read_length(&mut reader)?;
            }
            OP_EXPIRETIME_SECS => {
                let secs = reader.read_u32_le()?;
                let expires_at = UNIX_EPOCH + Duration::from_secs(secs as u64);
                read_record(&mut reader, keyspace, Some(expires_at))?;
                loaded += 1;
            }
            OP_EXPIRETIME_MS => {
                let millis = reader.read_u64_le()?;
                let expires_at = UNIX_EPOCH + Duration::from_millis(millis);
                read_record(&mut reader, keyspace, Some(expires_at))?;
                loaded += 1;
            }
            TYPE_STRING => {
                read_record_body(&mut reader, keyspace, None)?;
                loaded += 1;
            }
            other => {
                return Err(ServerError::snapshot(format!(
                    "unknown opcode 0x{other:02x} at offset {}",
                    reader.position() - 1
                )));
            }
        }
    }

    Ok(loaded)
}

// A record whose expiry prefix was already consumed: value-type byte,
// then key and value.
fn read_record(
    reader: &mut BufferReader,
    keyspace: &mut Keyspace,
    expires_at: Option<SystemTime>,
) -> ServerResult<()> {
    let value_type = reader.read_u8()?;
    if value_type != TYPE_STRING {
        return Err(ServerError::snapshot(format!(
            "unsupported value type 0x{value_type:02x}"
        )));
    }
    read_record_body(reader, keyspace, expires_at)
}

fn read_record_body(
    reader: &mut BufferReader,
    keyspace: &mut Keyspace,
    expires_at: Option<SystemTime>,
) -> ServerResult<()> {
    let key = read_string(reader)?;
    let value = read_string(reader)?;
    keyspace.insert_record(key, value, expires_at);
    Ok(())
}

// Length field: the top two bits of the first byte select the width.
fn read_length(reader: &mut BufferReader) -> ServerResult<Length> {
    let first = reader.read_u8()?;
    match first >> 6 {
        0b00 => Ok(Length::Plain((first & 0x3F) as u64)),
        0b01 => {
            let second = reader.read_u8()?;
            Ok(Length::Plain((((first & 0x3F) as u64) << 8) | second as u64))
        }
        0b10 => Ok(Length::Plain(reader.read_u32_be()? as u64)),
        _ => Ok(Length::Encoded(first & 0x3F)),
    }
}

// String field: plain length-prefixed bytes, or an integer rendered
// back to its decimal text.
fn read_string(reader: &mut BufferReader) -> ServerResult<String> {
    match read_length(reader)? {
        Length::Plain(len) => {
            let bytes = reader.read_bytes(len as usize)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        Length::Encoded(ENC_INT8) => Ok(reader.read_i8()?.to_string()),
        Length::Encoded(ENC_INT16) => Ok(reader.read_i16_le()?.to_string()),
        Length::Encoded(ENC_INT32) => Ok(reader.read_i32_le()?.to_string()),
        Length::Encoded(ENC_INT64) => Err(ServerError::I64NotSupported),
        Length::Encoded(other) => Err(ServerError::snapshot(format!(
            "unknown string encoding 0x{other:02x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal snapshot builder used by the tests below.
    struct SnapshotBuilder {
        bytes: Vec<u8>,
    }

    impl SnapshotBuilder {
        fn new() -> Self {
            Self {
                bytes: b"REDIS0011".to_vec(),
            }
        }

        fn aux(mut self, field: &str, value: &str) -> Self {
            self.bytes.push(OP_AUX);
            self.push_string(field);
            self.push_string(value);
            self
        }

        fn select_db(mut self, index: u8) -> Self {
            self.bytes.extend([OP_SELECTDB, index]);
            self
        }

        fn resize_db(mut self, hash: u8, expires: u8) -> Self {
            self.bytes.extend([OP_RESIZEDB, hash, expires]);
            self
        }

        fn record(mut self, key: &str, value: &str) -> Self {
            self.bytes.push(TYPE_STRING);
            self.push_string(key);
            self.push_string(value);
            self
        }

        fn record_expiring_ms(mut self, key: &str, value: &str, millis: u64) -> Self {
            self.bytes.push(OP_EXPIRETIME_MS);
            self.bytes.extend(millis.to_le_bytes());
            self.record(key, value)
        }

        fn record_expiring_secs(mut self, key: &str, value: &str, secs: u32) -> Self {
            self.bytes.push(OP_EXPIRETIME_SECS);
            self.bytes.extend(secs.to_le_bytes());
            self.record(key, value)
        }

        fn raw(mut self, bytes: &[u8]) -> Self {
            self.bytes.extend_from_slice(bytes);
            self
        }

        fn finish(mut self) -> Vec<u8> {
            self.bytes.push(OP_EOF);
            self.bytes
        }

        fn push_string(&mut self, s: &str) {
            assert!(s.len() < 64);
            self.bytes.push(s.len() as u8);
            self.bytes.extend_from_slice(s.as_bytes());
        }
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    #[test]
    fn test_load_plain_records() {
        let image = SnapshotBuilder::new()
            .aux("redis-ver", "7.2.0")
            .select_db(0)
            .resize_db(2, 0)
            .record("foo", "bar")
            .record("baz", "qux")
            .finish();

        let mut keyspace = Keyspace::new();
        assert_eq!(load_bytes(&image, &mut keyspace).unwrap(), 2);
        assert_eq!(keyspace.get("foo"), Some("bar".to_string()));
        assert_eq!(keyspace.get("baz"), Some("qux".to_string()));
    }

    #[test]
    fn test_load_record_with_live_expiry() {
        let image = SnapshotBuilder::new()
            .record_expiring_ms("k", "v", now_millis() + 60_000)
            .finish();

        let mut keyspace = Keyspace::new();
        load_bytes(&image, &mut keyspace).unwrap();
        assert_eq!(keyspace.get("k"), Some("v".to_string()));
    }

    #[test]
    fn test_expired_record_is_inserted_then_dropped_on_read() {
        let image = SnapshotBuilder::new()
            .record_expiring_ms("old", "v", 1_000)
            .record_expiring_secs("older", "v", 1)
            .finish();

        let mut keyspace = Keyspace::new();
        assert_eq!(load_bytes(&image, &mut keyspace).unwrap(), 2);
        // Inserted despite the past deadline
        assert_eq!(keyspace.len(), 2);
        // First read removes them
        assert_eq!(keyspace.get("old"), None);
        assert_eq!(keyspace.get("older"), None);
        assert_eq!(keyspace.len(), 0);
    }

    #[test]
    fn test_fourteen_bit_length() {
        // 0b01 tag: low six bits of byte 0, then byte 1, big-endian
        let mut image = SnapshotBuilder::new().finish();
        let eof = image.pop().unwrap();
        image.push(TYPE_STRING);
        image.extend([0x40 | 0x01, 0x2C]); // 300
        image.extend(std::iter::repeat_n(b'x', 300));
        image.extend([0x03]);
        image.extend_from_slice(b"val");
        image.push(eof);

        let mut keyspace = Keyspace::new();
        assert_eq!(load_bytes(&image, &mut keyspace).unwrap(), 1);
        assert_eq!(keyspace.get(&"x".repeat(300)), Some("val".to_string()));
    }

    #[test]
    fn test_integer_encoded_strings() {
        let image = SnapshotBuilder::new()
            .raw(&[TYPE_STRING, 0x01, b'a', 0xC0, 0x7B]) // i8: 123
            .raw(&[TYPE_STRING, 0x01, b'b', 0xC1, 0x39, 0x30]) // i16 LE: 12345
            .raw(&[TYPE_STRING, 0x01, b'c', 0xC2, 0x40, 0xE2, 0x01, 0x00]) // i32 LE: 123456
            .finish();

        let mut keyspace = Keyspace::new();
        assert_eq!(load_bytes(&image, &mut keyspace).unwrap(), 3);
        assert_eq!(keyspace.get("a"), Some("123".to_string()));
        assert_eq!(keyspace.get("b"), Some("12345".to_string()));
        assert_eq!(keyspace.get("c"), Some("123456".to_string()));
    }

    #[test]
    fn test_i64_encoding_is_unsupported() {
        let image = SnapshotBuilder::new()
            .raw(&[TYPE_STRING, 0x01, b'a', 0xC3, 0, 0, 0, 0, 0, 0, 0, 0])
            .finish();

        let mut keyspace = Keyspace::new();
        assert!(matches!(
            load_bytes(&image, &mut keyspace),
            Err(ServerError::I64NotSupported)
        ));
    }

    #[test]
    fn test_unknown_opcode_is_corrupt() {
        let image = SnapshotBuilder::new().raw(&[0xF0]).finish();
        let mut keyspace = Keyspace::new();
        assert!(matches!(
            load_bytes(&image, &mut keyspace),
            Err(ServerError::Snapshot { .. })
        ));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let mut keyspace = Keyspace::new();
        assert!(load_bytes(b"RUBIS0011\xFF", &mut keyspace).is_err());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let mut keyspace = Keyspace::new();
        let loaded =
            load_file(Path::new("/nonexistent/dir/dump.rdb"), &mut keyspace).unwrap();
        assert_eq!(loaded, 0);
        assert!(keyspace.is_empty());
    }

    #[test]
    fn test_empty_payload_decodes_to_empty_keyspace() {
        let payload = empty_payload();
        assert_eq!(&payload[..9], b"REDIS0011");

        let mut keyspace = Keyspace::new();
        assert_eq!(load_bytes(&payload, &mut keyspace).unwrap(), 0);
        assert!(keyspace.is_empty());
    }
}

//! Ordered append-only streams with structured IDs
//!
//! A stream entry is addressed by a `<ms>-<seq>` ID that must be
//! strictly increasing across the whole store. Each stream carries a
//! single-slot broadcast notifier that wakes blocking readers on
//! append; the notifier is allowed to drop wake-ups because readers
//! re-scan the entry order after every wake.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by stream operations. The display strings are the
/// exact texts sent back to clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    IdZero,
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    NotMonotone,
    #[error("ERR Invalid stream ID specified as stream command argument")]
    InvalidId,
}

/// A stream entry ID: milliseconds part and sequence part, ordered by
/// `(ms, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    /// Parse the canonical `<ms>-<seq>` text form.
    pub fn parse(text: &str) -> Result<StreamId, StreamError> {
        let (ms, seq) = text.split_once('-').ok_or(StreamError::InvalidId)?;
        Ok(StreamId {
            ms: ms.parse().map_err(|_| StreamError::InvalidId)?,
            seq: seq.parse().map_err(|_| StreamError::InvalidId)?,
        })
    }

    /// Parse a range bound for XRANGE. `-` and `+` are the open
    /// sentinels; a bare `<ms>` covers the whole millisecond, so it
    /// resolves to seq 0 at the start of a range and seq MAX at the
    /// end.
    pub fn parse_bound(text: &str, is_start: bool) -> Result<StreamId, StreamError> {
        match text {
            "-" => Ok(StreamId::ZERO),
            "+" => Ok(StreamId::MAX),
            _ if text.contains('-') => StreamId::parse(text),
            _ => {
                let ms = text.parse().map_err(|_| StreamError::InvalidId)?;
                let seq = if is_start { 0 } else { u64::MAX };
                Ok(StreamId { ms, seq })
            }
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

// How the ID argument of XADD asks for its ID to be produced.
enum IdSpec {
    /// `*`: current wall-clock milliseconds, sequence auto-picked.
    Auto,
    /// `<ms>-*`: fixed milliseconds, sequence auto-picked.
    AutoSeq(u64),
    /// `<ms>-<seq>`: used verbatim.
    Explicit(StreamId),
}

impl IdSpec {
    fn parse(text: &str) -> Result<IdSpec, StreamError> {
        if text == "*" {
            return Ok(IdSpec::Auto);
        }
        if let Some(ms) = text.strip_suffix("-*") {
            let ms = ms.parse().map_err(|_| StreamError::InvalidId)?;
            return Ok(IdSpec::AutoSeq(ms));
        }
        StreamId::parse(text).map(IdSpec::Explicit)
    }
}

/// A single entry in a stream. Fields keep the exact sequence they
/// were supplied in, repeated names included, because range reads
/// must reproduce every pair in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

/// One named stream: entries by ID text, append order, and the
/// notifier that wakes blocking readers.
#[derive(Debug)]
pub struct Stream {
    entries: HashMap<String, StreamEntry>,
    order: Vec<String>,
    notifier: broadcast::Sender<String>,
}

impl Stream {
    fn new() -> Self {
        // Single-slot channel; late readers re-scan instead of
        // replaying missed appends.
        let (notifier, _) = broadcast::channel(1);
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            notifier,
        }
    }

    // Highest existing sequence for `ms`, if any entry carries it.
    fn last_seq_for_ms(&self, ms: u64) -> Option<u64> {
        self.order
            .iter()
            .rev()
            .filter_map(|text| StreamId::parse(text).ok())
            .find(|id| id.ms == ms)
            .map(|id| id.seq)
    }
}

/// All streams plus the store-wide high-water ID used by XADD
/// validation and by `$` in XREAD.
#[derive(Debug)]
pub struct StreamStore {
    streams: HashMap<String, Stream>,
    last_id: String,
}

impl Default for StreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStore {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            last_id: "0-0".to_string(),
        }
    }

    /// ID of the most recent entry appended to any stream.
    pub fn last_id(&self) -> &str {
        &self.last_id
    }

    pub fn contains(&self, key: &str) -> bool {
        self.streams.contains_key(key)
    }

    /// Append an entry to `key`, resolving `id_text` per the XADD
    /// rules. Returns the resolved ID text.
    pub fn add(
        &mut self,
        key: &str,
        id_text: &str,
        fields: Vec<(String, String)>,
    ) -> Result<String, StreamError> {
        let spec = IdSpec::parse(id_text)?;
        let stream = self.streams.entry(key.to_string()).or_insert_with(Stream::new);

        let id = match spec {
            IdSpec::Explicit(id) => id,
            IdSpec::Auto => {
                let ms = chrono::Utc::now().timestamp_millis() as u64;
                StreamId {
                    ms,
                    seq: next_seq(stream, ms),
                }
            }
            IdSpec::AutoSeq(ms) => StreamId {
                ms,
                seq: next_seq(stream, ms),
            },
        };

        if id == StreamId::ZERO {
            return Err(StreamError::IdZero);
        }
        let last = StreamId::parse(&self.last_id).unwrap_or(StreamId::ZERO);
        if id <= last {
            return Err(StreamError::NotMonotone);
        }

        let id_text = id.to_string();
        stream.entries.insert(
            id_text.clone(),
            StreamEntry {
                id: id_text.clone(),
                fields,
            },
        );
        stream.order.push(id_text.clone());
        self.last_id = id_text.clone();

        // Wake any blocking reader; nobody listening is fine.
        let _ = stream.notifier.send(id_text.clone());

        Ok(id_text)
    }

    /// Entries of `key` with ID in `[start, end]`, inclusive.
    pub fn range(&self, key: &str, start: StreamId, end: StreamId) -> Vec<StreamEntry> {
        let Some(stream) = self.streams.get(key) else {
            return Vec::new();
        };
        stream
            .order
            .iter()
            .filter(|text| {
                StreamId::parse(text).is_ok_and(|id| id >= start && id <= end)
            })
            .filter_map(|text| stream.entries.get(text).cloned())
            .collect()
    }

    /// Entries of `key` with ID strictly greater than `after`.
    pub fn entries_after(&self, key: &str, after: StreamId) -> Vec<StreamEntry> {
        let Some(stream) = self.streams.get(key) else {
            return Vec::new();
        };
        stream
            .order
            .iter()
            .filter(|text| StreamId::parse(text).is_ok_and(|id| id > after))
            .filter_map(|text| stream.entries.get(text).cloned())
            .collect()
    }

    /// Subscribe to append notifications for `key`, creating the
    /// stream when it does not exist yet so blocking readers have a
    /// notifier to park on.
    pub fn subscribe(&mut self, key: &str) -> broadcast::Receiver<String> {
        self.streams
            .entry(key.to_string())
            .or_insert_with(Stream::new)
            .notifier
            .subscribe()
    }
}

// Sequence auto-generation: one past the highest existing sequence for
// `ms` in this stream; with no prior entry at `ms`, 1 when ms is 0
// (0-0 is reserved) and 0 otherwise.
fn next_seq(stream: &Stream, ms: u64) -> u64 {
    match stream.last_seq_for_ms(ms) {
        Some(seq) => seq + 1,
        None if ms == 0 => 1,
        None => 0,
    }
}

//! Keyed string store with per-key expiry
//!
//! Expiry is passive: an expired record is dropped the first time it is
//! read, never by a background sweeper. Callers therefore go through
//! the accessors here instead of touching the map directly.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Value stored in the keyspace.
#[derive(Debug, Clone)]
pub struct Record {
    pub value: String,
    /// Deadline after which the record is treated as absent.
    pub expires_at: Option<SystemTime>,
}

impl Record {
    fn is_expired(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(deadline) => now > deadline,
            None => false,
        }
    }
}

/// In-memory key/value store.
#[derive(Debug, Default)]
pub struct Keyspace {
    records: HashMap<String, Record>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Replace any prior record under `key`. `ttl` of `None` stores the
    /// value without expiry.
    pub fn set(&mut self, key: String, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| SystemTime::now() + d);
        self.records.insert(key, Record { value, expires_at });
    }

    /// Insert a record with an absolute expiry deadline, as decoded
    /// from a snapshot file. Deadlines already in the past are inserted
    /// anyway; the first read removes them.
    pub fn insert_record(&mut self, key: String, value: String, expires_at: Option<SystemTime>) {
        self.records.insert(key, Record { value, expires_at });
    }

    /// Look up `key`, dropping it first if it has expired.
    pub fn get(&mut self, key: &str) -> Option<String> {
        if self.expire_if_due(key) {
            return None;
        }
        self.records.get(key).map(|r| r.value.clone())
    }

    /// Whether `key` currently holds a live record.
    pub fn contains(&mut self, key: &str) -> bool {
        !self.expire_if_due(key) && self.records.contains_key(key)
    }

    /// Increment the integer stored at `key`, creating it as `1` when
    /// absent. Returns `None` when the current value is not an integer.
    /// Any expiry on the record is preserved.
    pub fn incr(&mut self, key: &str) -> Option<i64> {
        if self.expire_if_due(key) || !self.records.contains_key(key) {
            self.records.insert(
                key.to_string(),
                Record {
                    value: "1".to_string(),
                    expires_at: None,
                },
            );
            return Some(1);
        }

        let record = self.records.get_mut(key)?;
        let current: i64 = record.value.parse().ok()?;
        let next = current.checked_add(1)?;
        record.value = next.to_string();
        Some(next)
    }

    /// All currently live keys, in no particular order.
    pub fn keys(&mut self) -> Vec<String> {
        let now = SystemTime::now();
        self.records.retain(|_, record| !record.is_expired(now));
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // Removes the record when its deadline has passed. Returns true if
    // a removal happened.
    fn expire_if_due(&mut self, key: &str) -> bool {
        let now = SystemTime::now();
        if self.records.get(key).is_some_and(|r| r.is_expired(now)) {
            self.records.remove(key);
            return true;
        }
        false
    }
}

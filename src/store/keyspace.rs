//! The keyspace: a key-to-entry map with lazy expiry
//!
//! Expired string entries are treated as absent by every read and evicted
//! when a read touches them; there is no background sweep.

use crate::common::{timestamp_now_millis, Error, Result};
use crate::rdb::Snapshot;
use crate::store::entry::{Entry, StreamId, StreamItem};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct KeySpace {
    entries: HashMap<String, Entry>,
}

impl KeySpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from a decoded snapshot. Only the first database section
    /// is loaded.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut keyspace = Self::new();
        if let Some(db) = snapshot.databases.first() {
            for (key, value) in &db.values {
                keyspace.entries.insert(
                    key.clone(),
                    Entry::String {
                        value: value.value.clone(),
                        expires_at: value.expires_at,
                    },
                );
            }
        }
        keyspace
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// String value for key, None if absent, expired, or not a string
    pub fn get(&mut self, key: &str) -> Option<String> {
        match self.live_entry(key)? {
            Entry::String { value, .. } => Some(value.clone()),
            Entry::Stream { .. } => None,
        }
    }

    /// Insert or replace a string entry, with an optional TTL
    pub fn set(&mut self, key: &str, value: &str, ttl_ms: Option<u64>) {
        let expires_at = ttl_ms.map(|ttl| timestamp_now_millis() + ttl);
        self.entries.insert(
            key.to_string(),
            Entry::String {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    /// All non-expired keys, in no particular order
    pub fn keys(&self) -> Vec<String> {
        let now = timestamp_now_millis();
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn type_of(&mut self, key: &str) -> &'static str {
        match self.live_entry(key) {
            Some(entry) => entry.type_name(),
            None => "none",
        }
    }

    /// Append an item to a stream, creating the stream if the key is
    /// absent (or holds an expired string).
    pub fn xadd(
        &mut self,
        key: &str,
        id_spec: &str,
        fields: Vec<(String, String)>,
    ) -> Result<StreamId> {
        let now = timestamp_now_millis() as i64;
        let last = match self.live_entry(key) {
            Some(Entry::Stream { items }) => items.last().map(|item| item.id),
            Some(Entry::String { .. }) => return Err(Error::WrongType),
            None => None,
        };

        let id = resolve_stream_id(id_spec, last, now)?;
        if id == StreamId::MIN {
            return Err(Error::StreamIdZero);
        }
        if let Some(last) = last {
            if id <= last {
                return Err(Error::StreamIdTooSmall);
            }
        }

        // live_entry evicted any expired string, so the slot is either
        // vacant or already a stream
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert(Entry::Stream { items: Vec::new() });
        if let Entry::Stream { items } = entry {
            items.push(StreamItem { id, fields });
        }
        Ok(id)
    }

    /// Items whose ids fall within the given bound specs, in stream order
    pub fn xrange(&mut self, key: &str, lower: &str, upper: &str) -> Result<Vec<StreamItem>> {
        let (lo, lo_exclusive) = parse_range_bound(lower, false)?;
        let (hi, hi_exclusive) = parse_range_bound(upper, true)?;

        let items = match self.live_entry(key) {
            Some(Entry::Stream { items }) => items,
            Some(Entry::String { .. }) => return Err(Error::WrongType),
            None => return Ok(Vec::new()),
        };

        Ok(items
            .iter()
            .filter(|item| {
                let above = if lo_exclusive {
                    item.id > lo
                } else {
                    item.id >= lo
                };
                let below = if hi_exclusive {
                    item.id < hi
                } else {
                    item.id <= hi
                };
                above && below
            })
            .cloned()
            .collect())
    }

    /// Last id of the stream at key, or the minimum id when there is none.
    /// Used to resolve `$` in XREAD at call time.
    pub fn last_stream_id(&mut self, key: &str) -> StreamId {
        match self.live_entry(key) {
            Some(Entry::Stream { items }) => {
                items.last().map(|item| item.id).unwrap_or(StreamId::MIN)
            }
            _ => StreamId::MIN,
        }
    }

    /// Items strictly after the given id (the XREAD read position)
    pub fn read_after(&mut self, key: &str, after: StreamId) -> Vec<StreamItem> {
        match self.live_entry(key) {
            Some(Entry::Stream { items }) => items
                .iter()
                .filter(|item| item.id > after)
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Non-expired entry for key, evicting an expired one on the way
    fn live_entry(&mut self, key: &str) -> Option<&Entry> {
        let now = timestamp_now_millis();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key)
    }
}

/// Resolve an XADD id spec against the stream's current last id.
fn resolve_stream_id(spec: &str, last: Option<StreamId>, now_ms: i64) -> Result<StreamId> {
    if spec == "*" {
        return Ok(StreamId::new(now_ms, 0));
    }
    if let Some(ms_part) = spec.strip_suffix("-*") {
        let ms: i64 = ms_part.parse().map_err(|_| Error::InvalidStreamId)?;
        if ms < 0 {
            return Err(Error::InvalidStreamId);
        }
        let seq = match last {
            Some(last) if last.ms == ms => last.seq + 1,
            _ if ms == 0 => 1,
            _ => 0,
        };
        return Ok(StreamId::new(ms, seq));
    }
    StreamId::parse(spec)
}

/// Parse an XRANGE bound spec: `-`/`+` open ends, bare `<ms>` covering the
/// whole millisecond, full `<ms>-<seq>`, optional `(` for exclusive.
fn parse_range_bound(spec: &str, upper: bool) -> Result<(StreamId, bool)> {
    match spec {
        "-" => return Ok((StreamId::MIN, false)),
        "+" => return Ok((StreamId::new(i64::MAX, i64::MAX), false)),
        _ => {}
    }
    let (body, exclusive) = match spec.strip_prefix('(') {
        Some(body) => (body, true),
        None => (spec, false),
    };
    let id = if body.contains('-') {
        StreamId::parse(body)?
    } else {
        let ms: i64 = body.parse().map_err(|_| Error::InvalidStreamId)?;
        if ms < 0 {
            return Err(Error::InvalidStreamId);
        }
        // A bare millisecond matches its full sequence range
        if upper {
            StreamId::new(ms, i64::MAX)
        } else {
            StreamId::new(ms, 0)
        }
    };
    Ok((id, exclusive))
}

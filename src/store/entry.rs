//! Keyed entries: plain strings with optional expiry, and append-only
//! streams ordered by a composite id.

use crate::common::{Error, Result};

/// Composite stream item id, ordered by milliseconds then sequence.
///
/// Ordering is exact integer comparison; `(0,0)` is the minimum and is
/// never a valid id for insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: i64,
    pub seq: i64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: i64, seq: i64) -> Self {
        Self { ms, seq }
    }

    /// Parse `<ms>-<seq>`, or a bare `<ms>` with the sequence defaulting
    /// to zero.
    pub fn parse(s: &str) -> Result<Self> {
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (
                ms.parse().map_err(|_| Error::InvalidStreamId)?,
                seq.parse().map_err(|_| Error::InvalidStreamId)?,
            ),
            None => (s.parse().map_err(|_| Error::InvalidStreamId)?, 0),
        };
        if ms < 0 || seq < 0 {
            return Err(Error::InvalidStreamId);
        }
        Ok(Self { ms, seq })
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// One appended stream item: id plus field/value pairs in insertion order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamItem {
    pub id: StreamId,
    pub fields: Vec<(String, String)>,
}

/// A key's value
#[derive(Debug, Clone)]
pub enum Entry {
    String {
        value: String,
        /// Absolute expiry, Unix milliseconds. None means no expiry.
        expires_at: Option<u64>,
    },
    /// Items strictly increasing by id; violating appends are rejected
    Stream { items: Vec<StreamItem> },
}

impl Entry {
    /// Streams never expire; strings expire once `now_ms` reaches their
    /// deadline.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self {
            Entry::String {
                expires_at: Some(at),
                ..
            } => now_ms >= *at,
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Entry::String { .. } => "string",
            Entry::Stream { .. } => "stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_ordering() {
        assert!(StreamId::new(1, 0) > StreamId::MIN);
        assert!(StreamId::new(5, 1) > StreamId::new(5, 0));
        assert!(StreamId::new(6, 0) > StreamId::new(5, 99));
        assert_eq!(StreamId::new(3, 7), StreamId::new(3, 7));
    }

    #[test]
    fn test_stream_id_parse_and_display() {
        assert_eq!(StreamId::parse("5-3").unwrap(), StreamId::new(5, 3));
        assert_eq!(StreamId::parse("1526919030474-55").unwrap().seq, 55);
        assert_eq!(StreamId::parse("7").unwrap(), StreamId::new(7, 0));
        assert_eq!(StreamId::new(5, 3).to_string(), "5-3");

        assert!(StreamId::parse("abc").is_err());
        assert!(StreamId::parse("5-x").is_err());
        assert!(StreamId::parse("-1-0").is_err());
    }

    #[test]
    fn test_entry_expiry() {
        let entry = Entry::String {
            value: "v".into(),
            expires_at: Some(1000),
        };
        assert!(!entry.is_expired(999));
        assert!(entry.is_expired(1000));
        assert!(entry.is_expired(5000));

        let no_ttl = Entry::String {
            value: "v".into(),
            expires_at: None,
        };
        assert!(!no_ttl.is_expired(u64::MAX));

        let stream = Entry::Stream { items: Vec::new() };
        assert!(!stream.is_expired(u64::MAX));
    }
}

//! Typed RESP messages and their canonical byte encodings
//!
//! Every variant serializes deterministically. `RawPayload` is the one
//! deliberate deviation from bulk-string framing: it carries the inline
//! snapshot transferred during a full resync and is written as
//! `$<len>\r\n<bytes>` with no trailing CRLF.

/// Leading bytes of a snapshot payload, used to tell an inline snapshot
/// transfer apart from an ordinary bulk string on the same connection.
pub const SNAPSHOT_MAGIC: &[u8; 5] = b"REDIS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(String),
    /// Absence marker, `$-1\r\n` on the wire
    NullBulkString,
    Array(Vec<Message>),
    /// Binary snapshot body for the full-resync transfer
    RawPayload(Vec<u8>),
}

impl Message {
    /// Build the common command shape: an array of bulk strings
    pub fn command(parts: &[&str]) -> Message {
        Message::Array(
            parts
                .iter()
                .map(|p| Message::BulkString(p.to_string()))
                .collect(),
        )
    }

    /// Canonical wire encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Message::SimpleString(s) => {
                out.extend_from_slice(format!("+{}\r\n", s).as_bytes());
            }
            Message::Error(s) => {
                out.extend_from_slice(format!("-{}\r\n", s).as_bytes());
            }
            Message::Integer(n) => {
                out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
            }
            Message::BulkString(s) => {
                out.extend_from_slice(format!("${}\r\n", s.len()).as_bytes());
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Message::NullBulkString => {
                out.extend_from_slice(b"$-1\r\n");
            }
            Message::Array(values) => {
                out.extend_from_slice(format!("*{}\r\n", values.len()).as_bytes());
                for value in values {
                    value.write_to(out);
                }
            }
            Message::RawPayload(bytes) => {
                // No trailing CRLF: the payload length alone delimits it.
                out.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    /// Byte length of the canonical encoding. Replica offset bookkeeping
    /// depends on this matching `to_bytes().len()` exactly.
    pub fn encoded_len(&self) -> usize {
        self.to_bytes().len()
    }

    /// The text of a bulk string, if this is one
    pub fn as_bulk(&self) -> Option<&str> {
        match self {
            Message::BulkString(s) => Some(s),
            _ => None,
        }
    }

    /// Is this message a `REPLCONF GETACK *` probe?
    pub fn is_getack_probe(&self) -> bool {
        let Message::Array(values) = self else {
            return false;
        };
        let verbs: Vec<_> = values.iter().filter_map(|v| v.as_bulk()).collect();
        verbs.len() >= 2
            && verbs[0].eq_ignore_ascii_case("replconf")
            && verbs[1].eq_ignore_ascii_case("getack")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_string_encoding() {
        assert_eq!(Message::SimpleString("OK".into()).to_bytes(), b"+OK\r\n");
        assert_eq!(Message::SimpleString("PONG".into()).to_bytes(), b"+PONG\r\n");
    }

    #[test]
    fn test_error_encoding() {
        assert_eq!(
            Message::Error("ERR oops".into()).to_bytes(),
            b"-ERR oops\r\n"
        );
    }

    #[test]
    fn test_integer_encoding() {
        assert_eq!(Message::Integer(42).to_bytes(), b":42\r\n");
        assert_eq!(Message::Integer(-1).to_bytes(), b":-1\r\n");
    }

    #[test]
    fn test_bulk_string_encoding() {
        assert_eq!(
            Message::BulkString("hello".into()).to_bytes(),
            b"$5\r\nhello\r\n"
        );
        assert_eq!(Message::BulkString(String::new()).to_bytes(), b"$0\r\n\r\n");
        assert_eq!(Message::NullBulkString.to_bytes(), b"$-1\r\n");
    }

    #[test]
    fn test_array_encoding() {
        let msg = Message::command(&["ECHO", "hey"]);
        assert_eq!(msg.to_bytes(), b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n");
    }

    #[test]
    fn test_raw_payload_has_no_trailing_crlf() {
        let payload = b"REDIS0011\xff\x00\x00\x00\x00\x00\x00\x00\x00".to_vec();
        let bytes = Message::RawPayload(payload.clone()).to_bytes();
        let header = format!("${}\r\n", payload.len());
        assert_eq!(&bytes[..header.len()], header.as_bytes());
        assert_eq!(&bytes[header.len()..], &payload[..]);
        assert!(!bytes.ends_with(b"\r\n"));
    }

    #[test]
    fn test_encoded_len_matches_bytes() {
        let messages = [
            Message::SimpleString("FULLRESYNC abc 0".into()),
            Message::command(&["SET", "foo", "bar"]),
            Message::NullBulkString,
            Message::Integer(7),
        ];
        for msg in messages {
            assert_eq!(msg.encoded_len(), msg.to_bytes().len());
        }
    }

    #[test]
    fn test_getack_probe_detection() {
        assert!(Message::command(&["REPLCONF", "GETACK", "*"]).is_getack_probe());
        assert!(Message::command(&["replconf", "getack", "*"]).is_getack_probe());
        assert!(!Message::command(&["REPLCONF", "ACK", "12"]).is_getack_probe());
        assert!(!Message::command(&["SET", "foo", "bar"]).is_getack_probe());
        assert!(!Message::SimpleString("REPLCONF".into()).is_getack_probe());
    }
}

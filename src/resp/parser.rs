//! RESP decoding
//!
//! Two layers: a pure cursor decoder over `(&[u8], position)` that can be
//! tested at arbitrary offsets, and [`RespParser`], which feeds the decoder
//! from a live connection in chunks and hands back one message per call.
//!
//! Buffer exhaustion surfaces as [`Error::Incomplete`] so a message split
//! across reads is retried, not treated as corruption. Malformed bytes are
//! a fatal [`Error::Protocol`] for that connection.

use crate::common::{Error, Result};
use crate::resp::message::{Message, SNAPSHOT_MAGIC};
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Decode one message starting at `pos`.
///
/// Returns the new cursor position alongside the message. An unrecognized
/// leading byte is not an error: it yields `None` and advances one byte,
/// so stray inline bytes never kill the connection.
pub fn decode(buf: &[u8], pos: usize) -> Result<(Option<Message>, usize)> {
    match buf.get(pos) {
        None => Err(Error::Incomplete),
        Some(b'+') => {
            let (text, next) = read_line(buf, pos + 1)?;
            Ok((Some(Message::SimpleString(text.to_string())), next))
        }
        Some(b'-') => {
            let (text, next) = read_line(buf, pos + 1)?;
            Ok((Some(Message::Error(text.to_string())), next))
        }
        Some(b':') => {
            let (text, next) = read_line(buf, pos + 1)?;
            let n = text
                .parse::<i64>()
                .map_err(|_| Error::Protocol(format!("invalid integer: {}", text)))?;
            Ok((Some(Message::Integer(n)), next))
        }
        Some(b'$') => decode_bulk(buf, pos),
        Some(b'*') => decode_array(buf, pos),
        Some(_) => Ok((None, pos + 1)),
    }
}

fn decode_bulk(buf: &[u8], pos: usize) -> Result<(Option<Message>, usize)> {
    let (token, body) = read_line(buf, pos + 1)?;
    if token == "-1" {
        return Ok((Some(Message::NullBulkString), body));
    }
    let len = token
        .parse::<usize>()
        .map_err(|_| Error::Protocol(format!("invalid bulk string length: {}", token)))?;

    if buf.len() < body + len {
        return Err(Error::Incomplete);
    }
    let payload = &buf[body..body + len];

    // An inline full-resync snapshot rides the same connection framed like
    // a bulk string, but carries raw bytes and no trailing CRLF.
    if payload.starts_with(SNAPSHOT_MAGIC) {
        return Ok((Some(Message::RawPayload(payload.to_vec())), body + len));
    }

    if buf.len() < body + len + 2 {
        return Err(Error::Incomplete);
    }
    if &buf[body + len..body + len + 2] != b"\r\n" {
        return Err(Error::Protocol(
            "bulk string does not end with CRLF".to_string(),
        ));
    }
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::Protocol("invalid UTF-8 in bulk string".to_string()))?;
    Ok((Some(Message::BulkString(text.to_string())), body + len + 2))
}

fn decode_array(buf: &[u8], pos: usize) -> Result<(Option<Message>, usize)> {
    let (token, mut cursor) = read_line(buf, pos + 1)?;
    let count = token
        .parse::<usize>()
        .map_err(|_| Error::Protocol(format!("invalid array length: {}", token)))?;

    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let (msg, next) = decode(buf, cursor)?;
        cursor = next;
        // Unparseable inline bytes are skipped, not fatal
        if let Some(msg) = msg {
            values.push(msg);
        }
    }
    Ok((Some(Message::Array(values)), cursor))
}

/// Text up to the next CRLF, plus the cursor past it
fn read_line(buf: &[u8], from: usize) -> Result<(&str, usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            let text = std::str::from_utf8(&buf[from..i])
                .map_err(|_| Error::Protocol("invalid UTF-8 in frame".to_string()))?;
            return Ok((text, i + 2));
        }
        i += 1;
    }
    Err(Error::Incomplete)
}

/// Streaming parser over one connection's read half.
///
/// Decoded messages are queued internally and returned one per call; a new
/// socket read is only issued once the queue is drained. A zero-length read
/// means end-of-stream and is reported as `Ok(None)`.
pub struct RespParser<R> {
    reader: R,
    buf: BytesMut,
    queue: VecDeque<(Message, usize)>,
    /// Junk bytes skipped since the last decoded frame, charged to the
    /// next frame's consumed count
    skipped: usize,
}

impl<R: AsyncRead + Unpin> RespParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
            queue: VecDeque::new(),
            skipped: 0,
        }
    }

    /// Read the next message, pulling more bytes from the connection as
    /// needed when only a partial frame is buffered.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        Ok(self.read_frame().await?.map(|(msg, _)| msg))
    }

    /// Like [`read_message`](Self::read_message), but also reports the
    /// exact count of wire bytes the frame consumed, skipped junk
    /// included. Replication offsets advance by this count, not by the
    /// message's canonical re-encoding.
    pub async fn read_frame(&mut self) -> Result<Option<(Message, usize)>> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(Some(frame));
            }
            self.drain_buffer()?;
            if let Some(frame) = self.queue.pop_front() {
                return Ok(Some(frame));
            }
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Decode every complete message currently buffered, leaving any
    /// trailing partial frame in place for the next read.
    fn drain_buffer(&mut self) -> Result<()> {
        let mut pos = 0;
        while pos < self.buf.len() {
            let start = pos;
            match decode(&self.buf, pos) {
                Ok((Some(msg), next)) => {
                    self.queue.push_back((msg, self.skipped + (next - start)));
                    self.skipped = 0;
                    pos = next;
                }
                Ok((None, next)) => {
                    self.skipped += next - start;
                    pos = next;
                }
                Err(e) if e.is_incomplete() => break,
                Err(e) => return Err(e),
            }
        }
        self.buf.advance(pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn roundtrip(msg: Message) {
        let bytes = msg.to_bytes();
        let (decoded, consumed) = decode(&bytes, 0).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_roundtrip_all_variants() {
        roundtrip(Message::SimpleString("PONG".into()));
        roundtrip(Message::Error("ERR oops".into()));
        roundtrip(Message::Integer(-42));
        roundtrip(Message::BulkString("hello world".into()));
        roundtrip(Message::BulkString(String::new()));
        roundtrip(Message::NullBulkString);
        roundtrip(Message::command(&["SET", "foo", "bar", "PX", "100"]));
        roundtrip(Message::Array(vec![
            Message::Integer(1),
            Message::Array(vec![Message::SimpleString("nested".into())]),
            Message::NullBulkString,
        ]));
        roundtrip(Message::RawPayload(b"REDIS0011\x00binary\xff\xfe".to_vec()));
    }

    #[test]
    fn test_decode_at_offset() {
        let mut bytes = b"garbage".to_vec();
        let start = bytes.len();
        bytes.extend_from_slice(b"+OK\r\n");
        let (msg, next) = decode(&bytes, start).unwrap();
        assert_eq!(msg, Some(Message::SimpleString("OK".into())));
        assert_eq!(next, bytes.len());
    }

    #[test]
    fn test_incomplete_is_retryable() {
        for partial in [
            &b"+OK\r"[..],
            &b"$5\r\nhel"[..],
            &b"$5\r\nhello"[..],
            &b"*2\r\n$4\r\nECHO\r\n"[..],
            &b":12"[..],
        ] {
            let err = decode(partial, 0).unwrap_err();
            assert!(err.is_incomplete(), "expected incomplete for {:?}", partial);
        }
    }

    #[test]
    fn test_malformed_is_fatal() {
        assert!(matches!(
            decode(b"$abc\r\n", 0),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            decode(b"$5\r\nhelloXY", 0),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(decode(b"*x\r\n", 0), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unknown_top_level_byte_skips() {
        let (msg, next) = decode(b"?+OK\r\n", 0).unwrap();
        assert_eq!(msg, None);
        assert_eq!(next, 1);
    }

    #[test]
    fn test_array_skips_junk_elements() {
        let (msg, next) = decode(b"*2\r\n?$3\r\nfoo\r\n", 0).unwrap();
        assert_eq!(
            msg,
            Some(Message::Array(vec![Message::BulkString("foo".into())]))
        );
        assert_eq!(next, 14);
    }

    #[test]
    fn test_snapshot_payload_without_trailing_crlf() {
        let payload = b"REDIS0011\xfa\x05hello\xff\x01\x02\x03\x04\x05\x06\x07\x08".to_vec();
        let mut bytes = format!("${}\r\n", payload.len()).into_bytes();
        bytes.extend_from_slice(&payload);
        // A propagated command follows immediately, with no CRLF between
        bytes.extend_from_slice(&Message::command(&["PING"]).to_bytes());

        let (msg, next) = decode(&bytes, 0).unwrap();
        assert_eq!(msg, Some(Message::RawPayload(payload.clone())));
        let (msg, _) = decode(&bytes, next).unwrap();
        assert_eq!(msg, Some(Message::command(&["PING"])));
    }

    #[tokio::test]
    async fn test_parser_reassembles_chunks() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut parser = RespParser::new(server);

        let handle = tokio::spawn(async move {
            client.write_all(b"*2\r\n$4\r\nEC").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            client.write_all(b"HO\r\n$3\r\nhey\r\n+OK\r\n").await.unwrap();
            client.shutdown().await.unwrap();
        });

        assert_eq!(
            parser.read_message().await.unwrap(),
            Some(Message::command(&["ECHO", "hey"]))
        );
        assert_eq!(
            parser.read_message().await.unwrap(),
            Some(Message::SimpleString("OK".into()))
        );
        assert_eq!(parser.read_message().await.unwrap(), None);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_counts_cover_wire_bytes() {
        let ping = Message::command(&["PING"]);
        let echo = Message::command(&["ECHO", "hi"]);

        // Junk ahead of a frame is charged to that frame's count
        let mut bytes = b"??".to_vec();
        bytes.extend_from_slice(&ping.to_bytes());
        bytes.extend_from_slice(&echo.to_bytes());

        let mut parser = RespParser::new(&bytes[..]);
        assert_eq!(
            parser.read_frame().await.unwrap(),
            Some((ping.clone(), 2 + ping.encoded_len()))
        );
        assert_eq!(
            parser.read_frame().await.unwrap(),
            Some((echo.clone(), echo.encoded_len()))
        );
        assert_eq!(parser.read_frame().await.unwrap(), None);

        // An array with skipped inner bytes re-encodes shorter than the
        // bytes actually consumed
        let wire = b"*2\r\n?$3\r\nfoo\r\n";
        let mut parser = RespParser::new(&wire[..]);
        let (msg, consumed) = parser.read_frame().await.unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert!(msg.encoded_len() < consumed);
    }

    #[tokio::test]
    async fn test_parser_eof_reports_no_messages() {
        let mut parser = RespParser::new(&b""[..]);
        assert_eq!(parser.read_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_parser_from_slice() {
        let mut bytes = Message::command(&["PING"]).to_bytes();
        bytes.extend_from_slice(&Message::command(&["ECHO", "hi"]).to_bytes());
        let mut parser = RespParser::new(&bytes[..]);
        assert_eq!(
            parser.read_message().await.unwrap(),
            Some(Message::command(&["PING"]))
        );
        assert_eq!(
            parser.read_message().await.unwrap(),
            Some(Message::command(&["ECHO", "hi"]))
        );
        assert_eq!(parser.read_message().await.unwrap(), None);
    }
}

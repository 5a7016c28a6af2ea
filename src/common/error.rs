//! Error types for miniredis

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Framing Errors ===
    /// Not enough bytes buffered to decode a full frame. Retryable: the
    /// caller should read more data and try again.
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("protocol error: {0}")]
    Protocol(String),

    // === Snapshot Errors ===
    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("snapshot error: unsupported value type {0}")]
    UnsupportedValueType(u8),

    // === Domain Errors ===
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    StreamIdTooSmall,

    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    StreamIdZero,

    #[error("ERR Invalid stream ID specified as stream command argument")]
    InvalidStreamId,

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR {0}")]
    InvalidCommand(String),

    // === Replication Errors ===
    #[error("replication error: {0}")]
    Replication(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this an incomplete-frame condition (await more bytes) rather
    /// than a fatal framing error?
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete)
    }

    /// Convert to a RESP error reply, for domain errors surfaced to clients.
    pub fn to_message(&self) -> crate::resp::Message {
        crate::resp::Message::Error(self.to_string())
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

//! RDB-style snapshot decoder
//!
//! Parses a complete in-memory snapshot buffer into the key/value pairs it
//! carries. Only the database sections matter for correctness: auxiliary
//! opcodes are skipped bytewise, and the checksum trailer after the EOF
//! opcode is ignored.
//!
//! All cursors are passed by value and returned, so every helper can be
//! exercised at arbitrary offsets.

use crate::common::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::collections::HashMap;

/// Starts a database section; followed by the database index byte
pub const OPCODE_SELECT_DB: u8 = 0xFE;
/// Ends the snapshot; an 8-byte checksum trailer follows
pub const OPCODE_EOF: u8 = 0xFF;
/// Hash-table size hints; must follow the database index
pub const OPCODE_RESIZE_HINT: u8 = 0xFB;
/// Entry expiry in seconds, 4-byte little-endian
pub const OPCODE_EXPIRY_SECS: u8 = 0xFD;
/// Entry expiry in milliseconds, 8-byte little-endian
pub const OPCODE_EXPIRY_MILLIS: u8 = 0xFC;

/// Plain string, the only value type this decoder supports
const VALUE_TYPE_STRING: u8 = 0;
/// Highest tag the format defines; anything above is an opcode, not a value
const VALUE_TYPE_MAX: u8 = 14;

/// A well-formed snapshot containing no keys, served to replicas during a
/// full resync.
const EMPTY_SNAPSHOT_B64: &str = "UkVESVMwMDEx+glyZWRpcy12ZXIFNy4yLjD6CnJlZGlzLWJpdHPAQPoFY3RpbWXCbQi8ZfoIdXNlZC1tZW3CsMQQAPoIYW9mLWJhc2XAAP/wbjv+wP9aog==";

/// Bytes of the canonical empty snapshot
pub fn empty_snapshot() -> Vec<u8> {
    BASE64
        .decode(EMPTY_SNAPSHOT_B64)
        .expect("embedded snapshot is valid base64")
}

/// Decoded snapshot contents
#[derive(Debug, Default)]
pub struct Snapshot {
    pub databases: Vec<SnapshotDb>,
}

/// One database section of a snapshot
#[derive(Debug)]
pub struct SnapshotDb {
    pub index: u8,
    pub hash_table_size: u32,
    pub expiry_table_size: u32,
    pub values: HashMap<String, SnapshotValue>,
}

/// A string value plus its optional absolute expiry (Unix milliseconds)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotValue {
    pub value: String,
    pub expires_at: Option<u64>,
}

/// Parse a complete snapshot buffer.
pub fn decode(bytes: &[u8]) -> Result<Snapshot> {
    let mut snapshot = Snapshot::default();
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            OPCODE_SELECT_DB => {
                let (db, next) = decode_database(bytes, pos + 1)?;
                snapshot.databases.push(db);
                pos = next;
            }
            OPCODE_EOF => break,
            _ => pos += 1,
        }
    }
    Ok(snapshot)
}

fn decode_database(bytes: &[u8], pos: usize) -> Result<(SnapshotDb, usize)> {
    let index = byte_at(bytes, pos)?;
    if byte_at(bytes, pos + 1)? != OPCODE_RESIZE_HINT {
        return Err(Error::Snapshot(format!(
            "expected resize hint 0x{:02X} after database selector",
            OPCODE_RESIZE_HINT
        )));
    }
    // The size hints are only parsed to advance the cursor correctly
    let (hash_table_size, pos) = decode_length(bytes, pos + 2)?;
    let (expiry_table_size, mut pos) = decode_length(bytes, pos)?;

    let mut db = SnapshotDb {
        index,
        hash_table_size,
        expiry_table_size,
        values: HashMap::new(),
    };

    loop {
        let Some(&op) = bytes.get(pos) else { break };

        let mut cursor = pos;
        let expires_at = match op {
            OPCODE_EXPIRY_SECS => {
                let secs = u32::from_le_bytes(take::<4>(bytes, cursor + 1)?);
                cursor += 5;
                Some(secs as u64 * 1000)
            }
            OPCODE_EXPIRY_MILLIS => {
                let millis = u64::from_le_bytes(take::<8>(bytes, cursor + 1)?);
                cursor += 9;
                Some(millis)
            }
            _ => None,
        };

        let tag = match bytes.get(cursor) {
            Some(&tag) => tag,
            None if expires_at.is_some() => {
                return Err(Error::Snapshot("expiry without a following entry".into()))
            }
            None => break,
        };
        if tag > VALUE_TYPE_MAX {
            if expires_at.is_some() {
                return Err(Error::Snapshot("expiry without a following entry".into()));
            }
            // Not a value type: the next opcode belongs to the outer scan
            break;
        }
        if tag != VALUE_TYPE_STRING {
            return Err(Error::UnsupportedValueType(tag));
        }

        let (key, next) = decode_string(bytes, cursor + 1)?;
        let (value, next) = decode_string(bytes, next)?;
        db.values.insert(key, SnapshotValue { value, expires_at });
        pos = next;
    }

    Ok((db, pos))
}

/// Decode a length-encoded integer, dispatching on the top two bits.
pub fn decode_length(bytes: &[u8], pos: usize) -> Result<(u32, usize)> {
    let first = byte_at(bytes, pos)?;
    match first >> 6 {
        0b00 => Ok(((first & 0x3F) as u32, pos + 1)),
        0b01 => {
            let second = byte_at(bytes, pos + 1)?;
            Ok(((((first & 0x3F) as u32) << 8) | second as u32, pos + 2))
        }
        0b10 => {
            let value = u32::from_be_bytes(take::<4>(bytes, pos + 1)?);
            Ok((value, pos + 5))
        }
        _ => Err(Error::Snapshot(
            "length encoding starts with 0b11, a special format that is not supported".into(),
        )),
    }
}

/// Decode a length-prefixed string.
pub fn decode_string(bytes: &[u8], pos: usize) -> Result<(String, usize)> {
    let (len, pos) = decode_length(bytes, pos)?;
    let len = len as usize;
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::Snapshot("string extends past end of snapshot".into()))?;
    let text = std::str::from_utf8(&bytes[pos..end])
        .map_err(|_| Error::Snapshot("invalid UTF-8 in string".into()))?;
    Ok((text.to_string(), end))
}

fn byte_at(bytes: &[u8], pos: usize) -> Result<u8> {
    bytes
        .get(pos)
        .copied()
        .ok_or_else(|| Error::Snapshot("unexpected end of snapshot".into()))
}

fn take<const N: usize>(bytes: &[u8], pos: usize) -> Result<[u8; N]> {
    let end = pos
        .checked_add(N)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::Snapshot("unexpected end of snapshot".into()))?;
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[pos..end]);
    Ok(out)
}

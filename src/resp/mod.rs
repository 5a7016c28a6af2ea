//! RESP wire codec: typed messages, canonical encoding, chunked decoding

pub mod message;
pub mod parser;

pub use message::{Message, SNAPSHOT_MAGIC};
pub use parser::{decode, RespParser};

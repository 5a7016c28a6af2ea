//! miniredis: a single-process, in-memory Redis-compatible server
//!
//! The crate is organized around a few small layers:
//!
//! - [`resp`]: wire codec for the RESP protocol, including the inline
//!   snapshot payload used during a full resync
//! - [`rdb`]: decoder for the snapshot file format
//! - [`store`]: the keyspace itself, string entries with lazy expiry and
//!   append-only streams
//! - [`replication`]: master-side replica links, offset tracking, WAIT,
//!   and the replica-side handshake
//! - [`server`]: the TCP accept loop and the command dispatcher
//!
//! Run it with the `miniredis` binary; pass `--replicaof "<host> <port>"`
//! to start as a replica.

pub mod common;
pub mod rdb;
pub mod replication;
pub mod resp;
pub mod server;
pub mod store;

pub use common::{Config, Error, Result};
pub use server::Server;

/// Crate version, reported in logs at startup
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

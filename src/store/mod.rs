//! In-memory entry store: strings with expiry and append-only streams

pub mod entry;
pub mod keyspace;

pub use entry::{Entry, StreamId, StreamItem};
pub use keyspace::KeySpace;

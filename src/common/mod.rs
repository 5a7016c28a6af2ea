//! Common utilities and types shared across miniredis

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, MasterAddr, ServerRole};
pub use error::{Error, Result};
pub use utils::{generate_replication_id, timestamp_now_millis};

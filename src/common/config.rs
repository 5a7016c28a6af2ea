//! Configuration for the miniredis server

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Master to replicate from. None means this node is a master.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicaof: Option<MasterAddr>,

    /// Directory containing the snapshot file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Snapshot file name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dbfilename: Option<String>,
}

fn default_port() -> u16 {
    6379
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            replicaof: None,
            dir: None,
            dbfilename: None,
        }
    }
}

impl Config {
    /// Role derived from the presence of a master address
    pub fn role(&self) -> ServerRole {
        if self.replicaof.is_some() {
            ServerRole::Replica
        } else {
            ServerRole::Master
        }
    }

    /// Path of the snapshot file, when both dir and dbfilename are set
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        match (&self.dir, &self.dbfilename) {
            (Some(dir), Some(file)) => Some(PathBuf::from(dir).join(file)),
            _ => None,
        }
    }
}

/// Address of the master this node replicates from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterAddr {
    pub host: String,
    pub port: u16,
}

impl MasterAddr {
    /// Parse the `--replicaof "<host> <port>"` argument form
    pub fn parse(s: &str) -> crate::Result<Self> {
        let mut parts = s.split_whitespace();
        let host = parts
            .next()
            .ok_or_else(|| crate::Error::InvalidConfig(format!("invalid replicaof: {}", s)))?;
        let port = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| crate::Error::InvalidConfig(format!("invalid replicaof: {}", s)))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for MasterAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Role of a running server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Master,
    Replica,
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerRole::Master => write!(f, "master"),
            // The INFO section reports the historical name
            ServerRole::Replica => write!(f, "slave"),
        }
    }
}

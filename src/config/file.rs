//! TOML configuration file support
//!
//! ## Priority Order
//!
//! 1. Command-line arguments
//! 2. Configuration file
//! 3. Built-in defaults
//!
//! ## Example Configuration
//!
//! ```toml
//! # vonnegut.toml
//!
//! [server]
//! listen_addr = "0.0.0.0:5555"
//! log_dirs = ["/var/lib/vonnegut"]
//! log_level = "info"
//!
//! [storage]
//! segment_bytes = 536870912       # 512 MB
//! index_interval_bytes = 4096
//!
//! [chain]
//! name = "chain-1"
//! # Static discovery: ordered head-to-tail node list; this node's
//! # position selects its role (first = head, last = tail, one = solo)
//! nodes = ["10.0.0.1:5555", "10.0.0.2:5555", "10.0.0.3:5555"]
//! position = 0
//! replicate_timeout_ms = 5000
//!
//! # Additional chains for metadata routing (optional; this node's own
//! # chain is always included)
//! [[chain_map]]
//! name = "chain-2"
//! head = "10.0.1.1:5555"
//! tail = "10.0.1.3:5555"
//! topics_start = "m"
//!
//! [client]
//! endpoints = ["10.0.0.1:5555"]
//! ```

use crate::error::{Result, VgError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root structure of the TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub chain: ChainSection,
    pub chain_map: Vec<ChainMapSection>,
    pub client: ClientSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen_addr: Option<String>,
    pub log_dirs: Option<Vec<std::path::PathBuf>>,
    pub log_level: Option<String>,
    pub max_connections: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub segment_bytes: Option<u64>,
    pub index_interval_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSection {
    pub name: Option<String>,
    /// Ordered head-to-tail endpoints (static discovery)
    pub nodes: Option<Vec<String>>,
    /// This node's index within `nodes`
    pub position: Option<usize>,
    pub replicate_timeout_ms: Option<u64>,
    /// Topic range owned by this chain (lexicographic half-open interval)
    pub topics_start: Option<String>,
    pub topics_end: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainMapSection {
    pub name: String,
    pub head: String,
    pub tail: String,
    pub topics_start: Option<String>,
    pub topics_end: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Head/tail addresses for the bundled client
    pub endpoints: Option<Vec<String>>,
}

impl ConfigFile {
    /// Load and parse a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VgError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| VgError::Config(format!("cannot parse {}: {e}", path.display())))
    }
}

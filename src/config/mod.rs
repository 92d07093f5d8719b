//! Configuration for the vonnegut server
//!
//! Configuration merges three sources, highest priority first: CLI
//! arguments, the TOML configuration file, built-in defaults. The chain
//! section doubles as role assignment: this node's position in the ordered
//! node list decides whether it is head, middle, tail, or solo, and who its
//! next hop is.

mod args;
mod defaults;
pub mod file;

pub use args::ServerArgs;
pub use defaults::*;
pub use file::ConfigFile;

use crate::chain::map::{ChainEntry, HostPort};
use crate::chain::role::Role;
use crate::error::{Result, VgError};
use crate::storage::log::LogConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// This node's chain membership
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: String,
    /// Ordered head-to-tail endpoints; a single entry means solo
    pub nodes: Vec<String>,
    /// This node's index within `nodes`
    pub position: usize,
    pub replicate_timeout: Duration,
    pub topics_start: Option<String>,
    pub topics_end: Option<String>,
}

impl ChainConfig {
    pub fn role(&self) -> Role {
        Role::from_position(self.position, self.nodes.len())
    }

    /// The successor this node replicates to, if any
    pub fn next_hop(&self) -> Option<&str> {
        if self.role().has_downstream() {
            self.nodes.get(self.position + 1).map(|s| s.as_str())
        } else {
            None
        }
    }

    /// This chain's entry in the chain map
    pub fn entry(&self) -> Result<ChainEntry> {
        let head = parse_host_port(self.nodes.first().map(|s| s.as_str()).unwrap_or(""))?;
        let tail = parse_host_port(self.nodes.last().map(|s| s.as_str()).unwrap_or(""))?;
        Ok(ChainEntry {
            name: self.name.clone(),
            head,
            tail,
            topics_start: self.topics_start.clone(),
            topics_end: self.topics_end.clone(),
        })
    }
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Log roots; one partition lives entirely in one root
    pub log_dirs: Vec<PathBuf>,
    pub log_level: String,
    /// Acceptor pool size; exhaustion refuses new connections
    pub max_connections: usize,
    pub segment_bytes: u64,
    pub index_interval_bytes: u64,
    pub chain: ChainConfig,
    /// Foreign chains carried in metadata responses
    pub chain_map: Vec<ChainEntry>,
    /// Head/tail addresses for the bundled client
    pub client_endpoints: Vec<String>,
}

impl ServerConfig {
    /// Merge CLI arguments over an optional configuration file
    pub fn from_args(args: ServerArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        let listen_addr = args
            .listen_addr
            .or(file.server.listen_addr)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr: SocketAddr = listen_addr
            .parse()
            .map_err(|e| VgError::Config(format!("bad listen_addr {listen_addr}: {e}")))?;

        let log_dirs = if !args.log_dirs.is_empty() {
            args.log_dirs
        } else {
            file.server
                .log_dirs
                .unwrap_or_else(|| vec![PathBuf::from(DEFAULT_LOG_DIR)])
        };
        if log_dirs.is_empty() {
            return Err(VgError::Config("log_dirs must not be empty".to_string()));
        }

        let nodes = file
            .chain
            .nodes
            .unwrap_or_else(|| vec![listen_addr.to_string()]);
        let position = args.chain_position.or(file.chain.position).unwrap_or(0);
        if position >= nodes.len() {
            return Err(VgError::Config(format!(
                "chain position {position} outside node list of {}",
                nodes.len()
            )));
        }

        let chain = ChainConfig {
            name: file
                .chain
                .name
                .unwrap_or_else(|| DEFAULT_CHAIN_NAME.to_string()),
            nodes,
            position,
            replicate_timeout: Duration::from_millis(
                file.chain
                    .replicate_timeout_ms
                    .unwrap_or(DEFAULT_REPLICATE_TIMEOUT_MS),
            ),
            topics_start: file.chain.topics_start,
            topics_end: file.chain.topics_end,
        };

        let chain_map = file
            .chain_map
            .into_iter()
            .map(|section| {
                Ok(ChainEntry {
                    name: section.name,
                    head: parse_host_port(&section.head)?,
                    tail: parse_host_port(&section.tail)?,
                    topics_start: section.topics_start,
                    topics_end: section.topics_end,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            listen_addr,
            log_dirs,
            log_level: args
                .log_level
                .or(file.server.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            max_connections: file
                .server
                .max_connections
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            segment_bytes: args
                .segment_bytes
                .or(file.storage.segment_bytes)
                .unwrap_or(DEFAULT_SEGMENT_BYTES),
            index_interval_bytes: args
                .index_interval_bytes
                .or(file.storage.index_interval_bytes)
                .unwrap_or(DEFAULT_INDEX_INTERVAL_BYTES),
            chain,
            chain_map,
            client_endpoints: file.client.endpoints.unwrap_or_default(),
        })
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            segment_bytes: self.segment_bytes,
            index_interval_bytes: self.index_interval_bytes,
        }
    }

    /// The full chain map: this node's chain first, then the configured
    /// foreign chains
    pub fn chain_entries(&self) -> Result<Vec<ChainEntry>> {
        let mut entries = vec![self.chain.entry()?];
        entries.extend(self.chain_map.iter().cloned());
        Ok(entries)
    }
}

fn parse_host_port(s: &str) -> Result<HostPort> {
    HostPort::parse(s).ok_or_else(|| VgError::Config(format!("bad endpoint {s:?}")))
}

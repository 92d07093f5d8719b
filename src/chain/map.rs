//! Chain map: which chain serves which topics
//!
//! Each chain entry names its head and tail endpoints and the lexicographic
//! half-open interval of topic names it owns: topic `T` belongs to chain
//! `C` iff `topics_start <= T < topics_end`, with either endpoint open. The
//! map is process-wide and read-mostly; readers take a snapshot and the
//! supervisor swaps in replacements wholesale.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A chain endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        Some(Self {
            host: host.to_string(),
            port: port.parse().ok()?,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One chain and the topic range it owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    pub name: String,
    pub head: HostPort,
    pub tail: HostPort,
    /// Inclusive lower bound on topic names; `None` means open
    pub topics_start: Option<String>,
    /// Exclusive upper bound on topic names; `None` means open
    pub topics_end: Option<String>,
}

impl ChainEntry {
    /// Whether this chain's topic range covers `topic`
    pub fn covers(&self, topic: &str) -> bool {
        if let Some(start) = &self.topics_start {
            if topic < start.as_str() {
                return false;
            }
        }
        if let Some(end) = &self.topics_end {
            if topic >= end.as_str() {
                return false;
            }
        }
        true
    }
}

/// Snapshot table of all known chains
#[derive(Debug, Default)]
pub struct ChainMap {
    chains: RwLock<Arc<Vec<ChainEntry>>>,
}

impl ChainMap {
    pub fn new(chains: Vec<ChainEntry>) -> Self {
        Self {
            chains: RwLock::new(Arc::new(chains)),
        }
    }

    /// Cheap read snapshot
    pub fn snapshot(&self) -> Arc<Vec<ChainEntry>> {
        self.chains.read().clone()
    }

    /// Replace the whole map (exclusive writer)
    pub fn replace(&self, chains: Vec<ChainEntry>) {
        *self.chains.write() = Arc::new(chains);
    }

    /// The chain covering `topic`, if any
    pub fn find(&self, topic: &str) -> Option<ChainEntry> {
        self.snapshot().iter().find(|c| c.covers(topic)).cloned()
    }
}

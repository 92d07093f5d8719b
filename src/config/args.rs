//! Command-line arguments for the vonnegut server
//!
//! Arguments override values from the configuration file; both fall back
//! to the defaults in [`super::defaults`].

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments for the vonnegut server
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "vonnegut")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Chain-replicated append-only log service with Kafka-compatible framing")]
pub struct ServerArgs {
    /// Path to configuration file (TOML format)
    #[arg(short, long, env = "VONNEGUT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "VONNEGUT_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Log root directories (repeatable); one partition lives entirely in
    /// one root
    #[arg(long = "log-dir", env = "VONNEGUT_LOG_DIR")]
    pub log_dirs: Vec<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "VONNEGUT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Segment rollover threshold in bytes
    #[arg(long, env = "VONNEGUT_SEGMENT_BYTES")]
    pub segment_bytes: Option<u64>,

    /// Sparse-index interval in bytes of log growth
    #[arg(long, env = "VONNEGUT_INDEX_INTERVAL_BYTES")]
    pub index_interval_bytes: Option<u64>,

    /// This node's index within its chain's node list
    #[arg(long, env = "VONNEGUT_CHAIN_POSITION")]
    pub chain_position: Option<usize>,
}

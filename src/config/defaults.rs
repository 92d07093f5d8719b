//! Default constants for vonnegut configuration

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5555";

/// Default log root when none is configured
pub const DEFAULT_LOG_DIR: &str = "./data";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default segment rollover threshold (512 MB)
pub const DEFAULT_SEGMENT_BYTES: u64 = 512 * 1024 * 1024;

/// Default sparse-index interval (4 KB of log growth per entry)
pub const DEFAULT_INDEX_INTERVAL_BYTES: u64 = 4096;

/// Default acceptor pool size; exhaustion refuses new connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Default replicate round-trip timeout in milliseconds
pub const DEFAULT_REPLICATE_TIMEOUT_MS: u64 = 5000;

/// Default chain name for a standalone node
pub const DEFAULT_CHAIN_NAME: &str = "solo";

/// Receive buffer size set on accepted sockets (64 KB)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

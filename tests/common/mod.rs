//! Shared fixtures for vonnegut integration tests
//!
//! Spawns real servers on ephemeral ports, solo or chained, and hands out
//! connected clients. Data directories are tempdirs that die with the
//! fixture unless a test keeps them for a restart.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use vonnegut::config::ChainConfig;
use vonnegut::{Server, ServerConfig, VgClient};

/// Find an available TCP port by binding port 0 and releasing it
pub fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind port 0");
    listener.local_addr().expect("local addr").port()
}

/// Reserve several distinct ports at once (chains need them up front)
pub fn find_available_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<_> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind port 0"))
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().expect("local addr").port())
        .collect()
}

/// One running server plus its state directory
pub struct TestNode {
    pub addr: SocketAddr,
    pub data_dir: TempDir,
    pub handle: JoinHandle<vonnegut::Result<()>>,
}

impl TestNode {
    pub async fn client(&self) -> VgClient {
        connect(self.addr).await
    }

    pub fn log_root(&self) -> PathBuf {
        self.data_dir.path().to_path_buf()
    }

    /// Kill the server task (listener closes with it)
    pub fn stop(&self) {
        self.handle.abort();
    }
}

/// Build a node config for a chain member
pub fn node_config(
    port: u16,
    nodes: Vec<String>,
    position: usize,
    log_root: PathBuf,
    segment_bytes: u64,
    index_interval_bytes: u64,
) -> ServerConfig {
    ServerConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        log_dirs: vec![log_root],
        log_level: "warn".to_string(),
        max_connections: 64,
        segment_bytes,
        index_interval_bytes,
        chain: ChainConfig {
            name: "test-chain".to_string(),
            nodes,
            position,
            replicate_timeout: Duration::from_secs(2),
            topics_start: None,
            topics_end: None,
        },
        chain_map: Vec::new(),
        client_endpoints: Vec::new(),
    }
}

/// Spawn a server for an already-built config, reusing `data_dir`
pub fn spawn_node(config: ServerConfig, data_dir: TempDir) -> TestNode {
    let server = Server::bind(config).expect("server bind");
    let addr = server.local_addr().expect("local addr");
    let handle = tokio::spawn(server.run());
    TestNode {
        addr,
        data_dir,
        handle,
    }
}

/// Spawn a standalone (solo-role) node
pub fn spawn_solo(segment_bytes: u64, index_interval_bytes: u64) -> TestNode {
    let port = find_available_port();
    let data_dir = TempDir::new().expect("tempdir");
    let config = node_config(
        port,
        vec![format!("127.0.0.1:{port}")],
        0,
        data_dir.path().to_path_buf(),
        segment_bytes,
        index_interval_bytes,
    );
    spawn_node(config, data_dir)
}

/// Spawn an n-node chain, head first
pub fn spawn_chain(n: usize) -> Vec<TestNode> {
    let ports = find_available_ports(n);
    let nodes: Vec<String> = ports.iter().map(|p| format!("127.0.0.1:{p}")).collect();
    ports
        .iter()
        .enumerate()
        .map(|(position, port)| {
            let data_dir = TempDir::new().expect("tempdir");
            let config = node_config(
                *port,
                nodes.clone(),
                position,
                data_dir.path().to_path_buf(),
                512 * 1024 * 1024,
                4096,
            );
            spawn_node(config, data_dir)
        })
        .collect()
}

/// Connect with retries while the server task comes up
pub async fn connect(addr: SocketAddr) -> VgClient {
    for _ in 0..50 {
        if let Ok(client) = VgClient::connect(addr).await {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server at {addr} did not come up");
}

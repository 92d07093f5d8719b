//! TCP server: accept loop and connection lifecycle
//!
//! The server binds one listener, tags every accepted connection with this
//! node's role, and spawns a handler task per connection. A fixed-size
//! acceptor pool bounds concurrent connections; when it is exhausted, new
//! connections are refused at accept rather than queued.

use crate::chain::client::ChainClient;
use crate::chain::map::ChainMap;
use crate::chain::supervisor::ChainSupervisor;
use crate::config::{ServerConfig, RECV_BUFFER_SIZE};
use crate::error::{Result, VgError};
use crate::protocol::connection::ConnectionHandler;
use crate::storage::topics::TopicRegistry;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

pub struct Server {
    config: ServerConfig,
    supervisor: Arc<ChainSupervisor>,
    listener: TcpListener,
}

impl Server {
    /// Recover storage, wire the chain supervisor, and bind the listener.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let chain_map = Arc::new(ChainMap::new(config.chain_entries()?));
        let registry = Arc::new(TopicRegistry::open(
            config.log_dirs.clone(),
            config.log_config(),
            chain_map,
        )?);

        let role = config.chain.role();
        let next_hop = config
            .chain
            .next_hop()
            .map(|addr| ChainClient::new(addr, config.chain.replicate_timeout));
        let supervisor = Arc::new(ChainSupervisor::new(registry, role, next_hop));

        let listener = bind_listener(config.listen_addr)?;
        info!(
            addr = %listener.local_addr()?,
            role = %role,
            chain = %config.chain.name,
            "vonnegut listening"
        );

        Ok(Self {
            config,
            supervisor,
            listener,
        })
    }

    /// The bound address (useful when listening on port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn supervisor(&self) -> &Arc<ChainSupervisor> {
        &self.supervisor
    }

    /// Accept until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let role = self.supervisor.role();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        warn!(peer = %peer, "Acceptor pool exhausted, refusing connection");
                        drop(stream);
                        continue;
                    };

                    if let Err(e) = tune_socket(&stream) {
                        warn!(peer = %peer, error = %e, "Socket tuning failed");
                    }

                    let handler = ConnectionHandler::new(self.supervisor.clone(), role);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handler.handle(stream).await {
                            match e {
                                VgError::Io(ref io) if is_disconnect(io) => {}
                                e => warn!(peer = %peer, error = %e, "Connection ended with error"),
                            }
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    return Ok(());
                }
            }
        }
    }
}

/// Bind with `reuseaddr` so restarts do not trip over TIME_WAIT sockets
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}

fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_recv_buffer_size(RECV_BUFFER_SIZE)?;
    Ok(())
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

//! The server core: dispatcher, workers, connections, sessions, and rooms.

mod client;
mod dispatcher;
mod room;
mod session;
mod worker;

use std::net::{SocketAddr, SocketAddrV4, TcpListener};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::server::room::RoomRegistry;
use crate::server::worker::WorkerHandle;

/// A large value the kernel clamps to the system maximum.
const LISTEN_BACKLOG: i32 = 4096;

/// A bound chat server, ready to accept connections.
///
/// `bind` brings up everything except the accept loop: the listening socket,
/// the room registry, and the worker pool. `run` then parks the calling
/// thread in the accept loop for the life of the process; the server has no
/// shutdown path of its own and relies on process termination to close its
/// sockets.
pub struct ChatServer {
    listener: TcpListener,
    workers: Vec<WorkerHandle>,
    config: ServerConfig,
}

impl ChatServer {
    pub fn bind(config: ServerConfig) -> Result<ChatServer, ServerError> {
        let listener = bind_listener(&config)?;
        let registry = Arc::new(RoomRegistry::new(config.max_rooms, config.room_capacity));

        let workers = (0..config.workers)
            .map(|index| worker::spawn(index, &config, registry.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            workers = config.workers,
            capacity = config.max_clients(),
            rooms = config.max_rooms,
            "server initialized"
        );
        Ok(ChatServer {
            listener,
            workers,
            config,
        })
    }

    /// The address the listening socket actually bound, which is the way to
    /// learn the port when the configuration asked for port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop on the calling thread. Never returns.
    pub fn run(self) {
        dispatcher::run(self.listener, self.workers, self.config);
    }
}

fn bind_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let addr = SocketAddrV4::new(config.host, config.port);

    let socket =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(ServerError::Bind)?;
    socket.set_reuse_address(true).map_err(ServerError::Bind)?;
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(ServerError::Bind)?;
    socket.listen(LISTEN_BACKLOG).map_err(ServerError::Bind)?;

    Ok(socket.into())
}

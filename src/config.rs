use std::env;
use std::net::Ipv4Addr;

/// Runtime configuration for a chat server instance.
///
/// The defaults are the production capacities. Integration tests construct
/// smaller configurations to exercise the capacity and rejection paths
/// without opening thousands of sockets.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listening socket binds to.
    pub host: Ipv4Addr,
    /// Port the listening socket binds to. Port 0 binds an ephemeral port.
    pub port: u16,
    /// Number of worker threads, each with its own reactor.
    pub workers: usize,
    /// Maximum clients a single worker will own at once.
    pub clients_per_worker: usize,
    /// Number of room slots in the registry.
    pub max_rooms: usize,
    /// Maximum members per room.
    pub room_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: Ipv4Addr::UNSPECIFIED,
            port: 30000,
            workers: 2,
            clients_per_worker: 1000,
            max_rooms: 50,
            room_capacity: 40,
        }
    }
}

impl ServerConfig {
    /// Builds a configuration from the environment, falling back to the
    /// defaults for anything unset or unparsable.
    ///
    /// Recognized variables: `APP_HOST` and `APP_PORT`.
    pub fn from_env() -> Self {
        let mut config = ServerConfig::default();
        if let Ok(host) = env::var("APP_HOST") {
            if let Ok(host) = host.parse() {
                config.host = host;
            }
        }
        if let Ok(port) = env::var("APP_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        config
    }

    /// Total connection capacity across all workers. Connections beyond this
    /// are rejected with a server-full error frame.
    pub fn max_clients(&self) -> usize {
        self.workers * self.clients_per_worker
    }
}

use dotenvy::dotenv;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use parley::config::ServerConfig;
use parley::server::ChatServer;

mod args;

fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .init();

    let args = args::Args::new();
    let mut config = ServerConfig::from_env();
    if let Some(listen_addr) = args.listen_addr {
        config.host = listen_addr;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let server = match ChatServer::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    match server.local_addr() {
        Ok(addr) => info!("Waiting for connections on {addr}"),
        Err(e) => info!("Waiting for connections (local address unavailable: {e})"),
    }

    server.run();
}

use std::error::Error;
use std::fmt;
use std::io;

/// Errors that can occur while bringing the server up.
///
/// Everything here is fatal: the binary logs the error and exits. Once the
/// server is running, per-connection failures are handled in place and never
/// surface as a `ServerError`.
#[derive(Debug)]
pub enum ServerError {
    /// The listening socket could not be created, bound, or put into the
    /// listening state.
    Bind(io::Error),
    /// A worker thread could not be spawned.
    WorkerSpawn(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "failed to set up the listening socket: {e}"),
            ServerError::WorkerSpawn(e) => write!(f, "failed to spawn a worker thread: {e}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerError::Bind(e) => Some(e),
            ServerError::WorkerSpawn(e) => Some(e),
        }
    }
}

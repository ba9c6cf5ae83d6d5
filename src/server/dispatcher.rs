use std::io::{ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::protocol::{self, Reply};
use crate::server::worker::WorkerHandle;

const SERVER_FULL_TEXT: &str =
    "Sorry, the server is currently at full capacity. Please try again later!";
const CONNECTING_ERROR_TEXT: &str =
    "Sorry, there was an error connecting to the server. Please try again!";

/// Keepalive makes a silently broken peer visible within a few seconds:
/// after five idle seconds the kernel probes twice, one second apart.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const KEEPALIVE_RETRIES: u32 = 2;

/// The accept loop. Runs forever on the calling thread.
///
/// Every accepted socket is made non-blocking, given its keepalive
/// configuration, and assigned to a worker round-robin. Assignment reserves
/// the slot first (under the worker's occupancy lock) and hands the socket
/// over second, so a worker may transiently see more reservations than
/// sockets but never the reverse. With every worker at capacity the client
/// gets a server-full frame and the socket is closed; the loop itself never
/// stops accepting.
pub(crate) fn run(listener: TcpListener, workers: Vec<WorkerHandle>, config: ServerConfig) {
    let mut cursor = 0;
    loop {
        let (socket, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        debug!(%peer, "accepted connection");

        if let Err(e) = socket.set_nonblocking(true) {
            error!(%peer, "could not make the connection non-blocking: {e}");
            continue;
        }
        if let Err(e) = configure_keepalive(&socket) {
            warn!(%peer, "could not configure keepalive: {e}");
        }

        match reserve_worker(&workers, &mut cursor, config.clients_per_worker) {
            Some(index) => {
                debug!(%peer, worker = index, "assigned connection to worker");
                if let Err(socket) = workers[index].hand_off(socket) {
                    error!(%peer, worker = index, "worker refused the handoff");
                    send_frame_best_effort(&socket, Reply::Connecting, CONNECTING_ERROR_TEXT);
                    workers[index].cancel_reservation();
                }
            }
            None => {
                info!(%peer, "server at full capacity, rejecting connection");
                send_frame_best_effort(&socket, Reply::ServerFull, SERVER_FULL_TEXT);
            }
        }
    }
}

/// Probes each worker at most once, starting at the round-robin cursor, and
/// reserves a slot on the first one below capacity.
fn reserve_worker(
    workers: &[WorkerHandle],
    cursor: &mut usize,
    capacity: usize,
) -> Option<usize> {
    for _ in 0..workers.len() {
        let index = *cursor;
        *cursor = (*cursor + 1) % workers.len();
        if workers[index].try_reserve(capacity) {
            return Some(index);
        }
    }
    None
}

fn configure_keepalive(socket: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}

/// Writes a single frame to a socket the server is about to close. Retries
/// partial writes and `WouldBlock` (the socket is non-blocking); any real
/// error is logged and the rest of the frame abandoned. The process ignores
/// `SIGPIPE`, so a closed peer surfaces here as an error, not a signal.
fn send_frame_best_effort(mut socket: &TcpStream, reply: Reply, content: &str) {
    let frame = protocol::frame(reply.byte(), content.as_bytes());
    let mut sent = 0;
    while sent < frame.len() {
        match socket.write(&frame[sent..]) {
            Ok(0) => break,
            Ok(n) => sent += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("could not deliver {reply:?} frame: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::worker::stub_worker;
    use std::io::Read;

    #[test]
    fn reservation_rotates_across_workers() {
        let (a, _rx_a) = stub_worker();
        let (b, _rx_b) = stub_worker();
        let workers = vec![a, b];
        let mut cursor = 0;

        assert_eq!(reserve_worker(&workers, &mut cursor, 2), Some(0));
        assert_eq!(reserve_worker(&workers, &mut cursor, 2), Some(1));
        assert_eq!(reserve_worker(&workers, &mut cursor, 2), Some(0));
        assert_eq!(reserve_worker(&workers, &mut cursor, 2), Some(1));
    }

    #[test]
    fn reservation_skips_full_workers_and_reports_exhaustion() {
        let (a, _rx_a) = stub_worker();
        let (b, _rx_b) = stub_worker();
        let workers = vec![a, b];
        let mut cursor = 0;

        assert_eq!(reserve_worker(&workers, &mut cursor, 1), Some(0));
        // Worker 0 is full; the probe moves on to worker 1.
        assert_eq!(reserve_worker(&workers, &mut cursor, 1), Some(1));
        assert_eq!(reserve_worker(&workers, &mut cursor, 1), None);

        workers[0].cancel_reservation();
        assert_eq!(reserve_worker(&workers, &mut cursor, 1), Some(0));
    }

    #[test]
    fn best_effort_send_delivers_a_whole_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();

        send_frame_best_effort(&server_side, Reply::ServerFull, SERVER_FULL_TEXT);
        drop(server_side);

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received[0], Reply::ServerFull.byte());
        assert!(received.ends_with(b"\r\n"));
    }
}

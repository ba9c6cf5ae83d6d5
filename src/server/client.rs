use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::protocol::{self, FrameBuffer, Reply, MAX_INBOUND_FRAME_LEN};
use crate::server::session::{Flow, Session};
use crate::server::worker::WorkerContext;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The shareable half of a connection.
///
/// Rooms hold these as member entries, so any client can queue frames for any
/// other client. The handle never touches the socket itself: frames pushed
/// here are drained to the socket by the owning connection task, which keeps
/// delivery per-recipient FIFO and makes `send` safe to call under a room
/// lock (the push never blocks).
#[derive(Debug)]
pub(crate) struct ClientHandle {
    id: u64,
    outbox: flume::Sender<Vec<u8>>,
}

impl ClientHandle {
    /// Creates a handle and the receive half its connection task drains.
    pub(crate) fn new() -> (Arc<ClientHandle>, flume::Receiver<Vec<u8>>) {
        let (outbox, drain) = flume::unbounded();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        (Arc::new(ClientHandle { id, outbox }), drain)
    }

    /// Identity of the connection, stable for its lifetime. Used to suppress
    /// broadcast echo to the sender.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Frames `content` under `reply` and queues it for delivery.
    pub(crate) fn send(&self, reply: Reply, content: &str) {
        self.send_frame(protocol::frame(reply.byte(), content.as_bytes()));
    }

    /// Queues an already-framed message for delivery. A failure means the
    /// peer's connection task is gone; the frame is dropped and the caller
    /// carries on, so one dead recipient never stalls a broadcast.
    pub(crate) fn send_frame(&self, frame: Vec<u8>) {
        if self.outbox.send(frame).is_err() {
            debug!(connection = self.id, "dropped frame for a closed connection");
        }
    }
}

/// Runs one connection to completion.
///
/// The loop services two event sources: bytes arriving from the peer and
/// frames queued on the outbox by this client or by room broadcasts. Reads go
/// through the frame buffer and each complete frame through the state
/// machine. The loop ends on peer close, any I/O error, a frame-buffer
/// overflow, or an exit command; teardown then leaves the current room (with
/// its departure broadcast) before the slot is released, and dropping the
/// stream deregisters it from this worker's reactor and closes the socket.
pub(crate) async fn drive(
    stream: TcpStream,
    worker: Rc<WorkerContext>,
    slot: usize,
    mut session: Session,
    drain: flume::Receiver<Vec<u8>>,
) {
    let connection = session.id();
    let (mut reader, mut writer) = stream.into_split();
    let mut rx_buffer = FrameBuffer::new();
    let mut chunk = [0u8; MAX_INBOUND_FRAME_LEN];

    loop {
        tokio::select! {
            received = reader.read(&mut chunk) => match received {
                Ok(0) => {
                    debug!(connection, "peer closed the connection");
                    break;
                }
                Ok(n) => match rx_buffer.push(&chunk[..n]) {
                    Ok(frames) => {
                        let mut disconnect = false;
                        for frame in frames {
                            if session.on_frame(&frame) == Flow::Disconnect {
                                disconnect = true;
                                break;
                            }
                        }
                        if disconnect {
                            break;
                        }
                    }
                    Err(_) => {
                        warn!(
                            connection,
                            "unterminated inbound data exceeded {MAX_INBOUND_FRAME_LEN} bytes, \
                             resetting the connection"
                        );
                        break;
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(connection, "read failed: {e}");
                    break;
                }
            },
            frame = drain.recv_async() => match frame {
                Ok(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        debug!(connection, "send failed: {e}");
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }

    session.disconnected();
    worker.release(slot);
    debug!(connection, "connection torn down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_get_distinct_ids() {
        let (a, _drain_a) = ClientHandle::new();
        let (b, _drain_b) = ClientHandle::new();

        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn send_frames_and_queues_in_order() {
        let (handle, drain) = ClientHandle::new();

        handle.send(Reply::RoomMsg, "first");
        handle.send(Reply::RoomMsg, "second");

        assert_eq!(drain.try_recv().unwrap(), b"\x1c first\r\n".to_vec());
        assert_eq!(drain.try_recv().unwrap(), b"\x1c second\r\n".to_vec());
        assert!(drain.try_recv().is_err());
    }

    #[test]
    fn send_to_a_closed_connection_is_dropped() {
        let (handle, drain) = ClientHandle::new();
        drop(drain);

        // Must not panic or block.
        handle.send(Reply::RoomMsg, "anyone there?");
    }
}

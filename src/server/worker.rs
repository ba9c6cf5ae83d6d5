use std::cell::RefCell;
use std::net;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::net::TcpStream;
use tokio::task::LocalSet;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::protocol::Reply;
use crate::server::client::{self, ClientHandle};
use crate::server::room::RoomRegistry;
use crate::server::session::Session;

const WELCOME: &str = "WELCOME TO THE SERVER: THIS IS A FAMILY FRIENDLY SPACE, NO CURSING\n\
                       Please enter Your User Name";

/// The dispatcher's view of one worker: the occupancy counter it reserves
/// slots in, and the channel it hands sockets over on.
///
/// The channel holds one socket. A second `send` blocks the dispatcher until
/// the worker has taken the first, so there is never more than one handoff in
/// flight per worker and the two sides cannot disagree about how many sockets
/// were delivered.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    occupancy: Arc<Mutex<usize>>,
    handoff: flume::Sender<net::TcpStream>,
}

impl WorkerHandle {
    /// Reserves a slot if the worker is below `capacity`. The increment
    /// happens before the socket is handed over; the worker rolls it back if
    /// the handoff cannot be completed on its side.
    pub(crate) fn try_reserve(&self, capacity: usize) -> bool {
        let mut occupancy = self.occupancy.lock().unwrap();
        if *occupancy < capacity {
            *occupancy += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn cancel_reservation(&self) {
        *self.occupancy.lock().unwrap() -= 1;
    }

    /// Hands a socket to the worker, blocking while a previous handoff is
    /// still unclaimed. Fails only if the worker is gone; the socket comes
    /// back to the caller for cleanup.
    pub(crate) fn hand_off(&self, socket: net::TcpStream) -> Result<(), net::TcpStream> {
        self.handoff.send(socket).map_err(|e| e.into_inner())
    }
}

/// State a worker shares with the connection tasks it owns: the occupancy
/// counter (shared with the dispatcher, under its lock) and the slot table
/// (touched by this thread only).
#[derive(Debug)]
pub(crate) struct WorkerContext {
    index: usize,
    occupancy: Arc<Mutex<usize>>,
    slots: RefCell<SlotTable>,
}

impl WorkerContext {
    /// Frees a connection's slot and gives its reservation back. Runs when a
    /// connection ends, after the client has left any room it was in.
    pub(crate) fn release(&self, slot: usize) {
        self.slots.borrow_mut().free(slot);
        let mut occupancy = self.occupancy.lock().unwrap();
        *occupancy -= 1;
        debug!(worker = self.index, occupancy = *occupancy, "released client slot");
    }

    fn rollback_reservation(&self) {
        *self.occupancy.lock().unwrap() -= 1;
    }
}

/// Per-worker table of connection slots. Only the owning worker thread ever
/// touches it; occupancy accounting for the dispatcher lives separately in
/// the shared counter.
#[derive(Debug)]
struct SlotTable {
    slots: Box<[Option<u64>]>,
}

impl SlotTable {
    fn new(capacity: usize) -> SlotTable {
        SlotTable {
            slots: vec![None; capacity].into_boxed_slice(),
        }
    }

    /// Claims the first free slot. `None` means the table is full despite
    /// the dispatcher's accounting saying otherwise, which can happen in the
    /// window between a reservation and the matching handoff arriving here.
    fn allocate(&mut self, connection: u64) -> Option<usize> {
        let free = self.slots.iter().position(Option::is_none)?;
        self.slots[free] = Some(connection);
        Some(free)
    }

    fn free(&mut self, slot: usize) {
        self.slots[slot] = None;
    }

    fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Spawns one worker: a named OS thread running its own single-threaded
/// runtime, so each worker has a private reactor and every connection stays
/// on the worker that accepted it for its whole life.
pub(crate) fn spawn(
    index: usize,
    config: &ServerConfig,
    registry: Arc<RoomRegistry>,
) -> Result<WorkerHandle, ServerError> {
    let (handoff_tx, handoff_rx) = flume::bounded(1);
    let occupancy = Arc::new(Mutex::new(0));
    let capacity = config.clients_per_worker;

    let shared = occupancy.clone();
    thread::Builder::new()
        .name(format!("worker-{index}"))
        .spawn(move || worker_main(index, capacity, shared, handoff_rx, registry))
        .map_err(ServerError::WorkerSpawn)?;

    Ok(WorkerHandle {
        occupancy,
        handoff: handoff_tx,
    })
}

fn worker_main(
    index: usize,
    capacity: usize,
    occupancy: Arc<Mutex<usize>>,
    handoff: flume::Receiver<net::TcpStream>,
    registry: Arc<RoomRegistry>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker = index, "could not build the worker runtime: {e}");
            std::process::exit(1);
        }
    };
    info!(worker = index, capacity, "worker ready");

    let context = Rc::new(WorkerContext {
        index,
        occupancy,
        slots: RefCell::new(SlotTable::new(capacity)),
    });

    let tasks = LocalSet::new();
    tasks.block_on(&runtime, async {
        // Taking a socket off the channel is also the acknowledgement that
        // unblocks the dispatcher's next handoff to this worker.
        while let Ok(socket) = handoff.recv_async().await {
            adopt_client(socket, &context, &registry);
        }
    });
    info!(worker = index, "dispatcher is gone, worker shutting down");
}

/// Brings a freshly handed-off socket under this worker's management:
/// registers it with the worker's reactor, claims a slot, greets the client,
/// and spawns its connection task. Either failure mode undoes the
/// dispatcher's reservation and drops the socket.
fn adopt_client(
    socket: net::TcpStream,
    context: &Rc<WorkerContext>,
    registry: &Arc<RoomRegistry>,
) {
    let stream = match TcpStream::from_std(socket) {
        Ok(stream) => stream,
        Err(e) => {
            error!(
                worker = context.index,
                "could not register the new connection with the reactor: {e}"
            );
            context.rollback_reservation();
            return;
        }
    };

    let (handle, drain) = ClientHandle::new();
    let Some(slot) = context.slots.borrow_mut().allocate(handle.id()) else {
        error!(
            worker = context.index,
            "received a connection while already at capacity, rejecting"
        );
        context.rollback_reservation();
        return;
    };

    debug!(
        worker = context.index,
        connection = handle.id(),
        slot,
        "adopted new connection"
    );
    handle.send(Reply::Welcome, WELCOME);

    let session = Session::new(handle, registry.clone());
    tokio::task::spawn_local(client::drive(
        stream,
        context.clone(),
        slot,
        session,
        drain,
    ));
}

/// A handle with no thread behind it, for exercising reservation logic.
#[cfg(test)]
pub(crate) fn stub_worker() -> (WorkerHandle, flume::Receiver<net::TcpStream>) {
    let (handoff, rx) = flume::bounded(1);
    let handle = WorkerHandle {
        occupancy: Arc::new(Mutex::new(0)),
        handoff,
    };
    (handle, rx)
}

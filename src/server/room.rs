use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::protocol::{self, Reply, MAX_ROOM_NAME_LEN};
use crate::server::client::ClientHandle;

/// One slot in the registry.
///
/// A slot cycles between vacant and in use; its index is the public room
/// identifier for as long as it stays in use, and is reused afterwards. All
/// fields are only ever touched while the slot's lock is held.
#[derive(Debug)]
struct Room {
    in_use: bool,
    name: String,
    members: Box<[Option<Arc<ClientHandle>>]>,
    count: usize,
}

impl Room {
    fn vacant(capacity: usize) -> Room {
        Room {
            in_use: false,
            name: String::new(),
            members: vec![None; capacity].into_boxed_slice(),
            count: 0,
        }
    }

    fn reset(&mut self) {
        self.in_use = false;
        self.name.clear();
        self.members.fill(None);
    }
}

/// The fixed array of rooms shared by every worker.
///
/// Each room carries its own mutex and no operation ever holds two of them,
/// so lock contention is bounded to the slots a scan touches and deadlock is
/// structurally impossible. Sending to a member under a room lock is fine:
/// the send is a non-blocking push onto the member's outbox.
#[derive(Debug)]
pub(crate) struct RoomRegistry {
    rooms: Box<[Mutex<Room>]>,
}

impl RoomRegistry {
    pub(crate) fn new(max_rooms: usize, room_capacity: usize) -> RoomRegistry {
        let rooms = (0..max_rooms)
            .map(|_| Mutex::new(Room::vacant(room_capacity)))
            .collect();
        RoomRegistry { rooms }
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, Room> {
        self.rooms[index].lock().unwrap()
    }

    /// Creates a room named `name` with `who` as its first member.
    ///
    /// Slots are scanned in index order, taking one lock at a time; the first
    /// vacant slot wins. Returns the room index the caller must record, or
    /// `None` if the name was invalid or every slot is taken (the requester
    /// has been told either way).
    pub(crate) fn create(&self, who: &Arc<ClientHandle>, name: &[u8]) -> Option<usize> {
        if name.is_empty() || name.len() > MAX_ROOM_NAME_LEN {
            debug!(connection = who.id(), "rejected room name of {} bytes", name.len());
            who.send(
                Reply::RoomNameInvalid,
                "Room creation failed: Room name length invalid\n",
            );
            return None;
        }
        let name = String::from_utf8_lossy(name).into_owned();

        for (index, slot) in self.rooms.iter().enumerate() {
            let mut room = slot.lock().unwrap();
            if !room.in_use {
                room.in_use = true;
                room.count = 1;
                room.members[0] = Some(who.clone());
                room.name = name;
                info!(room = index, name = %room.name, "room created");
                who.send(
                    Reply::RoomCreateOk,
                    &format!("Room created successfully: {}\n", room.name),
                );
                return Some(index);
            }
        }

        info!(connection = who.id(), "room creation failed, all slots in use");
        who.send(
            Reply::RoomCapacityFull,
            "Room creation failed: Maximum number of rooms reached\n",
        );
        None
    }

    /// Adds `who` to the room named by `content`, a 1 or 2 digit decimal
    /// index. Other members are notified before the requester gets its
    /// confirmation. Returns the joined index, or `None` with the requester
    /// already told why.
    pub(crate) fn join(
        &self,
        who: &Arc<ClientHandle>,
        username: &str,
        content: &[u8],
    ) -> Option<usize> {
        let Some(index) = parse_room_number(content) else {
            who.send(
                Reply::RoomNotFound,
                "Invalid room number format. Must be a number between 0-99\n",
            );
            return None;
        };
        if index >= self.rooms.len() {
            who.send(Reply::RoomNotFound, "Room does not exist\n");
            return None;
        }

        let mut room = self.lock(index);
        if !room.in_use {
            who.send(Reply::RoomNotFound, "Room does not exist\n");
            return None;
        }
        if room.count == room.members.len() {
            debug!(room = index, "join rejected, room is full");
            who.send(Reply::RoomCapacityFull, "Cannot join room: Room is full\n");
            return None;
        }

        let free = room
            .members
            .iter()
            .position(Option::is_none)
            .expect("a room below capacity has a free member slot");
        room.members[free] = Some(who.clone());
        room.count += 1;
        info!(room = index, name = %room.name, username, "client joined room");

        broadcast_to_room(&room, who.id(), &format!("{username} has entered the room\n"));
        who.send(Reply::RoomJoinOk, "Successfully joined room\n");
        Some(index)
    }

    /// Removes the client from the room and tells the remaining members. The
    /// last member out clears the slot for reuse. The caller is responsible
    /// for the requester's own state transition and confirmation.
    pub(crate) fn leave(&self, who_id: u64, username: &str, index: usize) {
        let mut room = self.lock(index);

        if let Some(occupied) = room
            .members
            .iter()
            .position(|m| m.as_ref().is_some_and(|h| h.id() == who_id))
        {
            room.members[occupied] = None;
            room.count -= 1;
        } else {
            warn!(room = index, connection = who_id, "leaving client was not a member");
            return;
        }
        info!(room = index, username, remaining = room.count, "client left room");

        broadcast_to_room(&room, who_id, &format!("{username} left the room\n"));

        if room.count == 0 {
            debug!(room = index, name = %room.name, "room is empty, clearing slot");
            room.reset();
        }
    }

    /// Sends the requester the current room listing, in index order.
    pub(crate) fn list(&self, who: &ClientHandle) {
        let mut listing =
            String::with_capacity(MAX_ROOM_NAME_LEN * self.rooms.len() + 256);
        listing.push_str("=== Available Chat Rooms ===\n\n");

        let mut any = false;
        for (index, slot) in self.rooms.iter().enumerate() {
            let room = slot.lock().unwrap();
            if room.in_use {
                let _ = writeln!(listing, "Room {index}: {}", room.name);
                any = true;
            }
        }
        if !any {
            listing.push_str(
                "No chat rooms available!\nUse the create room command to start \
                 your own chat room.\n",
            );
        }

        who.send(Reply::RoomListResponse, &listing);
    }

    /// Fans `message` out to every member of the room except the sender.
    /// Message order within the room is the order senders take the lock.
    pub(crate) fn broadcast(&self, index: usize, sender_id: u64, message: &str) {
        let room = self.lock(index);
        if !room.in_use {
            warn!(room = index, "broadcast to a room no longer in use");
            return;
        }
        broadcast_to_room(&room, sender_id, message);
    }
}

/// Delivery to each recipient is a non-blocking outbox push, so a slow or
/// dead peer cannot stall the room. Never echoes to the sender.
fn broadcast_to_room(room: &Room, sender_id: u64, message: &str) {
    let frame = protocol::frame(Reply::RoomMsg.byte(), message.as_bytes());
    for member in room.members.iter().flatten() {
        if member.id() != sender_id {
            member.send_frame(frame.clone());
        }
    }
}

/// Parses a 1 or 2 digit decimal room index. Anything else, including
/// trailing bytes after the digits, is a malformed request.
fn parse_room_number(content: &[u8]) -> Option<usize> {
    match *content {
        [d] if d.is_ascii_digit() => Some((d - b'0') as usize),
        [d1, d2] if d1.is_ascii_digit() && d2.is_ascii_digit() => {
            Some(((d1 - b'0') * 10 + (d2 - b'0')) as usize)
        }
        _ => None,
    }
}

use std::sync::Arc;

use tracing::{debug, info};

use crate::protocol::{self, Command, Reply, MAX_USERNAME_LEN};
use crate::server::client::ClientHandle;
use crate::server::room::RoomRegistry;

/// What the connection loop should do after a frame has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Disconnect,
}

/// Where a client is in its lifecycle. A room index only exists while the
/// client is actually in that room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    AwaitingUsername,
    InLobby,
    InRoom(usize),
}

/// The per-client protocol state machine.
///
/// Every complete inbound frame lands here. The frame is validated, checked
/// against the current state, and executed; anything wrong produces an error
/// frame back to the client and leaves the state untouched. One command,
/// `Exit`, is accepted in every state.
#[derive(Debug)]
pub(crate) struct Session {
    handle: Arc<ClientHandle>,
    registry: Arc<RoomRegistry>,
    state: ClientState,
    username: String,
}

impl Session {
    pub(crate) fn new(handle: Arc<ClientHandle>, registry: Arc<RoomRegistry>) -> Session {
        Session {
            handle,
            registry,
            state: ClientState::AwaitingUsername,
            username: String::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.handle.id()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ClientState {
        self.state
    }

    /// Handles one complete frame (terminator already stripped).
    pub(crate) fn on_frame(&mut self, frame: &[u8]) -> Flow {
        let (cmd, content) = match protocol::validate(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(connection = self.id(), "rejected frame: {e}");
                self.handle.send(e.reply(), &e.text());
                return Flow::Continue;
            }
        };

        if cmd == Command::Exit {
            info!(connection = self.id(), "client requested exit");
            return Flow::Disconnect;
        }
        if !self.command_allowed(cmd) {
            debug!(
                connection = self.id(),
                command = cmd.byte(),
                state = ?self.state,
                "command not valid for state"
            );
            self.handle
                .send(Reply::InvalidStateCmd, self.wrong_state_text());
            return Flow::Continue;
        }

        match self.state {
            ClientState::AwaitingUsername => self.on_username(content),
            ClientState::InLobby => self.on_lobby_command(cmd, content),
            ClientState::InRoom(room) => self.on_room_command(cmd, content, room),
        }
        Flow::Continue
    }

    /// Runs the room side of a disconnection. The connection loop calls this
    /// exactly once, before the client's slot is released, so a room never
    /// holds a member whose slot has already been reused.
    pub(crate) fn disconnected(&mut self) {
        if let ClientState::InRoom(room) = self.state {
            self.registry.leave(self.id(), &self.username, room);
            self.state = ClientState::InLobby;
        }
    }

    fn command_allowed(&self, cmd: Command) -> bool {
        match self.state {
            ClientState::AwaitingUsername => cmd == Command::UsernameSubmit,
            ClientState::InLobby => matches!(
                cmd,
                Command::RoomCreate | Command::RoomJoin | Command::RoomList
            ),
            ClientState::InRoom(_) => {
                matches!(cmd, Command::RoomMessage | Command::LeaveRoom)
            }
        }
    }

    fn wrong_state_text(&self) -> &'static str {
        match self.state {
            ClientState::AwaitingUsername => "Invalid command while awaiting username\n",
            ClientState::InLobby => "Invalid command for lobby state\n",
            ClientState::InRoom(_) => "Invalid command for chat room state\n",
        }
    }

    /// A valid name claim moves the client to the lobby and immediately shows
    /// it what rooms exist. Name claims are first come, first served; nothing
    /// is reserved and duplicates are the clients' problem.
    fn on_username(&mut self, content: &[u8]) {
        if content.len() > MAX_USERNAME_LEN {
            debug!(
                connection = self.id(),
                "rejected username of {} bytes",
                content.len()
            );
            self.handle.send(
                Reply::UsernameLength,
                "User name too long, must be less than 32\n",
            );
            return;
        }

        self.username = String::from_utf8_lossy(content).into_owned();
        info!(connection = self.id(), username = %self.username, "username set");
        self.state = ClientState::InLobby;
        self.registry.list(&self.handle);
    }

    fn on_lobby_command(&mut self, cmd: Command, content: &[u8]) {
        match cmd {
            Command::RoomCreate => {
                if let Some(room) = self.registry.create(&self.handle, content) {
                    self.state = ClientState::InRoom(room);
                }
            }
            Command::RoomJoin => {
                if let Some(room) = self.registry.join(&self.handle, &self.username, content) {
                    self.state = ClientState::InRoom(room);
                }
            }
            Command::RoomList => self.registry.list(&self.handle),
            _ => unreachable!("lobby admission only lets room commands through"),
        }
    }

    fn on_room_command(&mut self, cmd: Command, content: &[u8], room: usize) {
        match cmd {
            Command::RoomMessage => {
                let text = String::from_utf8_lossy(content);
                self.registry
                    .broadcast(room, self.id(), &format!("{}: {text}", self.username));
            }
            Command::LeaveRoom => {
                self.registry.leave(self.id(), &self.username, room);
                self.handle
                    .send(Reply::RoomLeaveOk, "You have left the room\n");
                self.state = ClientState::InLobby;
            }
            _ => unreachable!("room admission only lets message and leave through"),
        }
    }
}

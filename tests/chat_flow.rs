//! End-to-end scenarios over real TCP connections.
//!
//! Every test starts its own server on an ephemeral port with a small
//! configuration, then drives it with plain blocking sockets the way a
//! client binary would.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use parley::config::ServerConfig;
use parley::server::ChatServer;

const WELCOME: u8 = 0x16;
const ROOM_CREATE_OK: u8 = 0x18;
const ROOM_LIST_RESPONSE: u8 = 0x1A;
const ROOM_JOIN_OK: u8 = 0x1B;
const ROOM_MSG: u8 = 0x1C;
const ROOM_LEAVE_OK: u8 = 0x1D;
const ERR_ROOM_NAME_INVALID: u8 = 0x24;
const ERR_ROOM_CAPACITY_FULL: u8 = 0x25;
const ERR_ROOM_NOT_FOUND: u8 = 0x26;
const ERR_INVALID_STATE_CMD: u8 = 0x28;
const ERR_INVALID_FORMAT: u8 = 0x29;
const ERR_SERVER_FULL: u8 = 0x2B;
const ERR_USERNAME_LENGTH: u8 = 0x2D;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    ServerConfig {
        host: Ipv4Addr::LOCALHOST,
        port: 0,
        workers: 2,
        clients_per_worker: 8,
        max_rooms: 4,
        room_capacity: 3,
    }
}

fn start_server(config: ServerConfig) -> SocketAddr {
    let server = ChatServer::bind(config).expect("the server should bind an ephemeral port");
    let addr = server.local_addr().expect("a bound local address");
    thread::spawn(move || server.run());
    addr
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).expect("connect to the test server");
        stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        stream.set_nodelay(true).unwrap();
        Client { stream }
    }

    /// Connects and walks through the welcome and username exchange.
    fn connect_named(addr: SocketAddr, name: &str) -> Client {
        let mut client = Client::connect(addr);
        client.expect_reply(WELCOME);
        client.send(0x02, name);
        client.expect_reply(ROOM_LIST_RESPONSE);
        client
    }

    fn send(&mut self, cmd: u8, content: &str) {
        let mut frame = vec![cmd, b' '];
        frame.extend_from_slice(content.as_bytes());
        frame.extend_from_slice(b"\r\n");
        self.stream.write_all(&frame).expect("send a frame");
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send raw bytes");
    }

    /// Reads one CRLF-terminated frame, returning the command byte and the
    /// content between the separator space and the terminator.
    fn read_frame(&mut self) -> (u8, String) {
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.stream.read(&mut byte).expect("read a frame byte");
            assert!(n > 0, "connection closed in the middle of a frame");
            bytes.push(byte[0]);
            if bytes.ends_with(b"\r\n") {
                break;
            }
        }
        let content = String::from_utf8_lossy(&bytes[2..bytes.len() - 2]).into_owned();
        (bytes[0], content)
    }

    fn expect_reply(&mut self, expected: u8) -> String {
        let (cmd, content) = self.read_frame();
        assert_eq!(
            cmd, expected,
            "expected command {expected:#04x}, got {cmd:#04x} with content {content:?}"
        );
        content
    }

    /// Asserts that nothing arrives for a moment. Used to prove the absence
    /// of a broadcast echo.
    fn expect_silence(&mut self) {
        self.stream
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Ok(0) => panic!("connection closed while expecting silence"),
            Ok(_) => panic!("unexpected frame while expecting silence"),
            Err(e) => panic!("read failed while expecting silence: {e}"),
        }
        self.stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    }

    fn expect_closed(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    panic!("connection is still open")
                }
                Err(_) => return,
            }
        }
    }
}

#[test]
fn join_lifecycle_with_leave_and_rejoin() {
    let addr = start_server(test_config());
    let mut alice = Client::connect_named(addr, "alice");
    let mut bob = Client::connect_named(addr, "bob");

    // Alice opens a room and lands in it.
    alice.send(0x03, "general");
    let content = alice.expect_reply(ROOM_CREATE_OK);
    assert!(content.contains("Room created successfully: general"));

    // Bob sees it in the listing and joins.
    bob.send(0x04, "dummy");
    let listing = bob.expect_reply(ROOM_LIST_RESPONSE);
    assert!(listing.contains("Room 0: general"));

    bob.send(0x05, "0");
    assert_eq!(bob.expect_reply(ROOM_JOIN_OK), "Successfully joined room\n");
    assert_eq!(alice.expect_reply(ROOM_MSG), "bob has entered the room\n");

    // Messages reach the other member only.
    alice.send(0x07, "hi");
    assert_eq!(bob.expect_reply(ROOM_MSG), "alice: hi");
    alice.expect_silence();

    // Bob leaves, alice is told, and the room survives for a rejoin.
    bob.send(0x06, "dummy");
    assert_eq!(bob.expect_reply(ROOM_LEAVE_OK), "You have left the room\n");
    assert_eq!(alice.expect_reply(ROOM_MSG), "bob left the room\n");

    bob.send(0x05, "0");
    assert_eq!(bob.expect_reply(ROOM_JOIN_OK), "Successfully joined room\n");
    assert_eq!(alice.expect_reply(ROOM_MSG), "bob has entered the room\n");
}

#[test]
fn reserved_looking_username_is_accepted() {
    let addr = start_server(test_config());
    let mut client = Client::connect(addr);
    client.expect_reply(WELCOME);

    client.send(0x02, "/exit");
    client.expect_reply(ROOM_LIST_RESPONSE);

    // The session is genuinely in the lobby now.
    client.send(0x04, "dummy");
    client.expect_reply(ROOM_LIST_RESPONSE);
}

#[test]
fn malformed_frame_keeps_the_connection() {
    let addr = start_server(test_config());
    let mut client = Client::connect_named(addr, "carol");

    // No space between command byte and content.
    client.send_raw(b"\x07hello\r\n");
    let content = client.expect_reply(ERR_INVALID_FORMAT);
    assert!(content.contains("Missing space"));

    // Still connected, still in the lobby.
    client.send(0x04, "dummy");
    client.expect_reply(ROOM_LIST_RESPONSE);
}

#[test]
fn joining_a_nonexistent_room_keeps_the_lobby_state() {
    let addr = start_server(test_config());
    let mut client = Client::connect_named(addr, "dave");

    client.send(0x05, "99");
    assert_eq!(client.expect_reply(ERR_ROOM_NOT_FOUND), "Room does not exist\n");

    client.send(0x04, "dummy");
    client.expect_reply(ROOM_LIST_RESPONSE);
}

#[test]
fn server_full_rejects_the_extra_connection() {
    let addr = start_server(ServerConfig {
        workers: 1,
        clients_per_worker: 2,
        ..test_config()
    });

    let mut first = Client::connect(addr);
    first.expect_reply(WELCOME);
    let mut second = Client::connect(addr);
    second.expect_reply(WELCOME);

    let mut third = Client::connect(addr);
    let (cmd, content) = third.read_frame();
    assert_eq!(cmd, ERR_SERVER_FULL);
    assert!(content.contains("full capacity"));
    third.expect_closed();
}

#[test]
fn username_length_boundary() {
    let addr = start_server(test_config());
    let mut client = Client::connect(addr);
    client.expect_reply(WELCOME);

    client.send(0x02, &"a".repeat(32));
    client.expect_reply(ERR_USERNAME_LENGTH);

    client.send(0x02, &"a".repeat(31));
    client.expect_reply(ROOM_LIST_RESPONSE);
}

#[test]
fn room_name_length_boundary() {
    let addr = start_server(test_config());
    let mut client = Client::connect_named(addr, "eve");

    client.send(0x03, &"r".repeat(25));
    client.expect_reply(ERR_ROOM_NAME_INVALID);

    client.send(0x03, &"r".repeat(24));
    client.expect_reply(ROOM_CREATE_OK);
}

#[test]
fn full_room_admits_again_after_a_leave() {
    let addr = start_server(ServerConfig {
        room_capacity: 2,
        ..test_config()
    });
    let mut alice = Client::connect_named(addr, "alice");
    let mut bob = Client::connect_named(addr, "bob");
    let mut carol = Client::connect_named(addr, "carol");

    alice.send(0x03, "cozy");
    alice.expect_reply(ROOM_CREATE_OK);
    bob.send(0x05, "0");
    bob.expect_reply(ROOM_JOIN_OK);
    alice.expect_reply(ROOM_MSG);

    carol.send(0x05, "0");
    carol.expect_reply(ERR_ROOM_CAPACITY_FULL);

    bob.send(0x06, "dummy");
    bob.expect_reply(ROOM_LEAVE_OK);
    alice.expect_reply(ROOM_MSG);

    carol.send(0x05, "0");
    carol.expect_reply(ROOM_JOIN_OK);
    alice.expect_reply(ROOM_MSG);
}

#[test]
fn room_slots_exhaust_and_report_capacity() {
    let addr = start_server(ServerConfig {
        max_rooms: 2,
        ..test_config()
    });
    let mut alice = Client::connect_named(addr, "alice");
    let mut bob = Client::connect_named(addr, "bob");
    let mut carol = Client::connect_named(addr, "carol");

    alice.send(0x03, "one");
    alice.expect_reply(ROOM_CREATE_OK);
    bob.send(0x03, "two");
    bob.expect_reply(ROOM_CREATE_OK);

    carol.send(0x03, "three");
    let content = carol.expect_reply(ERR_ROOM_CAPACITY_FULL);
    assert!(content.contains("Maximum number of rooms"));
}

#[test]
fn commands_in_the_wrong_state_are_refused() {
    let addr = start_server(test_config());
    let mut client = Client::connect(addr);
    client.expect_reply(WELCOME);

    // A room message before any username.
    client.send(0x07, "hello");
    client.expect_reply(ERR_INVALID_STATE_CMD);

    client.send(0x02, "frank");
    client.expect_reply(ROOM_LIST_RESPONSE);

    // Leaving a room from the lobby.
    client.send(0x06, "dummy");
    client.expect_reply(ERR_INVALID_STATE_CMD);
}

#[test]
fn several_frames_in_one_segment_are_all_processed() {
    let addr = start_server(test_config());
    let mut client = Client::connect(addr);
    client.expect_reply(WELCOME);

    client.send_raw(b"\x02 grace\r\n\x04 dummy\r\n");
    client.expect_reply(ROOM_LIST_RESPONSE);
    client.expect_reply(ROOM_LIST_RESPONSE);
}

#[test]
fn unterminated_flood_disconnects_the_client() {
    let addr = start_server(test_config());
    let mut client = Client::connect_named(addr, "heidi");

    client.send_raw(&[b'x'; 200]);
    client.expect_closed();
}

#[test]
fn exit_command_closes_the_connection() {
    let addr = start_server(test_config());
    let mut client = Client::connect_named(addr, "ivan");

    client.send(0x01, "bye");
    client.expect_closed();
}

#[test]
fn dropping_a_member_connection_notifies_the_room() {
    let addr = start_server(test_config());
    let mut alice = Client::connect_named(addr, "alice");
    let mut bob = Client::connect_named(addr, "bob");

    alice.send(0x03, "general");
    alice.expect_reply(ROOM_CREATE_OK);
    bob.send(0x05, "0");
    bob.expect_reply(ROOM_JOIN_OK);
    alice.expect_reply(ROOM_MSG);

    drop(bob);
    assert_eq!(alice.expect_reply(ROOM_MSG), "bob left the room\n");
}

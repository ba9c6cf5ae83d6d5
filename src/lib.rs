//! A multi-room TCP chat server.
//!
//! A single dispatcher thread accepts connections and hands each one to a
//! fixed pool of worker threads. Every worker runs its own reactor and owns a
//! bounded slice of the connected clients; a per-client state machine drives
//! a framed text protocol against a fixed-size room registry.

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

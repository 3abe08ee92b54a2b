//! MG Network Drivers
//!
//! The connection-oriented layer of the mg messaging system. A server
//! accepts many peers over dual-stack UDP; a client holds one connection.
//! Both are driven by periodic `update(elapsed_ms)` calls from the
//! embedding application's loop: sockets are non-blocking, nothing inside
//! the drivers blocks or spawns threads, and all callbacks fire
//! synchronously inside an update or send call.
//!
//! The wire protocol itself (framing, fragmentation, the crypto filter)
//! lives in the `mg-protocol` crate.

pub mod client;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod endpoint;
pub mod error;
pub mod mock;
pub mod selector;
pub mod server;
pub mod socket;

pub use client::{Client, ClientEvents};
pub use config::Config;
pub use connection::{
    Communication, Connection, ConnectionState, NullCommunication, DEFAULT_IDLE_TIMEOUT_MS,
};
pub use connection_manager::ConnectionManager;
pub use endpoint::{Endpoint, Family};
pub use error::{Error, Result};
pub use selector::Selector;
pub use server::{Server, ServerEvents};
pub use socket::{Packet, Socket, SocketError};

//! Error types for the mg network drivers

use thiserror::Error;

use crate::socket::SocketError;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving connections and sockets
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] mg_protocol::Error),

    /// Socket error
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    /// The driver has not been started
    #[error("driver is not started")]
    NotStarted,

    /// The driver is already started
    #[error("driver is already started")]
    AlreadyStarted,

    /// The connection has not reached the connected state
    #[error("connection is not established")]
    NotConnected,

    /// A datagram could not be handed to the socket
    #[error("send failed")]
    SendFailed,

    /// The peer echoed a wrong authentication code
    #[error("authentication code mismatch")]
    AuthRejected,

    /// The connection table is at capacity
    #[error("connection table is full")]
    AtCapacity,

    /// The endpoint already has a connection
    #[error("endpoint already has a connection")]
    DuplicateEndpoint,

    /// No connection exists for the endpoint
    #[error("no connection for endpoint")]
    UnknownEndpoint,
}

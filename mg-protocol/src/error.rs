//! Error types for the mg wire protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while framing, parsing, or transforming packets
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad packet signature")]
    BadSignature,

    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("unknown packet type {0}")]
    BadPacketType(u8),

    #[error("declared length {0} exceeds the datagram limit")]
    TooLarge(usize),

    #[error("unknown channel {0}")]
    UnknownChannel(u8),

    #[error("write past the end of the buffer")]
    BufferOverflow,

    #[error("read past the end of the buffer")]
    BufferExhausted,

    #[error("peer key material rejected")]
    KeyRejected,

    #[error("no session key has been negotiated")]
    NotKeyed,

    #[error("message length {0} exceeds the message limit")]
    MessageTooLarge(usize),

    #[error("malformed message fragment")]
    InvalidMessage,

    #[error("fragment overlaps already received data")]
    SliceOverlap,

    #[error("message is not complete")]
    Incomplete,
}

//! MG Wire Protocol
//!
//! The framing and message layer of the mg messaging system: a bit-packed
//! packet header behind the `'M' 'G'` signature, message fragmentation with
//! out-of-order slice reassembly, and the Diffie-Hellman + ChaCha20 filter
//! that keys each connection.
//!
//! Drivers (sockets, connections, the server/client update loops) live in
//! the `mg-net` crate; this crate is transport-agnostic and fully
//! synchronous.

mod buffer;
mod error;
mod filter;
mod header;
mod message;

pub use buffer::{Buffer, BufferReader, BufferWriter};
pub use error::{Error, Result};
pub use filter::{DhChachaFilter, KEY_MATERIAL_LEN};
pub use header::{Header, PacketKind, HEADER_BITS, PROTOCOL_VERSION, SIGNATURE};
pub use message::{Message, MAX_MESSAGE_SIZE, MESSAGE_HEADER_BYTES, MESSAGE_LEN_BITS};

/// Largest datagram the protocol will produce or accept
pub const MAX_PACKET_SIZE: usize = 1200;

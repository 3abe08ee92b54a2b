//! Packet header framing
//!
//! Wire layout, in order: two signature bytes `'M' 'G'`, a 6-bit version
//! (only 1 is valid), a 3-bit packet type, and an 11-bit payload length
//! capped at the datagram size. 36 bits total, packed contiguously.

use crate::buffer::{BufferReader, BufferWriter};
use crate::{Error, Result, MAX_PACKET_SIZE};

/// The two signature bytes opening every datagram
pub const SIGNATURE: [u8; 2] = *b"MG";

/// Protocol version carried in the header
pub const PROTOCOL_VERSION: u8 = 1;

/// Header footprint in bits (2 signature bytes + 6 + 3 + 11)
pub const HEADER_BITS: usize = 36;

/// Packet type carried in the 3-bit header field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Handshake packet carrying key material and optionally an auth code
    Negotiation = 0,
    /// Application payload, framed as message fragments
    Payload = 1,
    /// Connection teardown
    Disconnect = 2,
}

impl PacketKind {
    fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(PacketKind::Negotiation),
            1 => Some(PacketKind::Payload),
            2 => Some(PacketKind::Disconnect),
            _ => None,
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketKind::Negotiation => write!(f, "NEGOTIATION"),
            PacketKind::Payload => write!(f, "PAYLOAD"),
            PacketKind::Disconnect => write!(f, "DISCONNECT"),
        }
    }
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Packet type
    pub kind: PacketKind,
    /// Payload byte length declared by the sender
    pub length: usize,
}

impl Header {
    /// Create a header for `kind` carrying `length` payload bytes
    pub fn new(kind: PacketKind, length: usize) -> Self {
        Self { kind, length }
    }

    /// Write the header at the writer's cursor
    pub fn encode(&self, writer: &mut BufferWriter<'_>) -> Result<()> {
        if self.length > MAX_PACKET_SIZE {
            return Err(Error::TooLarge(self.length));
        }

        writer.write_bytes(&SIGNATURE)?;
        writer.write_bits(PROTOCOL_VERSION as u64, 6)?;
        writer.write_bits(self.kind as u64, 3)?;
        writer.write_bits(self.length as u64, 11)?;
        Ok(())
    }

    /// Decode a header at the reader's cursor.
    ///
    /// Checks run in order: signature, version, type, length. On any error
    /// the reader position is undefined and the datagram must be discarded.
    pub fn decode(reader: &mut BufferReader<'_>) -> Result<Self> {
        let mut signature = [0u8; 2];
        reader.read_bytes(&mut signature)?;
        if signature != SIGNATURE {
            return Err(Error::BadSignature);
        }

        let version = reader.read_bits(6)? as u8;
        if version != PROTOCOL_VERSION {
            return Err(Error::BadVersion(version));
        }

        let raw_kind = reader.read_bits(3)? as u8;
        let kind = PacketKind::from_wire(raw_kind).ok_or(Error::BadPacketType(raw_kind))?;

        let length = reader.read_bits(11)? as usize;
        if length > MAX_PACKET_SIZE {
            return Err(Error::TooLarge(length));
        }

        Ok(Self { kind, length })
    }
}

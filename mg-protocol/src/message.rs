//! Message fragmentation and reassembly
//!
//! A message is an ordered run of slices tiling `[0, len)`: data slices for
//! byte ranges already received, empty slices for gaps still expected.
//! Fragments arrive in any order; merging fills gaps, splitting and
//! shrinking empties as needed, then consolidates adjacent data runs. A
//! message is complete once a single data slice covers the whole range.

use tracing::trace;

use crate::buffer::{BufferReader, BufferWriter};
use crate::{Error, Result};

/// Bits used to encode message lengths and slice offsets on the wire
pub const MESSAGE_LEN_BITS: usize = 12;

/// Largest payload a single message may carry
pub const MAX_MESSAGE_SIZE: usize = (1 << MESSAGE_LEN_BITS) - 1;

/// Wire subheader size: 32-bit seq + two 12-bit fields
pub const MESSAGE_HEADER_BYTES: usize = 7;

#[derive(Debug, Clone)]
enum Slice {
    /// Gap still expected from the peer
    Empty { offset: usize, len: usize },
    /// Byte range already received
    Data { offset: usize, data: Vec<u8> },
}

impl Slice {
    fn offset(&self) -> usize {
        match self {
            Slice::Empty { offset, .. } => *offset,
            Slice::Data { offset, .. } => *offset,
        }
    }

    fn len(&self) -> usize {
        match self {
            Slice::Empty { len, .. } => *len,
            Slice::Data { data, .. } => data.len(),
        }
    }

    fn end_offset(&self) -> usize {
        self.offset() + self.len()
    }

    fn is_data(&self) -> bool {
        matches!(self, Slice::Data { .. })
    }
}

/// A partially or fully reassembled message
#[derive(Debug, Clone)]
pub struct Message {
    seq: u32,
    len: usize,
    slices: Vec<Slice>,
}

impl Message {
    /// Create a complete outgoing message holding a copy of `data`
    pub fn new(seq: u32, data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidMessage);
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(data.len()));
        }

        Ok(Self {
            seq,
            len: data.len(),
            slices: vec![Slice::Data {
                offset: 0,
                data: data.to_vec(),
            }],
        })
    }

    /// Parse one fragment at the reader's cursor.
    ///
    /// Wire layout: 32-bit seq, then length and slice offset in
    /// [`MESSAGE_LEN_BITS`] bits each, then data up to the end of the
    /// datagram, clamped to `length - slice_offset`. The slack of a
    /// partially filled trailing byte never counts as data.
    pub fn from_reader(reader: &mut BufferReader<'_>) -> Result<Self> {
        let mut seq_bytes = [0u8; 4];
        reader.read_bytes(&mut seq_bytes)?;
        let seq = u32::from_be_bytes(seq_bytes);

        let len = reader.read_bits(MESSAGE_LEN_BITS)? as usize;
        if len == 0 || len > MAX_MESSAGE_SIZE {
            return Err(Error::InvalidMessage);
        }

        let offset = reader.read_bits(MESSAGE_LEN_BITS)? as usize;
        if offset >= len {
            return Err(Error::InvalidMessage);
        }

        let data_len = reader.remaining_bytes().min(len - offset);
        if data_len == 0 {
            return Err(Error::InvalidMessage);
        }
        let mut data = vec![0u8; data_len];
        reader.read_bytes(&mut data)?;

        let end = offset + data_len;
        let mut slices = Vec::with_capacity(3);
        if offset > 0 {
            slices.push(Slice::Empty { offset: 0, len: offset });
        }
        slices.push(Slice::Data { offset, data });
        if end < len {
            slices.push(Slice::Empty {
                offset: end,
                len: len - end,
            });
        }

        Ok(Self { seq, len, slices })
    }

    /// Message sequence number
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Total declared length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the message declares no payload
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_valid(&self) -> bool {
        self.len > 0 && !self.slices.is_empty()
    }

    /// A message is complete once a single data slice covers `[0, len)`
    pub fn is_complete(&self) -> bool {
        self.is_valid() && self.slices.len() == 1 && self.slices[0].is_data()
    }

    /// Payload bytes of a complete message
    pub fn payload(&self) -> Option<&[u8]> {
        if !self.is_complete() {
            return None;
        }
        match &self.slices[0] {
            Slice::Data { data, .. } => Some(data),
            Slice::Empty { .. } => None,
        }
    }

    /// Consume the message, returning the payload of a complete one
    pub fn into_payload(mut self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        match self.slices.pop() {
            Some(Slice::Data { data, .. }) => Some(data),
            _ => None,
        }
    }

    /// Offset of the first data slice, or 0 when none exists
    pub fn first_valid_offset(&self) -> usize {
        self.slices
            .iter()
            .find(|slice| slice.is_data())
            .map(|slice| slice.offset())
            .unwrap_or(0)
    }

    /// Merge another partial view of the same message into this one.
    ///
    /// The merge is atomic: if any donor slice overlaps received data or
    /// fits no gap, `self` is left untouched and the fragment is dropped.
    pub fn merge(&mut self, mut rhs: Message) -> Result<()> {
        if !self.is_valid() || !rhs.is_valid() {
            return Err(Error::InvalidMessage);
        }
        if self.seq != rhs.seq || self.len != rhs.len {
            return Err(Error::InvalidMessage);
        }

        // Normalise so the side holding the earliest data hosts the merge,
        // but only commit the swap once the donor is known to fit.
        let host_is_self = self.first_valid_offset() <= rhs.first_valid_offset();
        let fits = if host_is_self {
            Self::fits(self, &rhs)
        } else {
            Self::fits(&rhs, self)
        };
        if !fits {
            trace!(seq = self.seq, "dropping fragment that fits no gap");
            return Err(Error::SliceOverlap);
        }

        if !host_is_self {
            std::mem::swap(self, &mut rhs);
        }

        for slice in rhs.slices {
            if let Slice::Data { offset, data } = slice {
                self.insert_data(offset, data);
            }
        }
        self.consolidate();

        Ok(())
    }

    /// Whether every donor data slice is enclosed by an empty slice of the host
    fn fits(host: &Message, donor: &Message) -> bool {
        donor.slices.iter().filter(|slice| slice.is_data()).all(|slice| {
            host.slices.iter().any(|gap| {
                !gap.is_data()
                    && gap.offset() <= slice.offset()
                    && slice.end_offset() <= gap.end_offset()
            })
        })
    }

    fn insert_data(&mut self, offset: usize, data: Vec<u8>) {
        let end = offset + data.len();
        let Some(index) = self.slices.iter().position(|gap| {
            !gap.is_data() && gap.offset() <= offset && end <= gap.end_offset()
        }) else {
            // ruled out by the fits() pass
            return;
        };

        let gap_offset = self.slices[index].offset();
        let gap_end = self.slices[index].end_offset();

        let mut replacement = Vec::with_capacity(3);
        if offset > gap_offset {
            replacement.push(Slice::Empty {
                offset: gap_offset,
                len: offset - gap_offset,
            });
        }
        replacement.push(Slice::Data { offset, data });
        if end < gap_end {
            replacement.push(Slice::Empty {
                offset: end,
                len: gap_end - end,
            });
        }

        self.slices.splice(index..=index, replacement);
    }

    /// Concatenate any two adjacent data slices into one
    fn consolidate(&mut self) {
        let mut out: Vec<Slice> = Vec::with_capacity(self.slices.len());
        for slice in std::mem::take(&mut self.slices) {
            match out.last_mut() {
                Some(Slice::Data { data, .. }) if slice.is_data() => {
                    if let Slice::Data { data: next, .. } = slice {
                        data.extend_from_slice(&next);
                    }
                }
                _ => out.push(slice),
            }
        }
        self.slices = out;
    }

    /// Write one fragment starting at `offset`, returning the number of
    /// payload bytes written (excluding the subheader).
    ///
    /// Only defined on complete messages; the caller loops, advancing
    /// `offset` by the returned count, until the whole payload is out.
    pub fn write(&self, writer: &mut BufferWriter<'_>, offset: usize) -> Result<usize> {
        let payload = self.payload().ok_or(Error::Incomplete)?;
        if offset >= self.len {
            return Err(Error::InvalidMessage);
        }
        if writer.remaining_bytes() <= MESSAGE_HEADER_BYTES {
            return Err(Error::BufferOverflow);
        }

        writer.write_bytes(&self.seq.to_be_bytes())?;
        writer.write_bits(self.len as u64, MESSAGE_LEN_BITS)?;
        writer.write_bits(offset as u64, MESSAGE_LEN_BITS)?;

        let count = writer.remaining_bytes().min(self.len - offset);
        writer.write_bytes(&payload[offset..offset + count])?;

        Ok(count)
    }

    #[cfg(test)]
    fn slice_ranges(&self) -> Vec<(usize, usize, bool)> {
        self.slices
            .iter()
            .map(|slice| (slice.offset(), slice.len(), slice.is_data()))
            .collect()
    }
}

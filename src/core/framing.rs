//! # Length-Prefixed Framing
//!
//! Recovers packet boundaries from a byte stream and lays out outbound packets.
//!
//! ## Wire Format
//! ```text
//! [Length(N)] [Id(M)] [Body(length - N - M)]
//! ```
//! - `N` is 1, 2 or 4 bytes; the value is the total packet length, header included
//! - `M` is 0 (no id), 1, 2 or 4 bytes holding the packet-type id
//! - both header fields use the configured byte order
//!
//! ## Security
//! - Declared lengths are validated before any body bytes are buffered
//! - Lengths below the header size or above the configured maximum are rejected

use crate::core::packet::Writable;
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Byte order of the length and id headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Network order
    #[default]
    BigEndian,
    LittleEndian,
}

/// One packet cut out of the stream, header consumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Packet-type id, present when the framing carries an id field
    pub id: Option<u32>,
    /// Remaining `length - header` bytes
    pub body: Bytes,
}

/// Header layout shared by the read and write lanes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    length_bytes: usize,
    id_bytes: usize,
    order: ByteOrder,
    max_packet_size: usize,
}

impl Framing {
    /// Create a framing with the given header widths.
    ///
    /// `length_bytes` must be 1, 2 or 4; `id_bytes` must be 0, 1, 2 or 4.
    pub fn new(length_bytes: usize, id_bytes: usize, order: ByteOrder) -> Result<Self> {
        if !matches!(length_bytes, 1 | 2 | 4) {
            return Err(ProtocolError::ConfigError(format!(
                "Invalid length header width: {length_bytes}"
            )));
        }
        if !matches!(id_bytes, 0 | 1 | 2 | 4) {
            return Err(ProtocolError::ConfigError(format!(
                "Invalid id header width: {id_bytes}"
            )));
        }
        Ok(Self {
            length_bytes,
            id_bytes,
            order,
            max_packet_size: max_for_width(length_bytes),
        })
    }

    /// Two-byte big-endian length, no id.
    pub fn length_prefixed() -> Self {
        Self {
            length_bytes: 2,
            id_bytes: 0,
            order: ByteOrder::BigEndian,
            max_packet_size: max_for_width(2),
        }
    }

    /// Two-byte big-endian length followed by a two-byte id.
    pub fn id_prefixed() -> Self {
        Self {
            id_bytes: 2,
            ..Self::length_prefixed()
        }
    }

    /// Cap accepted packet sizes; clamped to what the length header can express.
    pub fn with_max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max.min(max_for_width(self.length_bytes));
        self
    }

    pub fn length_bytes(&self) -> usize {
        self.length_bytes
    }

    pub fn id_bytes(&self) -> usize {
        self.id_bytes
    }

    pub fn has_id(&self) -> bool {
        self.id_bytes > 0
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Length header plus id field
    pub fn header_len(&self) -> usize {
        self.length_bytes + self.id_bytes
    }

    /// Read the declared length without consuming anything.
    ///
    /// Returns `None` while fewer than `length_bytes` bytes are buffered.
    pub fn peek_length(&self, view: &[u8]) -> Option<usize> {
        if view.len() < self.length_bytes {
            return None;
        }
        let mut header = &view[..self.length_bytes];
        Some(self.get_uint(&mut header, self.length_bytes) as usize)
    }

    /// Reject lengths that cannot delimit a packet.
    pub fn check_length(&self, length: usize) -> Result<()> {
        if length < self.header_len() {
            return Err(ProtocolError::MalformedLength {
                length,
                reason: constants::ERR_LENGTH_BELOW_HEADER,
            });
        }
        if length > self.max_packet_size {
            return Err(ProtocolError::OversizedPacket(length));
        }
        Ok(())
    }

    /// Cut the next complete packet off the front of `view`.
    ///
    /// Returns `Ok(None)` and leaves `view` untouched when the packet is not yet
    /// complete. An invalid length is an error and leaves `view` untouched too.
    pub fn next_frame(&self, view: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(length) = self.peek_length(view) else {
            return Ok(None);
        };
        self.check_length(length)?;
        if view.len() < length {
            return Ok(None);
        }

        // Copy out so the read buffer keeps its whole allocation for reuse
        let mut packet = Bytes::copy_from_slice(&view[..length]);
        view.advance(length);

        packet.advance(self.length_bytes);
        let id = if self.has_id() {
            Some(self.get_uint(&mut packet, self.id_bytes) as u32)
        } else {
            None
        };
        Ok(Some(Frame { id, body: packet }))
    }

    /// Whether `view` starts with a packet that `next_frame` would return.
    pub fn has_complete_frame(&self, view: &[u8]) -> bool {
        matches!(self.peek_length(view), Some(length) if length >= self.header_len() && view.len() >= length)
    }

    /// Reserve header space at the end of `buf` and write the id field.
    ///
    /// Returns the packet start offset to hand to [`Framing::write_packet_size`].
    pub fn prepare_write_position(&self, buf: &mut BytesMut, id: u32) -> Result<usize> {
        let start = buf.len();
        buf.reserve(self.header_len());
        buf.put_bytes(0, self.length_bytes);
        if self.has_id() {
            if self.id_bytes < 4 && u64::from(id) > max_for_width(self.id_bytes) as u64 {
                buf.truncate(start);
                return Err(ProtocolError::EncodeError(format!(
                    "{}: {id}",
                    constants::ERR_ID_OVERFLOW
                )));
            }
            self.put_uint(buf, u64::from(id), self.id_bytes);
        }
        Ok(start)
    }

    /// Backpatch the length header of the packet that starts at `start`.
    ///
    /// Returns the total packet length.
    pub fn write_packet_size(&self, buf: &mut BytesMut, start: usize) -> Result<usize> {
        let total = buf.len() - start;
        if total > self.max_packet_size {
            buf.truncate(start);
            return Err(ProtocolError::OversizedPacket(total));
        }
        let header = &mut buf[start..start + self.length_bytes];
        match self.order {
            ByteOrder::BigEndian => {
                header.copy_from_slice(&(total as u64).to_be_bytes()[8 - self.length_bytes..])
            }
            ByteOrder::LittleEndian => {
                header.copy_from_slice(&(total as u64).to_le_bytes()[..self.length_bytes])
            }
        }
        Ok(total)
    }

    /// Append one complete packet to `buf`.
    ///
    /// On error `buf` is restored to its previous length.
    pub fn encode(&self, packet: &dyn Writable, buf: &mut BytesMut) -> Result<usize> {
        let start = self.prepare_write_position(buf, packet.packet_id())?;
        if let Err(e) = packet.write(buf) {
            buf.truncate(start);
            return Err(e);
        }
        self.write_packet_size(buf, start)
    }

    fn get_uint(&self, buf: &mut impl Buf, width: usize) -> u64 {
        match self.order {
            ByteOrder::BigEndian => buf.get_uint(width),
            ByteOrder::LittleEndian => buf.get_uint_le(width),
        }
    }

    fn put_uint(&self, buf: &mut BytesMut, value: u64, width: usize) {
        match self.order {
            ByteOrder::BigEndian => buf.put_uint(value, width),
            ByteOrder::LittleEndian => buf.put_uint_le(value, width),
        }
    }
}

impl Default for Framing {
    fn default() -> Self {
        Self::length_prefixed()
    }
}

#[inline]
fn max_for_width(width: usize) -> usize {
    match width {
        1 => u8::MAX as usize,
        2 => u16::MAX as usize,
        _ => u32::MAX as usize,
    }
}

//! # Packet Model
//!
//! The serialize/deserialize contract between application packets and the
//! framing layer.
//!
//! - [`Writable`] writes a packet body; the framing layer reserves the header in
//!   front of it and backpatches the length afterwards.
//! - [`Readable`] populates a packet from a body that framing already delimited.
//! - [`Packet`] is both, and is what the id-based registry produces.
//!
//! Three variants ship with the crate: raw bytes ([`RawPacket`]), UTF-8 strings
//! (`String`) and registry-dispatched packets (`Box<dyn Packet>`).

use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::any::Any;
use std::fmt;

/// Produces the body bytes of an outbound packet.
pub trait Writable: Send + 'static {
    /// Append the packet body to `buf`.
    fn write(&self, buf: &mut BytesMut) -> Result<()>;

    /// Id written after the length header when the framing carries one.
    fn packet_id(&self) -> u32 {
        0
    }
}

/// Consumes the body bytes of an inbound packet.
pub trait Readable: Send + 'static {
    /// Populate `self` from `buf`, which holds exactly one packet body.
    fn read(&mut self, buf: &mut Bytes) -> Result<()>;
}

/// Blanket conversion used to downcast registry packets.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A packet that can travel in both directions through an id-based registry.
pub trait Packet: Readable + Writable + AsAny + Sync + fmt::Debug {}

impl<T> Packet for T where T: Readable + Writable + Sync + fmt::Debug + 'static {}

impl dyn Packet {
    /// Downcast to the concrete packet type.
    pub fn downcast_ref<T: Packet>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    /// Whether the concrete packet type is `T`.
    pub fn is<T: Packet>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }
}

impl<T: Writable + ?Sized> Writable for Box<T> {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        (**self).write(buf)
    }

    fn packet_id(&self) -> u32 {
        (**self).packet_id()
    }
}

/// Uninterpreted packet: an optional id and the body bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPacket {
    pub id: u32,
    pub body: Bytes,
}

impl RawPacket {
    pub fn new(id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }
}

impl From<Vec<u8>> for RawPacket {
    fn from(body: Vec<u8>) -> Self {
        Self::new(0, body)
    }
}

impl From<&'static [u8]> for RawPacket {
    fn from(body: &'static [u8]) -> Self {
        Self::new(0, Bytes::from_static(body))
    }
}

impl Writable for RawPacket {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(&self.body);
        Ok(())
    }

    fn packet_id(&self) -> u32 {
        self.id
    }
}

impl Readable for RawPacket {
    fn read(&mut self, buf: &mut Bytes) -> Result<()> {
        self.body = buf.split_to(buf.len());
        Ok(())
    }
}

impl Writable for Bytes {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(self);
        Ok(())
    }
}

impl Writable for Vec<u8> {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(self);
        Ok(())
    }
}

impl Writable for String {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(self.as_bytes());
        Ok(())
    }
}

impl Writable for &'static str {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(self.as_bytes());
        Ok(())
    }
}

impl Readable for String {
    fn read(&mut self, buf: &mut Bytes) -> Result<()> {
        let body = buf.split_to(buf.len());
        *self = String::from_utf8(body.to_vec())
            .map_err(|_| ProtocolError::DecodeError(constants::ERR_INVALID_UTF8.into()))?;
        Ok(())
    }
}

/// Read a fixed-size big-endian integer, failing instead of panicking on short input.
///
/// Helper for hand-written [`Readable`] implementations.
pub fn read_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::DecodeError(
            constants::ERR_TRUNCATED_BODY.into(),
        ));
    }
    Ok(buf.get_u32())
}

/// Read a `u16`-length-prefixed UTF-8 string.
pub fn read_string(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::DecodeError(
            constants::ERR_TRUNCATED_BODY.into(),
        ));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::DecodeError(
            constants::ERR_TRUNCATED_BODY.into(),
        ));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProtocolError::DecodeError(constants::ERR_INVALID_UTF8.into()))
}

/// Write a `u16`-length-prefixed UTF-8 string.
pub fn write_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| ProtocolError::EncodeError(format!("String too long: {}", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

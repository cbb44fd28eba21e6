//! # Inbound Decoders
//!
//! Turn a delimited [`Frame`] into the packet type handed to subscribers.
//!
//! | Decoder                 | Packet type        | Framing id field |
//! |-------------------------|--------------------|------------------|
//! | [`RawDecoder`]          | [`RawPacket`]      | optional         |
//! | [`StringDecoder`]       | `String`           | ignored          |
//! | [`PacketRegistry`]      | `Box<dyn Packet>`  | required         |
//!
//! [`PacketRegistry`]: crate::core::registry::PacketRegistry

use crate::core::framing::Frame;
use crate::core::packet::{RawPacket, Readable};
use crate::error::Result;

/// Builds an inbound packet from one frame.
pub trait Decoder: Send + Sync + 'static {
    type Packet: Send + 'static;

    fn decode(&self, frame: Frame) -> Result<Self::Packet>;
}

/// Hands frames through as [`RawPacket`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Packet = RawPacket;

    fn decode(&self, frame: Frame) -> Result<RawPacket> {
        Ok(RawPacket {
            id: frame.id.unwrap_or(0),
            body: frame.body,
        })
    }
}

/// Decodes each body as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDecoder;

impl Decoder for StringDecoder {
    type Packet = String;

    fn decode(&self, frame: Frame) -> Result<String> {
        let mut body = frame.body;
        let mut text = String::new();
        text.read(&mut body)?;
        Ok(text)
    }
}

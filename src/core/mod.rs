//! # Core Protocol Components
//!
//! Wire framing, the packet model and the inbound decoders.
//!
//! ## Components
//! - **Framing**: length-prefixed header layout, parsing and backpatching
//! - **Packet**: `Readable` / `Writable` contract and the built-in variants
//! - **Codec**: decoders turning frames into subscriber-facing packets
//! - **Registry**: id → factory mapping for the id-based variant
//!
//! ## Wire Format
//! ```text
//! [Length(1|2|4)] [Id(0|1|2|4)] [Body(N)]
//! ```
//!
//! ## Security
//! - Declared lengths are bounded by `max_packet_size` before buffering
//! - Lengths smaller than the header are rejected

pub mod codec;
pub mod framing;
pub mod packet;
pub mod registry;

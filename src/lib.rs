//! # packet-channel
//!
//! Asynchronous, packet-oriented connections over byte streams.
//!
//! Messages travel as length-prefixed packets over any stream that does not
//! preserve message boundaries (TCP, Unix sockets, in-memory pipes),
//! optionally secured by TLS. Each connection keeps exactly one read and at
//! most one write in flight, delivers inbound packets to subscribers in wire
//! order, and recycles its buffers through a pluggable allocator.
//!
//! ## Layers
//! - [`core`]: framing, the packet model, decoders and the id registry
//! - [`buffer`]: buffer allocation and reuse
//! - [`protocol`]: subscriber dispatch
//! - [`transport`]: channels and TLS sessions
//! - [`connection`]: the read and write lanes of one connection
//! - [`network`]: connection factory and registry
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics
//!
//! ## Quick start
//! ```rust,no_run
//! use packet_channel::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let network = Network::new(NetworkConfig::default())?;
//! let conn = network.connect("127.0.0.1:7000", RawDecoder).await?;
//! conn.on_receive(|packet: &RawPacket| {
//!     println!("{} bytes", packet.body.len());
//!     Ok(())
//! });
//! conn.send(RawPacket::new(0, b"hello".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;
pub mod transport;
pub mod utils;

/// Commonly used types
pub mod prelude {
    pub use crate::buffer::{BufferAllocator, DefaultAllocator, ReusingAllocator};
    pub use crate::config::{FramingErrorPolicy, NetworkConfig};
    pub use crate::connection::{Connection, Feedback};
    pub use crate::core::codec::{Decoder, RawDecoder, StringDecoder};
    pub use crate::core::framing::{ByteOrder, Frame, Framing};
    pub use crate::core::packet::{Packet, RawPacket, Readable, Writable};
    pub use crate::core::registry::PacketRegistry;
    pub use crate::error::{CloseReason, ProtocolError, Result};
    pub use crate::network::{ConnectionHandle, Network};
    pub use crate::protocol::SubscriptionId;
    pub use crate::transport::Channel;
}

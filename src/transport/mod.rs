//! # Transport Layer
//!
//! The byte streams connections run over, and the TLS session that can sit
//! between a stream and the framing layer.
//!
//! ## Components
//! - **Channel**: TCP, in-memory duplex and Unix domain streams
//! - **TLS**: hand-driven rustls sessions plus PEM config loaders

pub mod channel;
pub mod tls;

pub use channel::Channel;
pub use tls::{HandshakeStatus, TlsClientConfig, TlsServerConfig, TlsSession};

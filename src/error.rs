//! # Error Types
//!
//! Error handling for the packet connection layer.
//!
//! This module defines every error variant that can surface from framing,
//! serialization, the TLS engine, configuration loading and channel I/O.
//!
//! ## Error Categories
//! - **I/O Errors**: channel read/write failures and peer EOF
//! - **Framing Errors**: malformed length headers, oversized packets, unknown ids
//! - **Codec Errors**: packet bodies that fail to encode or decode
//! - **TLS Errors**: handshake failures and record-layer errors
//! - **Configuration Errors**: invalid TOML, invalid settings
//!
//! None of these reach the application from inside the read or write lanes.
//! The lanes log them and convert them into a [`CloseReason`] or a `false`
//! feedback resolution.
//!
//! ## Example Usage
//! ```rust
//! use packet_channel::error::{ProtocolError, Result};
//!
//! fn check_length(length: usize, limit: usize) -> Result<()> {
//!     if length > limit {
//!         return Err(ProtocolError::OversizedPacket(length));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_length(10, 16).is_ok());
//! assert!(matches!(check_length(32, 16), Err(ProtocolError::OversizedPacket(32))));
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_LENGTH_BELOW_HEADER: &str = "Declared length is smaller than the packet header";
    pub const ERR_ID_OVERFLOW: &str = "Packet id does not fit the configured id width";

    /// Codec errors
    pub const ERR_INVALID_UTF8: &str = "Packet body is not valid UTF-8";
    pub const ERR_TRUNCATED_BODY: &str = "Packet body ended early";
    pub const ERR_DECODER_PANIC: &str = "Packet decoder panicked";
    pub const ERR_ENCODER_PANIC: &str = "Packet writer panicked";

    /// TLS errors
    pub const ERR_TLS_SESSION_LOCK: &str = "TLS session lock poisoned";
    pub const ERR_NO_PRIVATE_KEY: &str = "No private key found";
    pub const ERR_NO_CERTIFICATES: &str = "No certificates found";
}

/// ProtocolError is the error type for all crate operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid packet header")]
    InvalidHeader,

    #[error("Malformed packet length {length}: {reason}")]
    MalformedLength { length: usize, reason: &'static str },

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Unknown packet id: {0}")]
    UnknownPacketId(u32),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error leaves the inbound byte stream without a recoverable
    /// packet boundary.
    pub fn corrupts_stream(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedLength { .. }
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::InvalidHeader
        )
    }
}

impl ProtocolError {
    /// Wrap an engine error raised before the handshake finished.
    pub fn handshake(err: rustls::Error) -> Self {
        ProtocolError::HandshakeError(err.to_string())
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, ProtocolError::HandshakeError(_))
    }
}

impl From<rustls::Error> for ProtocolError {
    fn from(err: rustls::Error) -> Self {
        ProtocolError::TlsError(err.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called by the application or the owning network.
    Local,
    /// The peer closed its side of the stream.
    Eof,
    /// A read or write on the channel failed.
    Io,
    /// The inbound stream could not be framed or decoded.
    Protocol,
    /// The TLS handshake failed.
    Handshake,
}

impl CloseReason {
    /// Whether the teardown was requested rather than caused by a failure.
    pub fn is_local(self) -> bool {
        self == CloseReason::Local
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Local => "local",
            CloseReason::Eof => "eof",
            CloseReason::Io => "io",
            CloseReason::Protocol => "protocol",
            CloseReason::Handshake => "handshake",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_corruption_classification() {
        assert!(ProtocolError::OversizedPacket(1 << 30).corrupts_stream());
        assert!(ProtocolError::MalformedLength {
            length: 1,
            reason: constants::ERR_LENGTH_BELOW_HEADER
        }
        .corrupts_stream());
        assert!(!ProtocolError::UnknownPacketId(7).corrupts_stream());
        assert!(!ProtocolError::DecodeError("bad".into()).corrupts_stream());
        assert!(ProtocolError::InvalidHeader.corrupts_stream());
    }

    #[test]
    fn test_handshake_errors_from_rustls() {
        let err = ProtocolError::handshake(rustls::Error::DecryptError);
        assert!(matches!(err, ProtocolError::HandshakeError(_)));
        assert!(err.is_handshake());
        assert!(!ProtocolError::from(rustls::Error::DecryptError).is_handshake());
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::Local.to_string(), "local");
        assert_eq!(CloseReason::Handshake.to_string(), "handshake");
        assert!(CloseReason::Local.is_local());
        assert!(!CloseReason::Eof.is_local());
    }
}

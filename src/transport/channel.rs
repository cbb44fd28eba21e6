//! Byte-stream channels a connection can run over.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// A bidirectional byte stream.
///
/// Connections split a channel into read and write halves and drive each
/// from its own lane.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Address of the remote end, when the channel has one.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

impl Channel for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// In-memory pipe, mostly useful in tests
impl Channel for DuplexStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[cfg(unix)]
impl Channel for tokio::net::UnixStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

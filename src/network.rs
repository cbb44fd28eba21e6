//! # Network
//!
//! Owner and factory of connections.
//!
//! A `Network` holds what its connections share: configuration, framing,
//! buffer allocator, metrics and the runtime their lanes are spawned on. It
//! wraps channels into [`Connection`]s, optionally behind TLS, and keeps track
//! of them until they close.
//!
//! ## Usage
//! ```rust,no_run
//! use futures::StreamExt;
//! use packet_channel::config::NetworkConfig;
//! use packet_channel::core::codec::RawDecoder;
//! use packet_channel::network::Network;
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> packet_channel::error::Result<()> {
//! let network = Network::new(NetworkConfig::default())?;
//! let listener = TcpListener::bind("127.0.0.1:7000").await?;
//!
//! let mut incoming = network.incoming(listener, RawDecoder);
//! while let Some(conn) = incoming.next().await {
//!     let conn = conn?;
//!     let echo = conn.clone();
//!     conn.on_receive(move |packet| {
//!         echo.send(packet.clone());
//!         Ok(())
//!     });
//! }
//! # Ok(())
//! # }
//! ```

use crate::buffer::{allocator_for, BufferAllocator};
use crate::config::NetworkConfig;
use crate::connection::{Connection, ConnectionParts, Lifecycle};
use crate::core::codec::{Decoder, RawDecoder};
use crate::core::framing::Framing;
use crate::error::{ProtocolError, Result};
use crate::transport::channel::Channel;
use crate::transport::tls::TlsSession;
use crate::utils::metrics::Metrics;
use futures::{Stream, StreamExt};
use rustls::{ClientConfig, ServerConfig};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{debug, info, instrument};

type Registry = Mutex<HashMap<u64, Arc<dyn Lifecycle>>>;

/// Decoder-independent handle to a connection owned by a [`Network`].
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<dyn Lifecycle>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.idle_for()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn close(&self) {
        self.inner.close()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("remote", &self.remote_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Factory and registry for connections sharing one configuration.
pub struct Network {
    config: Arc<NetworkConfig>,
    framing: Framing,
    allocator: Arc<dyn BufferAllocator>,
    metrics: Arc<Metrics>,
    runtime: Handle,
    connections: Arc<Registry>,
    next_id: AtomicU64,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("framing", &self.framing)
            .field("allocator", &self.allocator)
            .field("active", &self.active_connections())
            .finish()
    }
}

impl Network {
    /// Create a network with the allocator selected by `config.buffers`.
    ///
    /// Must be called from within a tokio runtime; connection lanes are
    /// spawned on it.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        let allocator = allocator_for(&config.buffers);
        Self::with_allocator(config, allocator)
    }

    /// Create a network with a caller-supplied allocator.
    pub fn with_allocator(
        config: NetworkConfig,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Self> {
        config.validate_strict()?;
        let framing = config.framing()?;
        let runtime = Handle::try_current()
            .map_err(|e| ProtocolError::Custom(format!("No tokio runtime: {e}")))?;

        debug!(?framing, reuse_buffers = config.buffers.reuse_buffers, "Network created");
        Ok(Self {
            config: Arc::new(config),
            framing,
            allocator,
            metrics: Arc::new(Metrics::new()),
            runtime,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.allocator
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Wrap `channel` in a connection delivering [`RawPacket`](crate::core::packet::RawPacket)s.
    pub fn connection<C: Channel>(&self, channel: C) -> Connection<RawDecoder> {
        self.connection_with_decoder(channel, RawDecoder)
    }

    /// Wrap `channel` in a connection decoding with `decoder`.
    pub fn connection_with_decoder<C, D>(&self, channel: C, decoder: D) -> Connection<D>
    where
        C: Channel,
        D: Decoder,
    {
        self.wrap(channel, Arc::new(decoder), None)
    }

    /// Wrap `channel` as the server side of a TLS session.
    ///
    /// The handshake runs once the connection reads, that is after the first
    /// subscription or send.
    pub fn tls_server_connection<C, D>(
        &self,
        channel: C,
        config: Arc<ServerConfig>,
        decoder: D,
    ) -> Result<Connection<D>>
    where
        C: Channel,
        D: Decoder,
    {
        let session = TlsSession::server(config)?;
        Ok(self.wrap(channel, Arc::new(decoder), Some(session)))
    }

    /// Wrap `channel` as the client side of a TLS session. The ClientHello is
    /// sent immediately.
    pub fn tls_client_connection<C, D>(
        &self,
        channel: C,
        config: Arc<ClientConfig>,
        server_name: &str,
        decoder: D,
    ) -> Result<Connection<D>>
    where
        C: Channel,
        D: Decoder,
    {
        let session = TlsSession::client(config, server_name)?;
        Ok(self.wrap(channel, Arc::new(decoder), Some(session)))
    }

    /// Open a TCP connection to `addr`.
    #[instrument(skip(self, addr, decoder))]
    pub async fn connect<A, D>(&self, addr: A, decoder: D) -> Result<Connection<D>>
    where
        A: ToSocketAddrs,
        D: Decoder,
    {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(peer = ?stream.peer_addr().ok(), "Connected");
        Ok(self.connection_with_decoder(stream, decoder))
    }

    /// Accept one TCP connection from `listener`.
    pub async fn accept<D: Decoder>(
        &self,
        listener: &TcpListener,
        decoder: D,
    ) -> Result<Connection<D>> {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%peer, "Accepted connection");
        Ok(self.connection_with_decoder(stream, decoder))
    }

    /// Stream of connections accepted from `listener`, all sharing `decoder`.
    pub fn incoming<'a, D: Decoder>(
        &'a self,
        listener: TcpListener,
        decoder: D,
    ) -> impl Stream<Item = Result<Connection<D>>> + 'a {
        let decoder = Arc::new(decoder);
        TcpListenerStream::new(listener).map(move |accepted| -> Result<Connection<D>> {
            let stream = accepted?;
            stream.set_nodelay(true)?;
            Ok(self.wrap(stream, decoder.clone(), None))
        })
    }

    /// Connections created by this network that have not closed
    pub fn active_connections(&self) -> usize {
        self.lock_connections().len()
    }

    /// Live connections with no completed read or write for at least `threshold`.
    pub fn idle_connections(&self, threshold: Duration) -> Vec<ConnectionHandle> {
        self.lock_connections()
            .values()
            .filter(|c| !c.is_closed() && c.idle_for() >= threshold)
            .map(|c| ConnectionHandle { inner: c.clone() })
            .collect()
    }

    /// Close every live connection.
    pub fn close_all(&self) {
        // Collected first: closing runs hooks that lock the registry
        let live: Vec<_> = self.lock_connections().values().cloned().collect();
        let count = live.len();
        for conn in live {
            conn.close();
        }
        info!(count, "Closed all connections");
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<dyn Lifecycle>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wrap<C, D>(&self, channel: C, decoder: Arc<D>, tls: Option<TlsSession>) -> Connection<D>
    where
        C: Channel,
        D: Decoder,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(
            channel,
            ConnectionParts {
                id,
                framing: self.framing,
                decoder,
                settings: self.config.connection.clone(),
                allocator: self.allocator.clone(),
                metrics: self.metrics.clone(),
                runtime: self.runtime.clone(),
                tls,
            },
        );

        self.lock_connections().insert(id, conn.lifecycle());
        let registry: Weak<Registry> = Arc::downgrade(&self.connections);
        conn.on_close(move |_| {
            if let Some(registry) = registry.upgrade() {
                registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
        });
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::RawPacket;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_registry_tracks_lifecycle() {
        let network = Network::new(NetworkConfig::default()).unwrap();
        let (a, _b) = duplex(1024);
        let (c, _d) = duplex(1024);

        let first = network.connection(a);
        let second = network.connection(c);
        assert_ne!(first.id(), second.id());
        assert_eq!(network.active_connections(), 2);
        assert_eq!(network.metrics().snapshot().connections_active, 2);

        first.close();
        assert_eq!(network.active_connections(), 1);

        network.close_all();
        assert!(second.is_closed());
        assert_eq!(network.active_connections(), 0);
        assert_eq!(network.metrics().snapshot().connections_active, 0);
    }

    #[tokio::test]
    async fn test_idle_connections() {
        let network = Network::new(NetworkConfig::default()).unwrap();
        let (a, _b) = duplex(1024);
        let conn = network.connection(a);

        assert_eq!(network.idle_connections(Duration::ZERO).len(), 1);
        let idle = network.idle_connections(Duration::from_secs(3600));
        assert!(idle.is_empty());

        let handle = &network.idle_connections(Duration::ZERO)[0];
        assert_eq!(handle.id(), conn.id());
        handle.close();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let network = Network::new(NetworkConfig::default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, server) = tokio::join!(
            network.connect(addr, RawDecoder),
            network.accept(&listener, RawDecoder)
        );
        let client = client.unwrap();
        let server = server.unwrap();
        assert_eq!(client.remote_addr(), Some(addr));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.on_receive(move |packet: &RawPacket| {
            tx.send(packet.body.clone()).ok();
            Ok(())
        });
        assert!(client.send_with_feedback(b"ping".to_vec()).await);
        assert_eq!(&rx.recv().await.unwrap()[..], b"ping");
        network.close_all();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = NetworkConfig::default();
        config.framing.length_header_bytes = 3;
        assert!(Network::new(config).is_err());
    }

    #[tokio::test]
    async fn test_wire_layout_over_duplex() {
        let network = Network::new(NetworkConfig::default()).unwrap();
        let (a, mut peer) = duplex(1024);
        let conn = network.connection(a);

        assert!(conn.send_with_feedback("hi").await);
        let mut wire = [0u8; 4];
        peer.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [0x00, 0x04, b'h', b'i']);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on_receive(move |packet: &RawPacket| {
            tx.send(packet.body.clone()).ok();
            Ok(())
        });
        peer.write_all(&[0x00, 0x03, b'!']).await.unwrap();
        assert_eq!(&rx.recv().await.unwrap()[..], b"!");

        // Closing the peer reaches the connection as end of stream
        drop(peer);
        let mut closed = false;
        for _ in 0..200 {
            if conn.is_closed() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(closed);
        assert_eq!(conn.close_reason(), Some(crate::error::CloseReason::Eof));
    }

    #[tokio::test]
    async fn test_incoming_yields_accepted_connections() {
        let network = Network::new(NetworkConfig::default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut incoming = std::pin::pin!(network.incoming(listener, RawDecoder));

        let (accepted, client) = tokio::join!(incoming.next(), network.connect(addr, RawDecoder));
        let server = accepted.unwrap().unwrap();
        let client = client.unwrap();
        assert_eq!(network.active_connections(), 2);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.on_receive(move |packet: &RawPacket| {
            tx.send(packet.body.clone()).ok();
            Ok(())
        });
        assert!(client.send_with_feedback(b"hello".to_vec()).await);
        assert_eq!(&rx.recv().await.unwrap()[..], b"hello");
        network.close_all();
    }
}

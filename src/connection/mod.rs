//! # Connection
//!
//! A packet connection over one byte-stream channel.
//!
//! Each connection runs two independent lanes:
//! - the **read lane** frames inbound bytes and dispatches decoded packets to
//!   subscribers; it starts with the first subscription
//! - the **write lane** drains the pending queue one packet at a time; it runs
//!   whenever the queue has work and stops when it is empty
//!
//! At most one task per lane exists at any time, claimed through an atomic
//! flag. Both lanes observe a cancellation token fired by [`Connection::close`].
//!
//! ## Usage
//! ```rust,no_run
//! use packet_channel::config::NetworkConfig;
//! use packet_channel::network::Network;
//!
//! # async fn run() -> packet_channel::error::Result<()> {
//! let network = Network::new(NetworkConfig::default())?;
//! let conn = network.connect("127.0.0.1:7000", packet_channel::core::codec::StringDecoder).await?;
//!
//! conn.on_receive(|text: &String| {
//!     println!("peer says {text}");
//!     Ok(())
//! });
//! let delivered = conn.send_with_feedback("hello").await;
//! assert!(delivered);
//! conn.close();
//! # Ok(())
//! # }
//! ```

mod feedback;
mod queue;
pub mod reader;
mod writer;

pub use feedback::Feedback;
pub use reader::{PacketReader, ReadCycle};

use crate::buffer::BufferAllocator;
use crate::config::ConnectionConfig;
use crate::core::codec::Decoder;
use crate::core::framing::Framing;
use crate::core::packet::Writable;
use crate::error::{CloseReason, Result};
use crate::protocol::dispatcher::{Dispatcher, SubscriptionId};
use crate::transport::channel::Channel;
use crate::transport::tls::TlsSession;
use crate::utils::metrics::Metrics;
use queue::{Outgoing, PendingQueue};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;
type CloseHook = Box<dyn FnOnce(CloseReason) + Send + 'static>;

/// Everything a connection shares with the network that created it.
pub(crate) struct ConnectionParts<D: Decoder> {
    pub id: u64,
    pub framing: Framing,
    pub decoder: Arc<D>,
    pub settings: ConnectionConfig,
    pub allocator: Arc<dyn BufferAllocator>,
    pub metrics: Arc<Metrics>,
    pub runtime: Handle,
    pub tls: Option<TlsSession>,
}

pub(crate) struct Inner<D: Decoder> {
    id: u64,
    remote: Option<SocketAddr>,
    framing: Framing,
    decoder: Arc<D>,
    settings: ConnectionConfig,
    allocator: Arc<dyn BufferAllocator>,
    metrics: Arc<Metrics>,
    runtime: Handle,
    tls: Option<TlsSession>,

    queue: PendingQueue,
    writing: AtomicBool,
    reading: AtomicBool,
    closed: AtomicBool,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,

    read_half: Mutex<Option<ReadHalf>>,
    write_half: tokio::sync::Mutex<Option<WriteHalf>>,

    dispatcher: Dispatcher<D::Packet>,
    close_hooks: Mutex<Vec<CloseHook>>,

    created: Instant,
    /// Nanoseconds after `created`
    last_activity: AtomicU64,
}

impl<D: Decoder> Inner<D> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn handshaking(&self) -> bool {
        self.tls.as_ref().is_some_and(TlsSession::is_handshaking)
    }

    fn touch(&self) {
        let nanos = u64::try_from(self.created.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_activity.store(nanos, Ordering::Relaxed);
    }

    fn last_activity(&self) -> Instant {
        self.created + Duration::from_nanos(self.last_activity.load(Ordering::Relaxed))
    }

    /// Queue a flush of TLS engine output ahead of application packets.
    fn schedule_handshake_flush(&self) {
        self.queue.push_handshake();
    }

    fn enqueue(self: &Arc<Self>, item: Outgoing) {
        {
            let mut queue = self.queue.lock();
            if self.is_closed() {
                drop(queue);
                item.resolve(false);
                return;
            }
            queue.push_back(item);
        }

        if self.handshaking() {
            // The handshake has to progress even without a subscriber
            self.kick_reader();
        }
        self.kick_writer();
    }

    /// Tear the connection down. Only the first call has any effect.
    fn shutdown(&self, reason: CloseReason) {
        // Recorded before the flag flips so observers of `closed` see a reason
        let _ = self.close_reason.set(reason);
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let reason = self.close_reason.get().copied().unwrap_or(reason);
        self.cancel.cancel();

        drop(
            self.read_half
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        // An in-flight write holds the lock; it drops the half once cancelled
        if let Ok(mut half) = self.write_half.try_lock() {
            half.take();
        }

        let dropped = self.queue.drain();
        let pending = dropped.len();
        for item in dropped {
            item.resolve(false);
        }

        // Handlers may hold clones of this connection
        self.dispatcher.clear();
        self.metrics.connection_closed();

        if reason.is_local() {
            debug!(connection = self.id, peer = ?self.remote, pending, "Connection closed");
        } else {
            info!(connection = self.id, peer = ?self.remote, %reason, pending, "Connection closed");
        }

        let hooks = std::mem::take(
            &mut *self
                .close_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for hook in hooks {
            hook(reason);
        }
    }
}

/// Cloneable handle to one packet connection.
///
/// `D` decides what inbound packets look like; see [`crate::core::codec`].
pub struct Connection<D: Decoder> {
    inner: Arc<Inner<D>>,
}

impl<D: Decoder> Clone for Connection<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Decoder> fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("secure", &self.inner.tls.is_some())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl<D: Decoder> Connection<D> {
    pub(crate) fn new<C: Channel>(channel: C, parts: ConnectionParts<D>) -> Self {
        let remote = channel.peer_addr();
        let (read_half, write_half) = tokio::io::split(channel);
        let client_tls = parts.tls.as_ref().is_some_and(TlsSession::is_client);

        let inner = Arc::new(Inner {
            id: parts.id,
            remote,
            framing: parts.framing,
            decoder: parts.decoder,
            settings: parts.settings,
            allocator: parts.allocator,
            metrics: parts.metrics,
            runtime: parts.runtime,
            tls: parts.tls,
            queue: PendingQueue::default(),
            writing: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            read_half: Mutex::new(Some(Box::new(read_half))),
            write_half: tokio::sync::Mutex::new(Some(Box::new(write_half))),
            dispatcher: Dispatcher::new(),
            close_hooks: Mutex::new(Vec::new()),
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
        });

        inner.metrics.connection_established();
        if inner.tls.is_some() {
            inner.metrics.handshake_attempt();
        }
        debug!(connection = inner.id, peer = ?remote, secure = inner.tls.is_some(), "Connection created");

        if client_tls {
            // ClientHello goes out before anything the application queues
            inner.schedule_handshake_flush();
            inner.kick_writer();
        }

        Self { inner }
    }

    /// Network-unique connection id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Queue `packet` for sending. Packets sent after close are dropped.
    pub fn send<P: Writable>(&self, packet: P) {
        self.inner
            .enqueue(Outgoing::packet(Box::new(packet), None));
    }

    /// Queue `packet` and learn whether it reached the channel.
    pub fn send_with_feedback<P: Writable>(&self, packet: P) -> Feedback {
        if self.is_closed() {
            return Feedback::resolved(false);
        }
        let (tx, feedback) = Feedback::channel();
        self.inner
            .enqueue(Outgoing::packet(Box::new(packet), Some(tx)));
        feedback
    }

    /// Register an inbound packet handler.
    ///
    /// Handlers run on the read lane in framing order, never concurrently
    /// for one connection. An error or panic in a handler is logged and
    /// framing continues. The first registration starts the read lane.
    pub fn on_receive<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&D::Packet) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.dispatcher.register(handler);
        self.inner.kick_reader();
        id
    }

    /// Unregister a handler. Returns `false` if it was not registered.
    pub fn remove_receiver(&self, id: SubscriptionId) -> bool {
        self.inner.dispatcher.remove(id)
    }

    /// Run `hook` once when the connection closes. Runs immediately if it
    /// already has.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(CloseReason) + Send + 'static,
    {
        {
            let mut hooks = self
                .inner
                .close_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.inner.is_closed() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook(self.close_reason().unwrap_or(CloseReason::Local));
    }

    /// Close the connection. Idempotent and callable from any thread.
    ///
    /// Queued and in-flight packets are dropped with `false` feedback.
    pub fn close(&self) {
        self.inner.shutdown(CloseReason::Local);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Why the connection closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().copied()
    }

    /// Time of the last completed read or write, or of creation
    pub fn last_activity(&self) -> Instant {
        self.inner.last_activity()
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity().elapsed()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    /// Items waiting in the write queue
    pub fn pending_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_secure(&self) -> bool {
        self.inner.tls.is_some()
    }

    /// Whether a TLS handshake is still in progress
    pub fn is_handshaking(&self) -> bool {
        self.inner.handshaking()
    }

    pub(crate) fn lifecycle(&self) -> Arc<dyn Lifecycle> {
        self.inner.clone()
    }
}

/// Decoder-independent view of a connection, used by the owning network.
pub(crate) trait Lifecycle: Send + Sync {
    fn id(&self) -> u64;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn idle_for(&self) -> Duration;
    fn is_closed(&self) -> bool;
    fn close(&self);
}

impl<D: Decoder> Lifecycle for Inner<D> {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    fn is_closed(&self) -> bool {
        Inner::is_closed(self)
    }

    fn close(&self) {
        self.shutdown(CloseReason::Local);
    }
}

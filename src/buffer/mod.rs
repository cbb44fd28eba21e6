//! # Buffer Allocation
//!
//! Supplies the byte buffers used by the read and write lanes and, depending on
//! the policy, recycles them.
//!
//! Every connection works with three buffer roles:
//! - **Read**: receives bytes from the channel
//! - **Pending**: carries incomplete packets over to the next read completion
//! - **Write**: holds one serialized packet until it is flushed
//!
//! Ad hoc sizes (for example TLS plaintext staging) go through
//! [`BufferAllocator::take`] / [`BufferAllocator::put`].
//!
//! ## Policies
//! - [`DefaultAllocator`]: allocate on every take, drop on every put
//! - [`ReusingAllocator`]: role pools plus a general first-fit pool
//!
//! ## Usage
//! ```rust
//! use packet_channel::buffer::{BufferAllocator, BufferLease, BufferRole, ReusingAllocator};
//! use packet_channel::config::BufferConfig;
//! use std::sync::Arc;
//!
//! let allocator = Arc::new(ReusingAllocator::new(&BufferConfig::default()));
//! {
//!     let mut lease = BufferLease::role(allocator.clone(), BufferRole::Write);
//!     lease.extend_from_slice(b"hello");
//! } // returned to the write pool here
//! assert_eq!(allocator.stats().returned, 1);
//! ```

mod pool;

pub use pool::ReusingAllocator;

use crate::config::BufferConfig;
use bytes::BytesMut;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which lane buffer is being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Read,
    Pending,
    Write,
}

impl BufferRole {
    pub(crate) fn index(self) -> usize {
        match self {
            BufferRole::Read => 0,
            BufferRole::Pending => 1,
            BufferRole::Write => 2,
        }
    }
}

/// Allocator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Buffers handed out
    pub taken: u64,
    /// Buffers handed back
    pub returned: u64,
    /// Takes served from a pool
    pub reused: u64,
    /// Returned buffers dropped instead of pooled
    pub discarded: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    taken: AtomicU64,
    returned: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn taken(&self, reused: bool) {
        self.taken.fetch_add(1, Ordering::Relaxed);
        if reused {
            self.reused.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn returned(&self, kept: bool) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        if !kept {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            taken: self.taken.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Source of lane buffers.
///
/// `take_*` returns an empty buffer with at least the role's capacity.
/// `put_*` hands ownership back; the allocator may keep or drop it.
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    fn take_role(&self, role: BufferRole) -> BytesMut;

    fn put_role(&self, role: BufferRole, buf: BytesMut);

    /// Take a buffer of at least `capacity` bytes.
    fn take(&self, capacity: usize) -> BytesMut;

    fn put(&self, buf: BytesMut);

    fn stats(&self) -> AllocatorStats;

    fn take_read_buffer(&self) -> BytesMut {
        self.take_role(BufferRole::Read)
    }

    fn put_read_buffer(&self, buf: BytesMut) {
        self.put_role(BufferRole::Read, buf)
    }

    fn take_pending_buffer(&self) -> BytesMut {
        self.take_role(BufferRole::Pending)
    }

    fn put_pending_buffer(&self, buf: BytesMut) {
        self.put_role(BufferRole::Pending, buf)
    }

    fn take_write_buffer(&self) -> BytesMut {
        self.take_role(BufferRole::Write)
    }

    fn put_write_buffer(&self, buf: BytesMut) {
        self.put_role(BufferRole::Write, buf)
    }
}

/// Build the allocator selected by `config.reuse_buffers`.
pub fn allocator_for(config: &BufferConfig) -> Arc<dyn BufferAllocator> {
    if config.reuse_buffers {
        Arc::new(ReusingAllocator::new(config))
    } else {
        Arc::new(DefaultAllocator::new(config))
    }
}

/// Allocates a fresh buffer on every take and drops every returned buffer.
#[derive(Debug)]
pub struct DefaultAllocator {
    sizes: [usize; 3],
    stats: StatsCounters,
}

impl DefaultAllocator {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            sizes: role_sizes(config),
            stats: StatsCounters::default(),
        }
    }
}

impl Default for DefaultAllocator {
    fn default() -> Self {
        Self::new(&BufferConfig::default())
    }
}

impl BufferAllocator for DefaultAllocator {
    fn take_role(&self, role: BufferRole) -> BytesMut {
        self.take(self.sizes[role.index()])
    }

    fn put_role(&self, _role: BufferRole, buf: BytesMut) {
        self.put(buf)
    }

    fn take(&self, capacity: usize) -> BytesMut {
        self.stats.taken(false);
        BytesMut::with_capacity(capacity)
    }

    fn put(&self, buf: BytesMut) {
        self.stats.returned(false);
        drop(buf);
    }

    fn stats(&self) -> AllocatorStats {
        self.stats.snapshot()
    }
}

pub(crate) fn role_sizes(config: &BufferConfig) -> [usize; 3] {
    [
        config.read_buffer_size,
        config.pending_buffer_size,
        config.write_buffer_size,
    ]
}

/// A buffer on loan from an allocator, returned when dropped.
///
/// Lanes hold their buffers through leases so that every exit path, including
/// task cancellation, gives the buffer back exactly once.
pub struct BufferLease {
    buffer: Option<BytesMut>,
    role: Option<BufferRole>,
    allocator: Arc<dyn BufferAllocator>,
}

impl BufferLease {
    /// Lease a role buffer.
    pub fn role(allocator: Arc<dyn BufferAllocator>, role: BufferRole) -> Self {
        let buffer = allocator.take_role(role);
        Self {
            buffer: Some(buffer),
            role: Some(role),
            allocator,
        }
    }

    /// Lease a general buffer of at least `capacity` bytes.
    pub fn sized(allocator: Arc<dyn BufferAllocator>, capacity: usize) -> Self {
        let buffer = allocator.take(capacity);
        Self {
            buffer: Some(buffer),
            role: None,
            allocator,
        }
    }

    pub fn buffer_role(&self) -> Option<BufferRole> {
        self.role
    }
}

impl Deref for BufferLease {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        // Only `drop` takes the buffer out
        match self.buffer.as_ref() {
            Some(buf) => buf,
            None => unreachable!("buffer lease used after release"),
        }
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut BytesMut {
        match self.buffer.as_mut() {
            Some(buf) => buf,
            None => unreachable!("buffer lease used after release"),
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            match self.role {
                Some(role) => self.allocator.put_role(role, buf),
                None => self.allocator.put(buf),
            }
        }
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("role", &self.role)
            .field("len", &self.buffer.as_ref().map(BytesMut::len))
            .field("capacity", &self.buffer.as_ref().map(BytesMut::capacity))
            .finish()
    }
}

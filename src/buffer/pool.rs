//! # Reusing Allocator
//!
//! Pools returned buffers instead of dropping them, to cut allocator traffic
//! on busy connections.
//!
//! Each role has its own pool and ad hoc sizes share a general pool. Lookups
//! scan under a read lock first and only take the write lock once a candidate
//! was seen, re-checking it before removal since another thread may have
//! claimed it in between.

use super::{role_sizes, AllocatorStats, BufferAllocator, BufferRole, StatsCounters};
use crate::config::BufferConfig;
use bytes::BytesMut;
use std::sync::{PoisonError, RwLock};
use tracing::trace;

#[derive(Debug, Default)]
struct Pool {
    buffers: RwLock<Vec<BytesMut>>,
}

impl Pool {
    /// First-fit removal of a buffer with at least `capacity` bytes.
    fn take_fit(&self, capacity: usize) -> Option<BytesMut> {
        let candidate = {
            let buffers = self.buffers.read().unwrap_or_else(PoisonError::into_inner);
            buffers.iter().position(|b| b.capacity() >= capacity)?
        };

        let mut buffers = self.buffers.write().unwrap_or_else(PoisonError::into_inner);
        let index = match buffers.get(candidate) {
            Some(b) if b.capacity() >= capacity => candidate,
            _ => buffers.iter().position(|b| b.capacity() >= capacity)?,
        };
        Some(buffers.swap_remove(index))
    }

    fn put(&self, buf: BytesMut, limit: usize) -> bool {
        let mut buffers = self.buffers.write().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() >= limit {
            return false;
        }
        buffers.push(buf);
        true
    }

    fn len(&self) -> usize {
        self.buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Allocator that recycles returned buffers.
#[derive(Debug)]
pub struct ReusingAllocator {
    sizes: [usize; 3],
    roles: [Pool; 3],
    general: Pool,
    max_pooled_buffers: usize,
    max_pooled_capacity: usize,
    stats: StatsCounters,
}

impl ReusingAllocator {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            sizes: role_sizes(config),
            roles: Default::default(),
            general: Pool::default(),
            max_pooled_buffers: config.max_pooled_buffers,
            max_pooled_capacity: config.max_pooled_capacity,
            stats: StatsCounters::default(),
        }
    }

    /// Buffers currently pooled for `role`
    pub fn available(&self, role: BufferRole) -> usize {
        self.roles[role.index()].len()
    }

    /// Buffers currently in the general pool
    pub fn available_general(&self) -> usize {
        self.general.len()
    }

    fn keep(&self, pool: &Pool, mut buf: BytesMut, min_capacity: usize) -> bool {
        if buf.capacity() > self.max_pooled_capacity {
            return false;
        }
        buf.clear();
        // `BytesMut::clear` keeps the consumed prefix; reserving reclaims it
        buf.reserve(min_capacity);
        pool.put(buf, self.max_pooled_buffers)
    }
}

impl Default for ReusingAllocator {
    fn default() -> Self {
        Self::new(&BufferConfig {
            reuse_buffers: true,
            ..BufferConfig::default()
        })
    }
}

impl BufferAllocator for ReusingAllocator {
    fn take_role(&self, role: BufferRole) -> BytesMut {
        let size = self.sizes[role.index()];
        match self.roles[role.index()].take_fit(size) {
            Some(buf) => {
                self.stats.taken(true);
                buf
            }
            None => {
                self.stats.taken(false);
                BytesMut::with_capacity(size)
            }
        }
    }

    fn put_role(&self, role: BufferRole, buf: BytesMut) {
        let kept = self.keep(&self.roles[role.index()], buf, self.sizes[role.index()]);
        if !kept {
            trace!(?role, "Discarding returned buffer");
        }
        self.stats.returned(kept);
    }

    fn take(&self, capacity: usize) -> BytesMut {
        match self.general.take_fit(capacity) {
            Some(buf) => {
                self.stats.taken(true);
                buf
            }
            None => {
                self.stats.taken(false);
                BytesMut::with_capacity(capacity)
            }
        }
    }

    fn put(&self, buf: BytesMut) {
        let capacity = buf.capacity();
        let kept = self.keep(&self.general, buf, capacity);
        self.stats.returned(kept);
    }

    fn stats(&self) -> AllocatorStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use std::sync::Arc;
    use std::thread;

    fn small_config() -> BufferConfig {
        BufferConfig {
            read_buffer_size: 64,
            pending_buffer_size: 64,
            write_buffer_size: 128,
            reuse_buffers: true,
            max_pooled_buffers: 2,
            max_pooled_capacity: 4096,
        }
    }

    #[test]
    fn test_role_buffer_reuse() {
        let allocator = ReusingAllocator::new(&small_config());

        let mut buf = allocator.take_write_buffer();
        buf.extend_from_slice(b"stale");
        allocator.put_write_buffer(buf);
        assert_eq!(allocator.available(BufferRole::Write), 1);

        let again = allocator.take_write_buffer();
        assert!(again.is_empty());
        assert!(again.capacity() >= 128);
        assert_eq!(allocator.available(BufferRole::Write), 0);

        let stats = allocator.stats();
        assert_eq!(stats.taken, 2);
        assert_eq!(stats.reused, 1);
    }

    #[test]
    fn test_roles_are_separate() {
        let allocator = ReusingAllocator::new(&small_config());
        let read = allocator.take_read_buffer();
        allocator.put_read_buffer(read);

        let _write = allocator.take_write_buffer();
        assert_eq!(allocator.stats().reused, 0);
        assert_eq!(allocator.available(BufferRole::Read), 1);
    }

    #[test]
    fn test_pool_bound() {
        let allocator = ReusingAllocator::new(&small_config());
        let buffers: Vec<_> = (0..3).map(|_| allocator.take_read_buffer()).collect();
        for buf in buffers {
            allocator.put_read_buffer(buf);
        }
        assert_eq!(allocator.available(BufferRole::Read), 2);
        assert_eq!(allocator.stats().discarded, 1);
    }

    #[test]
    fn test_oversized_buffers_discarded() {
        let allocator = ReusingAllocator::new(&small_config());
        let mut buf = allocator.take_read_buffer();
        buf.extend_from_slice(&[0u8; 8192]);
        allocator.put_read_buffer(buf);
        assert_eq!(allocator.available(BufferRole::Read), 0);
        assert_eq!(allocator.stats().discarded, 1);
    }

    #[test]
    fn test_consumed_prefix_reclaimed() {
        let allocator = ReusingAllocator::new(&small_config());
        let mut buf = allocator.take_read_buffer();
        buf.extend_from_slice(&[7u8; 64]);
        buf.advance(60);
        allocator.put_read_buffer(buf);

        let again = allocator.take_read_buffer();
        assert!(again.capacity() >= 64);
        assert_eq!(allocator.stats().reused, 1);
    }

    #[test]
    fn test_general_first_fit() {
        let allocator = ReusingAllocator::new(&small_config());
        allocator.put(BytesMut::with_capacity(32));
        allocator.put(BytesMut::with_capacity(512));

        let buf = allocator.take(100);
        assert!(buf.capacity() >= 100);
        assert_eq!(allocator.available_general(), 1);

        // Nothing pooled is large enough
        let big = allocator.take(2048);
        assert!(big.capacity() >= 2048);
        assert_eq!(allocator.stats().reused, 1);
    }

    #[test]
    fn test_concurrent_take_put() {
        let allocator = Arc::new(ReusingAllocator::new(&BufferConfig {
            max_pooled_buffers: 64,
            ..small_config()
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let buf = allocator.take_pending_buffer();
                        allocator.put_pending_buffer(buf);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        let stats = allocator.stats();
        assert_eq!(stats.taken, 1600);
        assert_eq!(stats.returned, 1600);
        assert!(allocator.available(BufferRole::Pending) <= 8);
    }
}

//! Buffer allocation as seen from live connections

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bytes::BytesMut;
use common::{eventually, frame, scripted};
use packet_channel::buffer::{
    AllocatorStats, BufferAllocator, BufferRole, DefaultAllocator, ReusingAllocator,
};
use packet_channel::config::{BufferConfig, NetworkConfig};
use packet_channel::core::packet::RawPacket;
use packet_channel::network::Network;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Tracks buffers on loan while delegating to the default policy
#[derive(Debug, Default)]
struct Outstanding {
    inner: DefaultAllocator,
    loaned: AtomicI64,
}

impl BufferAllocator for Outstanding {
    fn take_role(&self, role: BufferRole) -> BytesMut {
        self.loaned.fetch_add(1, Ordering::SeqCst);
        self.inner.take_role(role)
    }

    fn put_role(&self, role: BufferRole, buf: BytesMut) {
        self.loaned.fetch_sub(1, Ordering::SeqCst);
        self.inner.put_role(role, buf)
    }

    fn take(&self, capacity: usize) -> BytesMut {
        self.loaned.fetch_add(1, Ordering::SeqCst);
        self.inner.take(capacity)
    }

    fn put(&self, buf: BytesMut) {
        self.loaned.fetch_sub(1, Ordering::SeqCst);
        self.inner.put(buf)
    }

    fn stats(&self) -> AllocatorStats {
        self.inner.stats()
    }
}

#[tokio::test]
async fn test_reusing_allocator_recycles_write_buffers() {
    let config = NetworkConfig::default_with_overrides(|c| c.buffers.reuse_buffers = true);
    let network = Network::new(config).unwrap();
    let (channel, _script) = scripted();
    let conn = network.connection(channel);

    for i in 0..5u8 {
        assert!(conn.send_with_feedback(vec![i; 16]).await);
    }
    let stats = network.allocator().stats();
    assert!(stats.reused >= 4, "{stats:?}");
    assert_eq!(stats.discarded, 0);
    conn.close();
}

#[tokio::test]
async fn test_every_buffer_returned_after_close() {
    let allocator = Arc::new(Outstanding::default());
    let network = Network::with_allocator(NetworkConfig::default(), allocator.clone()).unwrap();
    let (channel, script) = scripted();
    let conn = network.connection(channel);

    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.on_receive(move |packet: &RawPacket| {
        tx.send(packet.body.len()).ok();
        Ok(())
    });
    script.feed(frame(&[7; 100]));
    assert_eq!(rx.recv().await.unwrap(), 100);
    assert!(conn.send_with_feedback(b"reply".to_vec()).await);

    // Read lane still holds its read and pending buffers
    assert!(allocator.loaned.load(Ordering::SeqCst) > 0);

    conn.close();
    assert!(eventually(|| allocator.loaned.load(Ordering::SeqCst) == 0).await);
}

#[test]
fn test_oversized_buffers_are_not_pooled() {
    let config = BufferConfig {
        reuse_buffers: true,
        max_pooled_capacity: 16 * 1024,
        ..BufferConfig::default()
    };
    let allocator = ReusingAllocator::new(&config);

    let mut grown = allocator.take_write_buffer();
    grown.extend_from_slice(&vec![0u8; 64 * 1024]);
    allocator.put_write_buffer(grown);

    assert_eq!(allocator.available(BufferRole::Write), 0);
    assert_eq!(allocator.stats().discarded, 1);
}

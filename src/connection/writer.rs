//! Write lane.
//!
//! Drains the pending queue one item at a time: serialize into a write
//! buffer, hand every byte to the channel, resolve feedback, repeat. The lane
//! exits when the queue is empty and is restarted by the next send.

use super::queue::Outgoing;
use super::Inner;
use crate::buffer::{BufferLease, BufferRole};
use crate::core::codec::Decoder;
use crate::core::packet::Writable;
use crate::error::constants::ERR_ENCODER_PANIC;
use crate::error::{CloseReason, ProtocolError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, trace, warn, Level};

/// Headroom for record headers and AEAD tags when sealing one frame
const TLS_RECORD_OVERHEAD: usize = 64;

impl<D: Decoder> Inner<D> {
    /// Start the write lane unless it is already running.
    pub(super) fn kick_writer(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        if self.claim_writer() {
            let inner = self.clone();
            self.runtime.spawn(async move { inner.drain_queue().await });
        }
    }

    fn claim_writer(&self) -> bool {
        self.writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[instrument(skip(self), fields(connection = self.id, peer = ?self.remote))]
    async fn drain_queue(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                self.write_half.lock().await.take();
                self.writing.store(false, Ordering::Release);
                return;
            }

            let packets_allowed = !self.handshaking();
            let Some(item) = self.queue.pop_ready(packets_allowed) else {
                self.writing.store(false, Ordering::Release);
                // A send or handshake step may have landed after the pop;
                // whoever claims the flag first drains it
                if self.is_closed() || !self.queue.has_ready(!self.handshaking()) {
                    return;
                }
                if !self.claim_writer() {
                    return;
                }
                continue;
            };

            match item {
                Outgoing::Handshake => self.flush_handshake().await,
                Outgoing::Packet { packet, feedback } => {
                    let serialized = self.serialize(packet.as_ref());
                    drop(packet);
                    let delivered = match serialized {
                        Some((bytes, framed)) => self.write_serialized(bytes, framed).await,
                        None => false,
                    };
                    if let Some(tx) = feedback {
                        let _ = tx.send(delivered);
                    }
                }
            }
        }
    }

    async fn flush_handshake(&self) {
        let Some(tls) = &self.tls else {
            return;
        };
        let mut out = BufferLease::role(self.allocator.clone(), BufferRole::Write);
        if let Err(e) = tls.flush_into(&mut out) {
            warn!(connection = self.id, error = %e, "TLS engine output failed");
            self.shutdown(CloseReason::Handshake);
            return;
        }
        if out.is_empty() {
            return;
        }
        trace!(bytes = out.len(), "Flushing TLS records");
        if let Err(e) = self.write_bytes(&out).await {
            self.write_failed(e);
        }
    }

    /// Frame `packet` and, on a secure connection, seal it into records.
    ///
    /// Returns the bytes to write and the framed packet length, or `None` if
    /// the packet was dropped. A panicking [`Writable`] only loses its own
    /// packet.
    fn serialize(&self, packet: &dyn Writable) -> Option<(BufferLease, usize)> {
        let mut frame = BufferLease::role(self.allocator.clone(), BufferRole::Write);
        let encoded = panic::catch_unwind(AssertUnwindSafe(|| {
            self.framing.encode(packet, &mut frame)
        }))
        .unwrap_or_else(|_| {
            error!(connection = self.id, "Packet writer panicked");
            Err(ProtocolError::EncodeError(ERR_ENCODER_PANIC.to_string()))
        });
        let framed = match encoded {
            Ok(len) => len,
            Err(e) => {
                // Only this packet is lost; the lane carries on
                self.metrics.write_failure();
                log_write_failure(
                    self.settings.write_failure_log_level,
                    self.id,
                    &e,
                    "Packet serialization failed",
                );
                return None;
            }
        };

        let Some(tls) = &self.tls else {
            return Some((frame, framed));
        };
        let mut records =
            BufferLease::sized(self.allocator.clone(), frame.len() + TLS_RECORD_OVERHEAD);
        match tls.seal(&frame, &mut records) {
            Ok(_) => Some((records, framed)),
            Err(e) => {
                warn!(connection = self.id, error = %e, "TLS seal failed");
                self.shutdown(CloseReason::Protocol);
                None
            }
        }
    }

    async fn write_serialized(&self, bytes: BufferLease, framed: usize) -> bool {
        match self.write_bytes(&bytes).await {
            Ok(()) => {
                self.metrics.packet_sent(framed as u64);
                self.touch();
                true
            }
            Err(e) => {
                self.write_failed(e);
                false
            }
        }
    }

    /// Hand `bytes` to the channel, re-issuing partial writes until flushed.
    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        let Some(half) = guard.as_mut() else {
            return Err(ProtocolError::ConnectionClosed);
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProtocolError::ConnectionClosed),
            written = async {
                half.write_all(bytes).await?;
                half.flush().await
            } => written.map_err(ProtocolError::from),
        };

        if self.cancel.is_cancelled() {
            guard.take();
        }
        result
    }

    fn write_failed(&self, error: ProtocolError) {
        if matches!(error, ProtocolError::ConnectionClosed) || self.is_closed() {
            // Dropped by close; nothing went wrong on the wire
            return;
        }
        self.metrics.write_failure();
        log_write_failure(
            self.settings.write_failure_log_level,
            self.id,
            &error,
            "Channel write failed",
        );
        self.shutdown(CloseReason::Io);
    }
}

fn log_write_failure(level: Level, connection: u64, error: &ProtocolError, message: &str) {
    if level == Level::ERROR {
        error!(connection, error = %error, "{message}");
    } else if level == Level::WARN {
        warn!(connection, error = %error, "{message}");
    } else if level == Level::INFO {
        info!(connection, error = %error, "{message}");
    } else if level == Level::DEBUG {
        debug!(connection, error = %error, "{message}");
    } else {
        trace!(connection, error = %error, "{message}");
    }
}

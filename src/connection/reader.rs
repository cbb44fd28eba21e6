//! Read lane.
//!
//! [`PacketReader`] holds the carry-over state between read completions and
//! cuts complete frames out of it. The lane task feeds it from the channel,
//! decrypting first when the connection is secured.

use super::Inner;
use crate::buffer::{BufferAllocator, BufferLease, BufferRole};
use crate::config::FramingErrorPolicy;
use crate::core::codec::Decoder;
use crate::core::framing::{Frame, Framing};
use crate::error::constants::ERR_DECODER_PANIC;
use crate::error::{CloseReason, ProtocolError, Result};
use crate::transport::tls::{HandshakeStatus, Inbound, TlsSession};
use bytes::BytesMut;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, instrument, trace, warn};

/// Outcome of one framing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadCycle {
    /// Frames handed to the sink
    pub framed: usize,
    /// The cycle stopped at `max_packets_per_read` with another complete
    /// frame still buffered
    pub limited: bool,
}

/// Carry-over framing state for one inbound stream.
#[derive(Debug)]
pub struct PacketReader {
    framing: Framing,
    max_packets_per_read: usize,
    /// Unconsumed bytes, followed by whatever the last read appended
    pending: BufferLease,
}

impl PacketReader {
    pub fn new(
        framing: Framing,
        max_packets_per_read: usize,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        Self {
            framing,
            max_packets_per_read: max_packets_per_read.max(1),
            pending: BufferLease::role(allocator, BufferRole::Pending),
        }
    }

    /// Append one read completion and frame what is now complete.
    pub fn on_read<F>(&mut self, data: &[u8], sink: F) -> Result<ReadCycle>
    where
        F: FnMut(Frame) -> Result<()>,
    {
        self.pending.extend_from_slice(data);
        self.frame_buffered(sink)
    }

    /// Frame buffered bytes without reading more.
    ///
    /// Stops after `max_packets_per_read` frames. A framing error leaves the
    /// buffer at the offending packet; a sink error stops the cycle after the
    /// frame it rejected.
    pub fn frame_buffered<F>(&mut self, mut sink: F) -> Result<ReadCycle>
    where
        F: FnMut(Frame) -> Result<()>,
    {
        let mut framed = 0;
        while framed < self.max_packets_per_read {
            let Some(frame) = self.framing.next_frame(&mut self.pending)? else {
                break;
            };
            framed += 1;
            sink(frame)?;
        }

        let limited =
            framed == self.max_packets_per_read && self.framing.has_complete_frame(&self.pending);
        Ok(ReadCycle { framed, limited })
    }

    /// Buffer decrypted bytes are appended to.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.pending
    }

    /// Bytes waiting for the rest of their packet
    pub fn carried_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_complete_frame(&self) -> bool {
        self.framing.has_complete_frame(&self.pending)
    }
}

enum Step {
    Continue(ReadCycle),
    Stop,
}

impl<D: Decoder> Inner<D> {
    /// Start the read lane unless it is already running.
    pub(super) fn kick_reader(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        if self
            .reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = self.clone();
            self.runtime.spawn(async move { inner.read_loop().await });
        }
    }

    #[instrument(skip(self), fields(connection = self.id, peer = ?self.remote))]
    async fn read_loop(self: Arc<Self>) {
        let half = self
            .read_half
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut half) = half else {
            return;
        };

        let mut reader = PacketReader::new(
            self.framing,
            self.settings.max_packets_per_read,
            self.allocator.clone(),
        );
        let mut read_buf = BufferLease::role(self.allocator.clone(), BufferRole::Read);
        let mut limited = false;

        while !self.is_closed() {
            if limited {
                // Let other connections run before the next batch
                tokio::task::yield_now().await;
                match reader.frame_buffered(|frame| self.deliver(frame)) {
                    Ok(cycle) => limited = cycle.limited,
                    Err(e) => {
                        self.framing_failed(e);
                        break;
                    }
                }
                continue;
            }

            read_buf.clear();
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                read = half.read_buf(&mut *read_buf) => read,
            };

            let n = match read {
                Ok(0) => {
                    debug!(carried = reader.carried_len(), "Peer closed the stream");
                    self.shutdown(CloseReason::Eof);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Channel read failed");
                    self.shutdown(CloseReason::Io);
                    break;
                }
            };
            trace!(bytes = n, "Read completed");
            self.touch();

            let step = match &self.tls {
                None => match reader.on_read(&read_buf[..n], |frame| self.deliver(frame)) {
                    Ok(cycle) => Step::Continue(cycle),
                    Err(e) => {
                        self.framing_failed(e);
                        Step::Stop
                    }
                },
                Some(tls) => self.on_tls_read(tls, &read_buf[..n], &mut reader),
            };

            match step {
                Step::Continue(cycle) => limited = cycle.limited,
                Step::Stop => break,
            }
        }
        // `half`, `reader` and `read_buf` drop here; buffers go back to the allocator
    }

    fn on_tls_read(self: &Arc<Self>, tls: &TlsSession, cipher: &[u8], reader: &mut PacketReader) -> Step {
        let inbound = match tls.process_inbound(cipher, reader.buffer_mut()) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.tls_failed(tls, e);
                return Step::Stop;
            }
        };
        self.service_handshake(inbound);

        let cycle = match reader.frame_buffered(|frame| self.deliver(frame)) {
            Ok(cycle) => cycle,
            Err(e) => {
                self.framing_failed(e);
                return Step::Stop;
            }
        };

        if inbound.peer_closed && !cycle.limited {
            debug!("Peer sent close_notify");
            self.shutdown(CloseReason::Eof);
            return Step::Stop;
        }
        Step::Continue(cycle)
    }

    fn service_handshake(self: &Arc<Self>, inbound: Inbound) {
        if inbound.status == HandshakeStatus::Complete {
            self.metrics.handshake_success();
            debug!(connection = self.id, "TLS handshake complete");
        }
        if inbound.wants_write {
            self.schedule_handshake_flush();
        }
        if inbound.wants_write || inbound.status == HandshakeStatus::Complete {
            // Flush engine output, then any packets parked behind the handshake
            self.kick_writer();
        }
    }

    /// Decode one frame and hand it to the subscribers.
    ///
    /// A decoder that panics is treated like one that returned an error.
    /// Errors that leave no usable packet boundary close the connection
    /// whatever the policy.
    fn deliver(&self, frame: Frame) -> Result<()> {
        let bytes = (frame.body.len() + self.framing.header_len()) as u64;
        let decoded = panic::catch_unwind(AssertUnwindSafe(|| self.decoder.decode(frame)))
            .unwrap_or_else(|_| {
                error!(connection = self.id, "Packet decoder panicked");
                Err(ProtocolError::DecodeError(ERR_DECODER_PANIC.to_string()))
            });

        match decoded {
            Ok(packet) => {
                self.metrics.packet_received(bytes);
                self.dispatcher.dispatch(&packet);
                Ok(())
            }
            Err(e) if e.corrupts_stream() => Err(e),
            Err(e) => match self.settings.framing_error_policy {
                FramingErrorPolicy::Drop => {
                    self.metrics.framing_error();
                    warn!(connection = self.id, error = %e, "Dropping undecodable packet");
                    Ok(())
                }
                FramingErrorPolicy::Close => Err(e),
            },
        }
    }

    fn framing_failed(&self, error: ProtocolError) {
        self.metrics.framing_error();
        if error.corrupts_stream() {
            warn!(connection = self.id, error = %error, "Inbound stream corrupted");
        } else {
            warn!(connection = self.id, error = %error, "Undecodable packet");
        }
        self.shutdown(CloseReason::Protocol);
    }

    fn tls_failed(&self, tls: &TlsSession, error: ProtocolError) {
        let reason = if error.is_handshake() || tls.is_handshaking() {
            self.metrics.handshake_failed();
            CloseReason::Handshake
        } else {
            CloseReason::Protocol
        };
        warn!(connection = self.id, error = %error, %reason, "TLS failure");
        self.shutdown(reason);
    }
}

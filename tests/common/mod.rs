//! Shared test helpers
//!
//! [`ScriptedChannel`] is a channel whose read completions are exactly the
//! chunks the test feeds it, and whose writes can be held or failed on demand.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use packet_channel::transport::Channel;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

#[derive(Default)]
struct Shared {
    written: Mutex<Vec<u8>>,
    hold: AtomicBool,
    fail: AtomicBool,
    blocked: Mutex<Option<Waker>>,
    write_calls: AtomicUsize,
}

/// Channel end handed to the connection under test.
pub struct ScriptedChannel {
    reads: mpsc::UnboundedReceiver<Vec<u8>>,
    leftover: Vec<u8>,
    shared: Arc<Shared>,
}

/// Test-side controls for a [`ScriptedChannel`].
pub struct Script {
    reads: Option<mpsc::UnboundedSender<Vec<u8>>>,
    shared: Arc<Shared>,
}

pub fn scripted() -> (ScriptedChannel, Script) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        ScriptedChannel {
            reads: rx,
            leftover: Vec::new(),
            shared: shared.clone(),
        },
        Script {
            reads: Some(tx),
            shared,
        },
    )
}

impl Script {
    /// Deliver `bytes` as one read completion.
    pub fn feed(&self, bytes: impl Into<Vec<u8>>) {
        if let Some(tx) = &self.reads {
            let _ = tx.send(bytes.into());
        }
    }

    /// Report end of stream once the fed chunks are consumed.
    pub fn eof(&mut self) {
        self.reads.take();
    }

    /// Everything the connection has written so far
    pub fn written(&self) -> Vec<u8> {
        self.shared.written.lock().unwrap().clone()
    }

    pub fn write_calls(&self) -> usize {
        self.shared.write_calls.load(Ordering::SeqCst)
    }

    /// Leave subsequent writes pending until [`Script::release_writes`].
    pub fn hold_writes(&self) {
        self.shared.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_writes(&self) {
        self.shared.hold.store(false, Ordering::SeqCst);
        if let Some(waker) = self.shared.blocked.lock().unwrap().take() {
            waker.wake();
        }
    }

    /// Fail subsequent writes with a broken pipe.
    pub fn fail_writes(&self) {
        self.shared.fail.store(true, Ordering::SeqCst);
        self.release_writes();
    }
}

impl AsyncRead for ScriptedChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.leftover.is_empty() {
            match self.reads.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.leftover = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ScriptedChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let shared = &self.shared;
        if shared.fail.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if shared.hold.load(Ordering::SeqCst) {
            *shared.blocked.lock().unwrap() = Some(cx.waker().clone());
            // Re-check after parking the waker so a release in between is seen
            if shared.hold.load(Ordering::SeqCst) {
                return Poll::Pending;
            }
        }
        shared.write_calls.fetch_add(1, Ordering::SeqCst);
        shared.written.lock().unwrap().extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Channel for ScriptedChannel {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Frame `body` behind a big-endian 2-byte length header.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut wire = ((body.len() + 2) as u16).to_be_bytes().to_vec();
    wire.extend_from_slice(body);
    wire
}

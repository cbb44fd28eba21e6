//! Per-packet delivery feedback.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Resolves once the packet it was issued for leaves the connection.
///
/// `true` means every byte was handed to the channel; `false` means the
/// packet was dropped by a close, a write failure or a serialization error.
/// Awaiting is optional; dropping a `Feedback` does not affect delivery.
#[derive(Debug)]
#[must_use = "dropping a Feedback discards the delivery outcome"]
pub struct Feedback {
    rx: oneshot::Receiver<bool>,
}

impl Feedback {
    pub(crate) fn channel() -> (oneshot::Sender<bool>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Already-resolved feedback.
    pub(crate) fn resolved(outcome: bool) -> Self {
        let (tx, feedback) = Self::channel();
        let _ = tx.send(outcome);
        feedback
    }

    /// The outcome if already known.
    pub fn try_result(&mut self) -> Option<bool> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(false),
        }
    }
}

impl Future for Feedback {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        // A sender dropped without resolving means the item was discarded
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(false))
    }
}

//! Pending write queue.
//!
//! FIFO of outbound items. The lock is held only for push and pop, never
//! across serialization or I/O.

use crate::core::packet::Writable;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// One queued outbound item.
pub(crate) enum Outgoing {
    /// An application packet and its optional feedback sender
    Packet {
        packet: Box<dyn Writable>,
        feedback: Option<oneshot::Sender<bool>>,
    },
    /// Flush pending TLS engine output
    Handshake,
}

impl Outgoing {
    pub(crate) fn packet(packet: Box<dyn Writable>, feedback: Option<oneshot::Sender<bool>>) -> Self {
        Outgoing::Packet { packet, feedback }
    }

    /// Resolve the feedback, if any. Control items carry none.
    pub(crate) fn resolve(self, outcome: bool) {
        if let Outgoing::Packet {
            feedback: Some(tx), ..
        } = self
        {
            // The caller may have dropped its Feedback
            let _ = tx.send(outcome);
        }
    }
}

impl fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outgoing::Packet { packet, feedback } => f
                .debug_struct("Packet")
                .field("id", &packet.packet_id())
                .field("feedback", &feedback.is_some())
                .finish(),
            Outgoing::Handshake => f.write_str("Handshake"),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    items: Mutex<VecDeque<Outgoing>>,
}

impl PendingQueue {
    pub(crate) fn lock(&self) -> MutexGuard<'_, VecDeque<Outgoing>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push_back(&self, item: Outgoing) {
        self.lock().push_back(item);
    }

    /// Front-insert a handshake control item unless one is already queued.
    pub(crate) fn push_handshake(&self) -> bool {
        let mut items = self.lock();
        if items.iter().any(|item| matches!(item, Outgoing::Handshake)) {
            return false;
        }
        items.push_front(Outgoing::Handshake);
        true
    }

    /// Pop the next item the write lane may send now.
    ///
    /// With `packets_allowed` false (TLS handshake in progress) only handshake
    /// control items leave the queue; application packets keep their place.
    pub(crate) fn pop_ready(&self, packets_allowed: bool) -> Option<Outgoing> {
        let mut items = self.lock();
        if packets_allowed {
            return items.pop_front();
        }
        let index = items
            .iter()
            .position(|item| matches!(item, Outgoing::Handshake))?;
        items.remove(index)
    }

    /// Whether `pop_ready` would return an item.
    pub(crate) fn has_ready(&self, packets_allowed: bool) -> bool {
        let items = self.lock();
        if packets_allowed {
            !items.is_empty()
        } else {
            items.iter().any(|item| matches!(item, Outgoing::Handshake))
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Take every queued item.
    pub(crate) fn drain(&self) -> Vec<Outgoing> {
        self.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_with_front_insert() {
        let queue = PendingQueue::default();
        queue.push_back(Outgoing::packet(Box::new("one"), None));
        queue.push_back(Outgoing::packet(Box::new("two"), None));
        assert!(queue.push_handshake());
        assert!(!queue.push_handshake());

        assert_eq!(queue.len(), 3);
        assert!(matches!(queue.pop_ready(true), Some(Outgoing::Handshake)));
        assert!(matches!(queue.pop_ready(true), Some(Outgoing::Packet { .. })));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_packets_held_during_handshake() {
        let queue = PendingQueue::default();
        queue.push_back(Outgoing::packet(Box::new("app"), None));
        assert!(!queue.has_ready(false));
        assert!(queue.pop_ready(false).is_none());

        queue.push_handshake();
        assert!(queue.has_ready(false));
        assert!(matches!(queue.pop_ready(false), Some(Outgoing::Handshake)));
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.pop_ready(true), Some(Outgoing::Packet { .. })));
    }

    #[test]
    fn test_drain_resolves_feedback() {
        let queue = PendingQueue::default();
        let (tx, mut rx) = oneshot::channel();
        queue.push_back(Outgoing::packet(Box::new("x"), Some(tx)));

        for item in queue.drain() {
            item.resolve(false);
        }
        assert_eq!(queue.len(), 0);
        assert_eq!(rx.try_recv(), Ok(false));
    }
}

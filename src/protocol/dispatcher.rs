use crate::error::Result;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, warn};

type HandlerFn<P> = dyn Fn(&P) -> Result<()> + Send + Sync + 'static;

/// Handle returned by a registration, used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber<P> {
    id: SubscriptionId,
    handler: Arc<HandlerFn<P>>,
}

impl<P> Clone for Subscriber<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: self.handler.clone(),
        }
    }
}

/// Inbound packet dispatcher.
///
/// Dispatch works on a snapshot of the subscriber list, so handlers may
/// register or remove subscribers, including themselves, while running.
/// Writers copy the list and swap it in.
pub struct Dispatcher<P> {
    subscribers: RwLock<Arc<Vec<Subscriber<P>>>>,
    next_id: AtomicU64,
}

impl<P> Default for Dispatcher<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for Dispatcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<P> Dispatcher<P> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&P) -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut next = Vec::with_capacity(subscribers.len() + 1);
        next.extend(subscribers.iter().cloned());
        next.push(Subscriber {
            id,
            handler: Arc::new(handler),
        });
        *subscribers = Arc::new(next);
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if !subscribers.iter().any(|s| s.id == id) {
            return false;
        }
        let next: Vec<_> = subscribers.iter().filter(|s| s.id != id).cloned().collect();
        *subscribers = Arc::new(next);
        true
    }

    /// Drop every handler, releasing whatever they captured.
    pub fn clear(&self) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *subscribers = Arc::new(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn snapshot(&self) -> Arc<Vec<Subscriber<P>>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hand `packet` to every handler in registration order.
    ///
    /// A failing or panicking handler is logged and the rest still run.
    /// Returns the number of handlers that completed successfully.
    pub fn dispatch(&self, packet: &P) -> usize {
        let subscribers = self.snapshot();
        let mut delivered = 0;

        for subscriber in subscribers.iter() {
            match catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(packet))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(subscription = %subscriber.id, error = %e, "Packet handler failed");
                }
                Err(_) => {
                    error!(subscription = %subscriber.id, "Packet handler panicked");
                }
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use std::sync::Mutex;

    #[test]
    fn test_dispatch_in_registration_order() {
        let dispatcher = Dispatcher::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            dispatcher.register(move |p: &u32| {
                seen.lock().unwrap().push(format!("{tag}{p}"));
                Ok(())
            });
        }

        assert_eq!(dispatcher.dispatch(&1), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1"]);
    }

    #[test]
    fn test_failing_handlers_do_not_stop_dispatch() {
        let dispatcher = Dispatcher::<u32>::new();
        let hits = Arc::new(AtomicU64::new(0));

        dispatcher.register(|_| Err(ProtocolError::Custom("nope".into())));
        dispatcher.register(|_| panic!("handler bug"));
        let counter = hits.clone();
        dispatcher.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(dispatcher.dispatch(&7), 1);
        assert_eq!(dispatcher.dispatch(&8), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_during_dispatch() {
        let dispatcher = Arc::new(Dispatcher::<u32>::new());
        let slot = Arc::new(Mutex::new(None::<SubscriptionId>));

        let inner = dispatcher.clone();
        let own = slot.clone();
        let id = dispatcher.register(move |_| {
            if let Some(id) = *own.lock().unwrap() {
                inner.remove(id);
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(id);

        assert_eq!(dispatcher.dispatch(&1), 1);
        assert!(dispatcher.is_empty());
        assert_eq!(dispatcher.dispatch(&2), 0);
        assert!(!dispatcher.remove(id));
    }

    #[test]
    fn test_clear() {
        let dispatcher = Dispatcher::<u32>::new();
        dispatcher.register(|_| Ok(()));
        dispatcher.register(|_| Ok(()));
        assert_eq!(dispatcher.len(), 2);
        dispatcher.clear();
        assert!(dispatcher.is_empty());
    }
}

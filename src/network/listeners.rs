//! Multi-subscriber listener lists keyed by opaque handles

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, warn};

/// Handle returned by `subscribe`, used to remove exactly that listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static>;

/// Ordered list of event handlers
///
/// Handlers run synchronously in registration order. A handler that returns
/// an error or panics is logged and skipped; the remaining handlers still run.
pub struct ListenerRegistry<E> {
    name: &'static str,
    next_id: AtomicU64,
    handlers: RwLock<Vec<(ListenerId, Handler<E>)>>,
}

impl<E> ListenerRegistry<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver `event` to every listener, returning how many succeeded
    pub fn emit(&self, event: &E) -> usize {
        // Snapshot so handlers may (un)subscribe while being called
        let handlers: Vec<(ListenerId, Handler<E>)> = self.handlers.read().clone();
        let mut delivered = 0;

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("{} listener {:?} failed: {:#}", self.name, id, e),
                Err(_) => error!("{} listener {:?} panicked", self.name, id),
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_in_registration_order() {
        let registry = ListenerRegistry::<u32>::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            registry.subscribe(move |value: &u32| {
                seen.lock().push(format!("{}{}", tag, value));
                Ok(())
            });
        }

        assert_eq!(registry.emit(&7), 3);
        assert_eq!(*seen.lock(), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn test_faulty_handlers_are_isolated() {
        let registry = ListenerRegistry::<u32>::new("test");
        let hits = Arc::new(AtomicU64::new(0));

        registry.subscribe(|_| anyhow::bail!("boom"));
        registry.subscribe(|_| panic!("handler panic"));
        let counter = hits.clone();
        registry.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(registry.emit(&1), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_listener() {
        let registry = ListenerRegistry::<u32>::new("test");
        let first = registry.subscribe(|_| Ok(()));
        let second = registry.subscribe(|_| Ok(()));
        assert_ne!(first, second);

        assert!(registry.unsubscribe(first));
        assert!(!registry.unsubscribe(first));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.emit(&0), 1);
    }
}

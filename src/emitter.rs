//! Keyed publish/subscribe registry used for lifecycle and broadcast events.
//!
//! Handlers for one key run in registration order. A panicking handler is
//! logged and skipped; the remaining handlers still run.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

type Handler<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct Registry<K, P> {
    next_id: u64,
    handlers: HashMap<K, Vec<(u64, Handler<P>)>>,
}

/// An event emitter keyed by `K` carrying payloads of type `P`.
pub struct Emitter<K, P> {
    registry: Arc<Mutex<Registry<K, P>>>,
}

/// De-registration handle returned by [`Emitter::on`].
pub struct Subscription<K, P> {
    registry: Weak<Mutex<Registry<K, P>>>,
    key: K,
    id: u64,
}

impl<K, P> Default for Emitter<K, P>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> Emitter<K, P>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: HashMap::new(),
            })),
        }
    }

    /// Register `handler` for `key`.
    pub fn on<F>(&self, key: K, handler: F) -> Subscription<K, P>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .handlers
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            key,
            id,
        }
    }

    /// Drop every handler registered for `key`.
    pub fn off_all(&self, key: &K) {
        self.registry.lock().handlers.remove(key);
    }

    /// Number of handlers currently registered for `key`.
    pub fn listener_count(&self, key: &K) -> usize {
        self.registry
            .lock()
            .handlers
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Call every handler registered for `key` with `payload`.
    pub fn dispatch(&self, key: &K, payload: &P) {
        // Snapshot so handlers may (un)subscribe while being called.
        let handlers: Vec<Handler<P>> = match self.registry.lock().handlers.get(key) {
            Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                error!("Event handler panicked, continuing with remaining handlers");
            }
        }
    }
}

impl<K, P> Subscription<K, P>
where
    K: Eq + Hash,
{
    /// Remove this registration. A no-op if the emitter is gone.
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();
        if let Some(handlers) = registry.handlers.get_mut(&self.key) {
            handlers.retain(|(id, _)| *id != self.id);
            if handlers.is_empty() {
                registry.handlers.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dispatch_in_registration_order() {
        let emitter: Emitter<&'static str, u32> = Emitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            emitter.on("evt", move |v: &u32| seen.lock().push((tag, *v)));
        }
        emitter.dispatch(&"evt", &7);

        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7), ("c", 7)]);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_handler() {
        let emitter: Emitter<String, ()> = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        let first = emitter.on("x".to_string(), move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        let _second = emitter.on("x".to_string(), move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        first.unsubscribe();
        emitter.dispatch(&"x".to_string(), &());

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(emitter.listener_count(&"x".to_string()), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let emitter: Emitter<u8, ()> = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        emitter.on(1, |_| panic!("subscriber failure"));
        let c = count.clone();
        emitter.on(1, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.dispatch(&1, &());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_after_emitter_dropped() {
        let emitter: Emitter<u8, ()> = Emitter::new();
        let sub = emitter.on(1, |_| {});
        drop(emitter);
        sub.unsubscribe();
    }
}

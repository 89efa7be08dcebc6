//! Observer lists for connection and registry notifications.
//!
//! Handlers are registered explicitly and removed by [`SubscriptionId`].
//! [`ObserverList::emit`] copies the handler list under the lock and calls the
//! handlers after releasing it, so a handler may subscribe, unsubscribe, or
//! trigger another emit on the same list without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

/// Handle returned by `subscribe`, used to unsubscribe again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered list of event handlers.
pub struct ObserverList<E> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> ObserverList<E> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler. Handlers run in registration order.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.handlers).push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Remove every handler.
    pub fn clear(&self) {
        lock(&self.handlers).clear();
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every handler with `event` on the current thread.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = lock(&self.handlers)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }
}

impl<E: Clone + Send + 'static> ObserverList<E> {
    /// Subscribe a channel that receives a clone of every event.
    ///
    /// Useful when events must be consumed on another task or thread. The
    /// receiver ends once the list is cleared.
    pub fn channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event: &E| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }
}

impl<E> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a mutex, ignoring poisoning. Every guarded structure here stays
/// consistent between statements, so a panicking holder leaves nothing torn.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Listener registration with drop-to-unsubscribe handles.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keeps the listener registered for the lifetime of the publisher.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Ordered set of listeners for values of type `T`.
pub(crate) struct ListenerRegistry<T> {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
}

impl<T: 'static> ListenerRegistry<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(BTreeMap::new()),
        })
    }

    pub(crate) fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(listener));

        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.listeners.lock().remove(&id);
            }
        })
    }

    /// Calls every listener in registration order, outside the lock.
    pub(crate) fn notify(&self, value: &T) {
        let listeners: Vec<Listener<T>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(value);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}

//! Synchronous listener registry with drop-to-unsubscribe handles.
//!
//! Listeners run on the emitting thread, after the registry's locks have been
//! released, so a listener may subscribe, unsubscribe or emit again.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: AtomicU64,
    listeners: DashMap<u64, Listener<E>>,
}

/// A set of listeners for events of type `E`.
pub struct Listeners<E> {
    registry: Arc<Registry<E>>,
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(0),
                listeners: DashMap::new(),
            }),
        }
    }

    /// Register a listener. It stays installed until the returned
    /// [`Subscription`] is dropped or cancelled.
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.listeners.insert(id, Arc::new(listener));
        let weak: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.listeners.remove(&id);
                }
            })),
        }
    }

    /// Deliver an event to every current listener, in subscription order.
    pub fn emit(&self, event: &E) {
        let mut current: Vec<(u64, Listener<E>)> = self
            .registry
            .listeners
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        current.sort_by_key(|(id, _)| *id);
        for (_, listener) in current {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.listeners.is_empty()
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Unsubscribes its listener when dropped.
#[must_use = "dropping a Subscription removes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

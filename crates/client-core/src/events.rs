//! Typed event bus
//!
//! Small pub/sub primitive shared by the sync engine and the realtime
//! transport: subscribers register a callback and receive every emitted
//! event until they unsubscribe. Emission order follows subscription order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identifier returned by [`EventBus::subscribe`]
pub type SubscriptionId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Mapping from subscription id to callback for one event type
pub struct EventBus<E> {
    subscribers: Mutex<BTreeMap<SubscriptionId, Callback<E>>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback; the returned id removes exactly this callback
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .insert(id, Arc::new(callback));
        id
    }

    /// Remove one subscriber; returns false if the id was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .remove(&id)
            .is_some()
    }

    /// Deliver an event to every current subscriber
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self
            .subscribers
            .lock()
            .expect("event bus lock poisoned")
            .values()
            .cloned()
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .clear();
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

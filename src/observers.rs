//! Shared observer registry for location and audio-level readings.
//!
//! The registry replaces a single mutable callback slot with a small ordered
//! set keyed by subscription tokens: registering a new observer no longer
//! silently evicts the previous one.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Token returned from [`ObserverSet::subscribe`]; pass it back to
/// [`ObserverSet::unsubscribe`] to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

/// An ordered set of observers notified in subscription order.
pub struct ObserverSet<T> {
    observers: Mutex<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

impl<T> ObserverSet<T> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer and return its detach token.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .expect("observer set poisoned")
            .push((id, Box::new(callback)));
        SubscriptionHandle(id)
    }

    /// Remove one observer. Unknown or already-removed tokens are a no-op.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.observers
            .lock()
            .expect("observer set poisoned")
            .retain(|(id, _)| *id != handle.0);
    }

    /// Invoke every observer with `value`, in subscription order.
    pub fn notify(&self, value: &T) {
        let observers = self.observers.lock().expect("observer set poisoned");
        for (_, callback) in observers.iter() {
            callback(value);
        }
    }

    /// Drop all observers.
    pub fn clear(&self) {
        self.observers
            .lock()
            .expect("observer set poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.observers.lock().expect("observer set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ObserverSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

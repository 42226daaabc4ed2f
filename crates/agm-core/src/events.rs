//! Typed publish/subscribe registry for discovery and stream callbacks.
//!
//! Replaces ad hoc callback vectors with one generic registry. Listeners
//! fire in registration order and get an explicit handle back; a listener
//! unsubscribing itself (or a sibling) while a dispatch is in flight never
//! skips or double-fires the remaining listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listener<T> {
    id: u64,
    callback: Callback<T>,
}

struct RegistryInner<T> {
    listeners: Mutex<Vec<Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> RegistryInner<T> {
    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|l| l.id == id)
    }
}

/// Registration-order callback registry.
pub struct CallbackRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CallbackRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register `callback`; it stays active until the returned handle is
    /// unsubscribed.
    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle<T> {
        self.insert(Arc::new(callback))
    }

    /// Deliver `value` to every currently registered listener, in
    /// registration order. Listeners removed mid-dispatch are skipped;
    /// listeners added mid-dispatch fire on the next notify.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<(u64, Callback<T>)> = {
            let listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            listeners
                .iter()
                .map(|l| (l.id, l.callback.clone()))
                .collect()
        };
        for (id, callback) in snapshot {
            // Membership recheck: the lock is not held while callbacks run,
            // so a listener removed by an earlier callback must not fire.
            if self.inner.contains(id) {
                callback(value);
            }
        }
    }

    /// Number of active listeners.
    pub fn len(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, callback: Callback<T>) -> ListenerHandle<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Listener { id, callback });
        ListenerHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Handle returned by [`CallbackRegistry::add`].
///
/// Dropping the handle does not unsubscribe; call [`unsubscribe`] to stop
/// receiving notifications.
///
/// [`unsubscribe`]: ListenerHandle::unsubscribe
pub struct ListenerHandle<T> {
    id: u64,
    inner: Weak<RegistryInner<T>>,
}

impl<T> ListenerHandle<T> {
    /// Remove the listener. Idempotent; returns whether it was still
    /// registered.
    pub fn unsubscribe(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.remove(self.id),
            None => false,
        }
    }
}

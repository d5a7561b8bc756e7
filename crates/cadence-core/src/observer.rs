//! Thread-safe observer registry.
//!
//! Observers are held as `Arc<T>` and compared by pointer identity. Every
//! notification iterates over a snapshot taken before the first callback,
//! so observers may add or remove observers (themselves included) from
//! inside a callback without deadlocking or skipping anyone.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::utils;

/// Registry of observers of type `T` (usually a `dyn Trait`).
pub struct ObserverRegistry<T: ?Sized> {
    observers: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> ObserverRegistry<T> {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer. Returns `false` if it was already registered.
    pub fn add(&self, observer: Arc<T>) -> bool {
        let mut observers = utils::write(&self.observers);
        if observers.iter().any(|o| same_instance(o, &observer)) {
            return false;
        }
        observers.push(observer);
        true
    }

    /// Unregister an observer. Returns `false` if it was not registered.
    pub fn remove(&self, observer: &Arc<T>) -> bool {
        let mut observers = utils::write(&self.observers);
        let before = observers.len();
        observers.retain(|o| !same_instance(o, observer));
        observers.len() != before
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        utils::read(&self.observers).len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        utils::read(&self.observers).is_empty()
    }

    /// Copy of the current observer list.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        utils::read(&self.observers).clone()
    }

    /// Call `f` for every observer registered at the time of the call.
    pub fn notify(&self, mut f: impl FnMut(&T)) {
        for observer in self.snapshot() {
            f(&observer);
        }
    }
}

impl<T: ?Sized> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for ObserverRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

/// Pointer identity for possibly-unsized `Arc`s (ignores vtable metadata).
pub(crate) fn same_instance<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    trait Ping: Send + Sync {
        fn ping(&self) -> usize;
    }

    struct Counter(Mutex<usize>);

    impl Ping for Counter {
        fn ping(&self) -> usize {
            let mut n = self.0.lock().unwrap();
            *n += 1;
            *n
        }
    }

    #[test]
    fn add_is_idempotent_by_identity() {
        let registry: ObserverRegistry<dyn Ping> = ObserverRegistry::new();
        let a: Arc<dyn Ping> = Arc::new(Counter(Mutex::new(0)));
        let b: Arc<dyn Ping> = Arc::new(Counter(Mutex::new(0)));

        assert!(registry.add(Arc::clone(&a)));
        assert!(!registry.add(Arc::clone(&a)));
        assert!(registry.add(Arc::clone(&b)));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn notify_reaches_every_observer_once() {
        let registry: ObserverRegistry<dyn Ping> = ObserverRegistry::new();
        let a = Arc::new(Counter(Mutex::new(0)));
        let b = Arc::new(Counter(Mutex::new(0)));
        registry.add(a.clone());
        registry.add(b.clone());

        registry.notify(|o| {
            o.ping();
        });

        assert_eq!(*a.0.lock().unwrap(), 1);
        assert_eq!(*b.0.lock().unwrap(), 1);
    }

    #[test]
    fn observer_can_unregister_during_notify() {
        let registry: Arc<ObserverRegistry<dyn Ping>> = Arc::new(ObserverRegistry::new());
        let a: Arc<dyn Ping> = Arc::new(Counter(Mutex::new(0)));
        registry.add(Arc::clone(&a));

        let reg = Arc::clone(&registry);
        registry.notify(|_| {
            reg.remove(&a);
        });

        assert!(registry.is_empty());
    }
}

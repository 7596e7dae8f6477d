//! Observable state cells.
//!
//! A [`Cell`] holds one value and a list of observers. Every `set` or
//! `update` calls the observers synchronously, after the value lock is
//! released, so an observer may read any cell (including this one).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle returned by [`Cell::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: Mutex<T>,
    observers: Mutex<Vec<(SubscriptionId, Observer<T>)>>,
    next_id: AtomicU64,
}

/// A shared, observable value. Clones refer to the same cell.
pub struct Cell<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

// A panicking observer must not wedge the mirror.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone> Cell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(value),
                observers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A copy of the current value.
    pub fn get(&self) -> T {
        lock(&self.inner.value).clone()
    }

    /// Borrow the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock(&self.inner.value))
    }

    /// Replace the value and notify observers.
    pub fn set(&self, value: T) {
        let snapshot = {
            let mut current = lock(&self.inner.value);
            *current = value;
            current.clone()
        };
        self.notify(&snapshot);
    }

    /// Modify the value in place and notify observers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let snapshot = {
            let mut current = lock(&self.inner.value);
            f(&mut current);
            current.clone()
        };
        self.notify(&snapshot);
    }

    /// Call `observer` after every change. It is not called for the
    /// current value.
    pub fn subscribe(&self, observer: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.observers).push((id, Arc::new(observer)));
        id
    }

    /// Stop calling an observer. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = lock(&self.inner.observers);
        let before = observers.len();
        observers.retain(|(other, _)| *other != id);
        observers.len() != before
    }

    fn notify(&self, value: &T) {
        let observers: Vec<Observer<T>> = lock(&self.inner.observers)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(value);
        }
    }
}

impl<T: Clone + Default> Default for Cell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cell").field(&self.get()).finish()
    }
}

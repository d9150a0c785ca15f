// Callback registry shared by the presence distributor and sync coordinator.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::warn;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T: ?Sized> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// Independent observers, each receiving every notification until it unsubscribes.
pub struct ObserverSet<T: ?Sized> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: ?Sized> Clone for ObserverSet<T> {
    fn clone(&self) -> Self {
        Self { registry: Arc::clone(&self.registry) }
    }
}

impl<T: ?Sized> Default for ObserverSet<T> {
    fn default() -> Self {
        Self { registry: Arc::new(Mutex::new(Registry { next_id: 0, callbacks: Vec::new() })) }
    }
}

impl<T: ?Sized + 'static> ObserverSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            registry.next_id += 1;
            let id = registry.next_id;
            let callback: Callback<T> = Arc::new(callback);
            registry.callbacks.push((id, callback));
            id
        };

        let registry: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                lock(&registry).callbacks.retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Invoke every observer. A panicking observer is logged and skipped.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> =
            lock(&self.registry).callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                warn!("observer callback panicked; continuing fan-out");
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).callbacks.len()
    }

    pub fn clear(&self) {
        lock(&self.registry).callbacks.clear();
    }
}

fn lock<T: ?Sized>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Mutex::new(Some(Box::new(cancel))) }
    }

    /// Stop receiving notifications. Safe to call more than once.
    pub fn unsubscribe(&self) {
        let cancel = self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(set: &ObserverSet<str>) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let sub = set.subscribe(move |_: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[test]
    fn every_observer_receives_every_notification() {
        let set = ObserverSet::<str>::new();
        let (first, _a) = counter(&set);
        let (second, _b) = counter(&set);

        set.notify("one");
        set.notify("two");

        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_isolated() {
        let set = ObserverSet::<str>::new();
        let (first, sub_a) = counter(&set);
        let (second, _sub_b) = counter(&set);

        sub_a.unsubscribe();
        sub_a.unsubscribe();
        set.notify("after");

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn panicking_observer_does_not_stop_fan_out() {
        let set = ObserverSet::<str>::new();
        let _bad = set.subscribe(|_: &str| panic!("observer bug"));
        let (count, _good) = counter(&set);

        set.notify("value");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_after_set_dropped_is_noop() {
        let set = ObserverSet::<str>::new();
        let (_, sub) = counter(&set);
        drop(set);
        sub.unsubscribe();
    }
}

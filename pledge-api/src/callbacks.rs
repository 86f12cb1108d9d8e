//! # Callback Registry
//!
//! Ordered, append-only lists of then / catch / complete callbacks embedded in
//! every promise.
//!
//! Callbacks are invoked without holding the list lock: the list is taken out,
//! fired in registration order, then merged back in front of anything that was
//! registered while it was firing. A callback may therefore register further
//! callbacks or inspect its own promise without deadlocking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::buffer::Resolved;
use crate::sync::lock;

/// Fired with the most recently resolved value.
pub type ThenCallback<T> = Box<dyn FnMut(&T) + Send + 'static>;

/// Fired with the rejection value.
pub type CatchCallback<E> = Box<dyn FnMut(&E) + Send + 'static>;

/// Fired once per `exec` with the observable result and the recorded error.
pub type CompleteCallback<T, E> = Box<dyn FnMut(Option<&Resolved<T>>, Option<&E>) + Send + 'static>;

pub(crate) struct CallbackRegistry<T, E> {
    then: Mutex<Vec<ThenCallback<T>>>,
    catch: Mutex<Vec<CatchCallback<E>>>,
    complete: Mutex<Vec<CompleteCallback<T, E>>>,
    // The catch list is empty while it fires, so handled-ness is counted separately.
    catch_count: AtomicUsize,
}

impl<T, E> CallbackRegistry<T, E> {
    pub(crate) fn new() -> Self {
        Self {
            then: Mutex::new(Vec::new()),
            catch: Mutex::new(Vec::new()),
            complete: Mutex::new(Vec::new()),
            catch_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push_then(&self, callback: ThenCallback<T>) {
        lock(&self.then).push(callback);
    }

    pub(crate) fn push_catch(&self, callback: CatchCallback<E>) {
        lock(&self.catch).push(callback);
        self.catch_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn push_complete(&self, callback: CompleteCallback<T, E>) {
        lock(&self.complete).push(callback);
    }

    pub(crate) fn has_catch(&self) -> bool {
        self.catch_count.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn then_len(&self) -> usize {
        lock(&self.then).len()
    }

    pub(crate) fn fire_then(&self, value: &T) {
        fire(&self.then, |callback| callback(value));
    }

    pub(crate) fn fire_catch(&self, error: &E) {
        fire(&self.catch, |callback| callback(error));
    }

    pub(crate) fn fire_complete(&self, result: Option<&Resolved<T>>, error: Option<&E>) {
        fire(&self.complete, |callback| callback(result, error));
    }
}

fn fire<C>(slot: &Mutex<Vec<C>>, mut invoke: impl FnMut(&mut C)) {
    let mut taken = std::mem::take(&mut *lock(slot));
    for callback in taken.iter_mut() {
        invoke(callback);
    }

    let mut current = lock(slot);
    taken.append(&mut current);
    *current = taken;
}

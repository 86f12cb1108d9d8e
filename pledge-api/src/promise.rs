//! # Promise
//!
//! A deferred computation with chained success, failure and completion
//! callbacks.
//!
//! ## Lifecycle
//!
//! A promise is created `Pending` around a *starter*. Calling [`Promise::exec`]
//! runs the starter exactly once; the starter settles the promise through the
//! [`Resolver`] and [`Rejecter`] it is handed:
//!
//! - `resolve` may be called many times (streaming). Every value is kept in a
//!   bounded ring buffer and every `then` callback is notified.
//! - `reject` records the error and notifies every `catch` callback. A
//!   rejection nobody catches moves the promise to `Rejected` immediately and
//!   is reported back as [`PromiseError::Unhandled`].
//!
//! When the starter returns, the complete phase stamps `completed_at`,
//! finalizes the state and fires every `complete` callback once.
//!
//! ## Example
//!
//! ```
//! use pledge_api::promise::{Promise, PromiseState};
//!
//! let promise: Promise<i32, std::io::Error> = Promise::new(|resolve, _reject| {
//!     resolve.resolve(41 + 1);
//!     Ok(())
//! });
//! promise.exec().unwrap();
//!
//! assert_eq!(promise.state(), PromiseState::Fulfilled);
//! assert_eq!(promise.last_result(), Some(42));
//! ```

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use tracing::{debug, debug_span, error, warn};
use uuid::Uuid;

use crate::buffer::{Resolved, ResultBuffer, DEFAULT_BUFFER_CAPACITY};
use crate::callbacks::{CallbackRegistry, CatchCallback, CompleteCallback, ThenCallback};
use crate::errors::{PromiseError, SharedError};
use crate::runner::{Job, PromiseRunner};
use crate::sync::lock;

/// Process-unique promise identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(Uuid);

impl PromiseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PromiseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Settlement state of a promise. Transitions happen once and never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

impl PromiseState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Computation run by [`Promise::exec`]. Returning `Err` rejects the promise.
pub type Starter<T, E> =
    Box<dyn FnOnce(Resolver<T, E>, Rejecter<T, E>) -> Result<(), E> + Send + 'static>;

struct Core<T, E> {
    state: PromiseState,
    results: ResultBuffer<T>,
    error: Option<Arc<E>>,
    unhandled: Option<Arc<E>>,
    completed_at: Option<SystemTime>,
}

struct Inner<T, E> {
    id: PromiseId,
    starter: Mutex<Option<Starter<T, E>>>,
    core: Mutex<Core<T, E>>,
    callbacks: CallbackRegistry<T, E>,
    canceled: AtomicBool,
    raise_again: bool,
}

/// Shared handle to a promise. Clones refer to the same promise.
pub struct Promise<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = lock(&self.inner.core);
        f.debug_struct("Promise")
            .field("id", &self.inner.id)
            .field("state", &core.state)
            .field("results", &core.results)
            .field("has_error", &core.error.is_some())
            .field("canceled", &self.inner.canceled.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Error + Send + Sync + 'static,
{
    /// Create a pending promise around `starter`. Nothing runs until `exec`.
    pub fn new<F>(starter: F) -> Self
    where
        F: FnOnce(Resolver<T, E>, Rejecter<T, E>) -> Result<(), E> + Send + 'static,
    {
        Self::builder(starter).build()
    }

    pub fn builder<F>(starter: F) -> PromiseBuilder<T, E>
    where
        F: FnOnce(Resolver<T, E>, Rejecter<T, E>) -> Result<(), E> + Send + 'static,
    {
        PromiseBuilder::new(Box::new(starter))
    }

    pub fn id(&self) -> PromiseId {
        self.inner.id
    }

    pub fn state(&self) -> PromiseState {
        lock(&self.inner.core).state
    }

    /// Observable result: `One` after a single resolve, every buffered value
    /// after several.
    pub fn result(&self) -> Option<Resolved<T>> {
        lock(&self.inner.core).results.snapshot()
    }

    pub fn last_result(&self) -> Option<T> {
        lock(&self.inner.core).results.last().cloned()
    }

    pub fn error(&self) -> Option<Arc<E>> {
        lock(&self.inner.core).error.clone()
    }

    pub fn completed_at(&self) -> Option<SystemTime> {
        lock(&self.inner.core).completed_at
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Mark the promise canceled. Only observed by a runner at dequeue time.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    /// Register a success callback.
    ///
    /// If the promise is already fulfilled the callback also fires right away
    /// with the most recent value. Use [`then_result`](Self::then_result) to
    /// see every buffered value on a late registration.
    pub fn then<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        let mut callback = callback;
        let replay = {
            let core = lock(&self.inner.core);
            match core.state {
                PromiseState::Fulfilled => core.results.last().cloned(),
                _ => None,
            }
        };
        if let Some(value) = replay {
            callback(&value);
        }
        self.inner.callbacks.push_then(Box::new(callback));
        self
    }

    /// Register a success callback that receives the observable result.
    ///
    /// Each resolve delivers `Resolved::One(value)`. If the promise is already
    /// fulfilled the callback fires right away with [`result`](Self::result),
    /// which is `Resolved::Many` once more than one value was resolved.
    pub fn then_result<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&Resolved<T>) + Send + 'static,
    {
        let mut callback = callback;
        let replay = {
            let core = lock(&self.inner.core);
            match core.state {
                PromiseState::Fulfilled => core.results.snapshot(),
                _ => None,
            }
        };
        if let Some(result) = replay {
            callback(&result);
        }
        self.inner
            .callbacks
            .push_then(Box::new(move |value: &T| callback(&Resolved::One(value.clone()))));
        self
    }

    /// Register a failure callback.
    ///
    /// If the promise is already rejected the callback also fires right away
    /// with the recorded error.
    pub fn catch<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&E) + Send + 'static,
    {
        let mut callback = callback;
        let replay = {
            let core = lock(&self.inner.core);
            match core.state {
                PromiseState::Rejected => core.error.clone(),
                _ => None,
            }
        };
        if let Some(error) = replay {
            callback(&error);
        }
        self.inner.callbacks.push_catch(Box::new(callback));
        self
    }

    /// Register a completion callback. Never replayed.
    pub fn complete<F>(&self, callback: F) -> &Self
    where
        F: FnMut(Option<&Resolved<T>>, Option<&E>) + Send + 'static,
    {
        self.inner.callbacks.push_complete(Box::new(callback));
        self
    }

    /// When this promise resolves, build a follow-up promise with `f` and hand
    /// it to `runner` instead of driving it inline.
    pub fn then_schedule<R, U, E2, F>(&self, runner: Arc<R>, f: F) -> &Self
    where
        R: PromiseRunner + ?Sized + 'static,
        U: Clone + Send + 'static,
        E2: Error + Send + Sync + 'static,
        F: FnMut(&T) -> Promise<U, E2> + Send + 'static,
    {
        let mut f = f;
        let parent = self.id();
        self.then(move |value| {
            let next = f(value);
            let next_id = next.id();
            if let Err(e) = runner.submit(next.into_job()) {
                error!(
                    parent = %parent,
                    promise = %next_id,
                    error = %e,
                    "Failed to schedule follow-up promise"
                );
            }
        })
    }

    /// Settle with a value. Ignored once the promise is terminal or rejected.
    pub fn resolve(&self, value: T) {
        {
            let mut core = lock(&self.inner.core);
            if core.state.is_terminal() || core.error.is_some() {
                warn!(
                    promise = %self.inner.id,
                    state = ?core.state,
                    "Ignoring resolve on a settled promise"
                );
                return;
            }
            core.results.push(value.clone());
        }
        self.inner.callbacks.fire_then(&value);
    }

    /// Settle with an error.
    ///
    /// Without any catch callback the promise becomes `Rejected` at once and
    /// the rejection is returned as [`PromiseError::Unhandled`].
    pub fn reject(&self, error: E) -> Result<(), PromiseError<E>> {
        let error = Arc::new(error);
        {
            let mut core = lock(&self.inner.core);
            if core.state.is_terminal() {
                warn!(
                    promise = %self.inner.id,
                    state = ?core.state,
                    "Ignoring reject on a settled promise"
                );
                return Ok(());
            }
            core.error = Some(Arc::clone(&error));
            if !self.inner.callbacks.has_catch() {
                core.state = PromiseState::Rejected;
                core.unhandled = Some(Arc::clone(&error));
                return Err(PromiseError::Unhandled {
                    id: self.inner.id,
                    source: error,
                });
            }
        }
        self.inner.callbacks.fire_catch(&error);
        Ok(())
    }

    /// Run the starter, then the complete phase.
    ///
    /// Returns the unhandled rejection if there was one, otherwise the
    /// recorded rejection when built with `raise_again`.
    pub fn exec(&self) -> Result<(), PromiseError<E>> {
        let starter = lock(&self.inner.starter)
            .take()
            .ok_or(PromiseError::AlreadyExecuted(self.inner.id))?;

        let span = debug_span!("promise_exec", promise = %self.inner.id);
        let _guard = span.enter();

        let started = starter(Resolver::new(self.clone()), Rejecter::new(self.clone()));
        if let Err(e) = started {
            debug!(error = %e, "Starter failed");
            // Recorded in the core, surfaced after the complete phase.
            let _ = self.reject(e);
        }

        let (result, error, unhandled) = {
            let mut core = lock(&self.inner.core);
            core.completed_at = Some(SystemTime::now());
            if core.state == PromiseState::Pending {
                core.state = match core.error {
                    Some(_) => PromiseState::Rejected,
                    None => PromiseState::Fulfilled,
                };
            }
            (
                core.results.snapshot(),
                core.error.clone(),
                core.unhandled.clone(),
            )
        };
        debug!(state = ?self.state(), "Promise completed");

        self.inner
            .callbacks
            .fire_complete(result.as_ref(), error.as_deref());

        if let Some(source) = unhandled {
            return Err(PromiseError::Unhandled {
                id: self.inner.id,
                source,
            });
        }
        match error {
            Some(source) if self.inner.raise_again => Err(PromiseError::Rejected {
                id: self.inner.id,
                source,
            }),
            _ => Ok(()),
        }
    }

    /// Type-erased handle for submission to a runner.
    pub fn job(&self) -> Arc<dyn Job> {
        Arc::new(self.clone())
    }

    pub fn into_job(self) -> Arc<dyn Job> {
        Arc::new(self)
    }

    /// Handle that does not keep the promise alive.
    pub fn downgrade(&self) -> WeakPromise<T, E> {
        WeakPromise {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered then callbacks.
    pub fn then_count(&self) -> usize {
        self.inner.callbacks.then_len()
    }
}

impl<T, E> Job for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Error + Send + Sync + 'static,
{
    fn id(&self) -> PromiseId {
        Promise::id(self)
    }

    fn is_canceled(&self) -> bool {
        Promise::is_canceled(self)
    }

    fn cancel(&self) {
        Promise::cancel(self)
    }

    /// A promise submitted twice runs once; the second run is skipped.
    fn run(&self) -> Result<(), SharedError> {
        match self.exec() {
            Err(PromiseError::AlreadyExecuted(id)) => {
                warn!(promise = %id, "Skipping promise that already ran");
                Ok(())
            }
            other => other.map_err(|e| Arc::new(e) as SharedError),
        }
    }
}

/// Non-owning promise handle, see [`Promise::downgrade`].
pub struct WeakPromise<T, E> {
    inner: Weak<Inner<T, E>>,
}

impl<T, E> WeakPromise<T, E> {
    pub fn upgrade(&self) -> Option<Promise<T, E>> {
        self.inner.upgrade().map(|inner| Promise { inner })
    }
}

impl<T, E> Clone for WeakPromise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

/// Settles a promise with values. Handed to the starter.
pub struct Resolver<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> Resolver<T, E>
where
    T: Clone + Send + 'static,
    E: Error + Send + Sync + 'static,
{
    fn new(promise: Promise<T, E>) -> Self {
        Self { promise }
    }

    pub fn resolve(&self, value: T) {
        self.promise.resolve(value);
    }
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

/// Settles a promise with an error. Handed to the starter.
pub struct Rejecter<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> Rejecter<T, E>
where
    T: Clone + Send + 'static,
    E: Error + Send + Sync + 'static,
{
    fn new(promise: Promise<T, E>) -> Self {
        Self { promise }
    }

    /// Reject the promise.
    ///
    /// Fails with [`PromiseError::Unhandled`] when no catch callback is
    /// registered. The promise is `Rejected` at that point and `exec` reports
    /// the rejection, so the starter should return:
    ///
    /// ```rust
    /// use pledge_api::Promise;
    ///
    /// let promise: Promise<u32, std::io::Error> = Promise::new(|resolve, reject| {
    ///     if reject.reject(std::io::Error::other("no input")).is_err() {
    ///         return Ok(());
    ///     }
    ///     resolve.resolve(1);
    ///     Ok(())
    /// });
    /// assert!(promise.exec().is_err());
    /// ```
    #[must_use = "an unhandled rejection means the starter should stop"]
    pub fn reject(&self, error: E) -> Result<(), PromiseError<E>> {
        self.promise.reject(error)
    }
}

impl<T, E> Clone for Rejecter<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

/// Builder for promises with initial callbacks and options.
pub struct PromiseBuilder<T, E> {
    starter: Starter<T, E>,
    then: Vec<ThenCallback<T>>,
    catch: Vec<CatchCallback<E>>,
    complete: Vec<CompleteCallback<T, E>>,
    raise_again: bool,
    buffer_capacity: usize,
}

impl<T, E> PromiseBuilder<T, E>
where
    T: Clone + Send + 'static,
    E: Error + Send + Sync + 'static,
{
    fn new(starter: Starter<T, E>) -> Self {
        Self {
            starter,
            then: Vec::new(),
            catch: Vec::new(),
            complete: Vec::new(),
            raise_again: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    pub fn then<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.then.push(Box::new(callback));
        self
    }

    /// See [`Promise::then_result`].
    pub fn then_result<F>(self, callback: F) -> Self
    where
        F: FnMut(&Resolved<T>) + Send + 'static,
    {
        let mut callback = callback;
        self.then(move |value: &T| callback(&Resolved::One(value.clone())))
    }

    pub fn catch<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.catch.push(Box::new(callback));
        self
    }

    pub fn complete<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Option<&Resolved<T>>, Option<&E>) + Send + 'static,
    {
        self.complete.push(Box::new(callback));
        self
    }

    /// Return a recorded rejection from `exec` after the complete phase.
    pub fn raise_again(mut self, raise_again: bool) -> Self {
        self.raise_again = raise_again;
        self
    }

    /// Number of resolved values kept. Clamped to at least one.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn build(self) -> Promise<T, E> {
        let callbacks = CallbackRegistry::new();
        for callback in self.then {
            callbacks.push_then(callback);
        }
        for callback in self.catch {
            callbacks.push_catch(callback);
        }
        for callback in self.complete {
            callbacks.push_complete(callback);
        }

        Promise {
            inner: Arc::new(Inner {
                id: PromiseId::new(),
                starter: Mutex::new(Some(self.starter)),
                core: Mutex::new(Core {
                    state: PromiseState::Pending,
                    results: ResultBuffer::new(self.buffer_capacity),
                    error: None,
                    unhandled: None,
                    completed_at: None,
                }),
                callbacks,
                canceled: AtomicBool::new(false),
                raise_again: self.raise_again,
            }),
        }
    }

    /// Build and execute synchronously.
    pub fn start_immediately(self) -> Result<Promise<T, E>, PromiseError<E>> {
        let promise = self.build();
        promise.exec()?;
        Ok(promise)
    }
}

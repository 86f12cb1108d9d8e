//! # Worker Queue Module
//!
//! A worker queue owns one consumer thread and a FIFO of promises. The thread
//! executes promises strictly in submission order, one at a time.
//!
//! ## Key Concepts
//! - Lifecycle: `Idle -> Running -> (Stopped | Failed)`, never restarted
//! - Idle shutdown: a queue that found no work for `max_idle` stops itself
//! - Fail-fast: the first error escaping a promise fails the queue
//! - Cancellation: checked once, when a promise is dequeued
//! - Draining: `drain` lets the thread finish everything queued, then stop
//!
//! ## Example
//!
//! ```rust
//! use pledge::{Promise, PromiseRunner, QueueConfig, WorkerQueue};
//!
//! let queue = WorkerQueue::with_config(QueueConfig::default());
//! let promise: Promise<u32, std::io::Error> = Promise::new(|resolve, _| {
//!     resolve.resolve(1);
//!     Ok(())
//! });
//!
//! queue.add_promise(&promise).unwrap();
//! queue.start().unwrap();
//! queue.stop();
//! queue.join().unwrap();
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crossbeam_queue::SegQueue;
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use pledge_api::errors::QueueError;
use pledge_api::sync::lock;
use pledge_api::{Job, PromiseContainer, PromiseId, PromiseRunner};

use crate::config::QueueConfig;
use crate::logging;
use crate::{log_error, log_queue, promise_span, queue_span};

/// Called on the consumer thread once a queue stops or fails.
pub type OnStop = Arc<dyn Fn(&WorkerQueue) + Send + Sync + 'static>;

// Process-wide queue numbering
static NEXT_INDEX: AtomicUsize = AtomicUsize::new(0);

/// States a queue can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Queue has been created but its thread was not started yet
    Idle,
    /// Consumer thread is running
    Running,
    /// Stopped on request or after idling past `max_idle`
    Stopped,
    /// Stopped because an error escaped a promise
    Failed,
}

impl QueueState {
    /// Whether the queue can no longer accept work.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

struct Shared {
    /// Process-unique queue number
    index: usize,

    /// Timing settings
    config: QueueConfig,

    /// FIFO of submitted jobs
    sender: Sender<Arc<dyn Job>>,
    receiver: Receiver<Arc<dyn Job>>,

    /// Weak index of queued jobs for cancellation
    container: PromiseContainer,

    /// Current lifecycle state, also guards enqueueing
    state: Mutex<QueueState>,

    /// Stop signal, polled by the consumer thread
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,

    /// Stop once the FIFO runs dry instead of waiting for `max_idle`
    draining: AtomicBool,

    /// Errors recorded by this queue
    errors: Mutex<Vec<QueueError>>,

    /// Pool-wide error sink, if the queue belongs to a pool
    error_sink: Option<Arc<SegQueue<QueueError>>>,

    /// Called when the thread stops
    on_stop: Option<OnStop>,

    /// Handle to the consumer thread
    thread: Mutex<Option<JoinHandle<()>>>,

    /// Id of the consumer thread once it is running
    thread_id: Mutex<Option<ThreadId>>,
}

/// FIFO of promises executed by one dedicated thread.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct WorkerQueue {
    shared: Arc<Shared>,
}

/// Debug implementation for WorkerQueue
impl fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerQueue")
            .field("index", &self.shared.index)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .field("errors", &lock(&self.shared.errors).len())
            .field("has_thread", &lock(&self.shared.thread).is_some())
            .finish()
    }
}

impl Default for WorkerQueue {
    fn default() -> Self {
        Self::with_config(QueueConfig::default())
    }
}

impl WorkerQueue {
    /// Create a queue that calls `on_stop` when it stops.
    pub fn new(config: QueueConfig, on_stop: Option<OnStop>) -> Self {
        Self::create(config, on_stop, None)
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self::new(config, None)
    }

    pub(crate) fn create(
        config: QueueConfig,
        on_stop: Option<OnStop>,
        error_sink: Option<Arc<SegQueue<QueueError>>>,
    ) -> Self {
        let (sender, receiver) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::bounded(1);

        Self {
            shared: Arc::new(Shared {
                index: NEXT_INDEX.fetch_add(1, Ordering::SeqCst),
                config,
                sender,
                receiver,
                container: PromiseContainer::new(),
                state: Mutex::new(QueueState::Idle),
                stop_tx,
                stop_rx,
                draining: AtomicBool::new(false),
                errors: Mutex::new(Vec::new()),
                error_sink,
                on_stop,
                thread: Mutex::new(None),
                thread_id: Mutex::new(None),
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn state(&self) -> QueueState {
        *lock(&self.shared.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == QueueState::Running
    }

    /// Number of jobs waiting to be dequeued.
    pub fn pending(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Most recent error recorded by this queue.
    pub fn error(&self) -> Option<QueueError> {
        lock(&self.shared.errors).last().cloned()
    }

    pub fn errors(&self) -> Vec<QueueError> {
        lock(&self.shared.errors).clone()
    }

    /// Whether a consumer thread exists that has not exited yet.
    pub(crate) fn has_live_thread(&self) -> bool {
        lock(&self.shared.thread)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn thread_name(&self) -> String {
        format!("{}-{}", self.shared.config.thread_name_prefix, self.shared.index)
    }

    /// Spawn the consumer thread.
    ///
    /// Starting a running queue is a no-op; a stopped or failed queue cannot
    /// be restarted.
    pub fn start(&self) -> Result<(), QueueError> {
        let index = self.shared.index;

        // Check and update state
        {
            let mut state = lock(&self.shared.state);
            match *state {
                QueueState::Idle => *state = QueueState::Running,
                QueueState::Running => return Ok(()),
                QueueState::Stopped | QueueState::Failed => {
                    return Err(QueueError::Closed { queue: index });
                }
            }
        }

        let queue = self.clone();
        let dispatch = logging::current_subscriber();

        let spawned = thread::Builder::new()
            .name(self.thread_name())
            .spawn(move || {
                let _dispatch = tracing::dispatcher::set_default(&dispatch);
                queue.run();
            });

        match spawned {
            Ok(handle) => {
                *lock(&self.shared.thread) = Some(handle);
                log_queue!(index, "started");
                Ok(())
            }
            Err(e) => {
                let error = QueueError::Spawn {
                    queue: index,
                    reason: e.to_string(),
                };
                self.finish(QueueState::Failed, Some(error.clone()));
                Err(error)
            }
        }
    }

    /// Ask the consumer thread to stop after the current job.
    ///
    /// Jobs still queued are not executed. A queue that was never started is
    /// closed right away.
    pub fn stop(&self) {
        let never_started = {
            let mut state = lock(&self.shared.state);
            match *state {
                QueueState::Idle => {
                    *state = QueueState::Stopped;
                    true
                }
                _ => false,
            }
        };

        if never_started {
            self.finish(QueueState::Stopped, None);
        } else {
            // A full channel means a stop is already pending
            let _ = self.shared.stop_tx.try_send(());
        }
    }

    /// Let the consumer thread run every queued job, then stop.
    ///
    /// A queue that was never started is started so its jobs still run. An
    /// explicit `stop` still takes effect after the current job.
    pub fn drain(&self) {
        self.shared.draining.store(true, Ordering::SeqCst);
        if self.state() != QueueState::Idle {
            return;
        }
        if self.pending() == 0 {
            self.stop();
        } else if let Err(e) = self.start() {
            // Already recorded by start
            tracing::debug!(queue = self.shared.index, error = %e, "Drain could not start queue");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::SeqCst)
    }

    /// Wait for the consumer thread to exit.
    pub fn join(&self) -> Result<(), QueueError> {
        let index = self.shared.index;
        if self.on_own_thread() {
            return Err(QueueError::SelfJoin { queue: index });
        }

        let handle = lock(&self.shared.thread).take();
        if let Some(handle) = handle {
            if let Err(payload) = handle.join() {
                let error = QueueError::ThreadPanicked {
                    queue: index,
                    message: panic_message(payload.as_ref()),
                };
                self.record(error.clone());
                return Err(error);
            }
        }
        Ok(())
    }

    /// Cancel a queued promise. Returns whether it was still queued.
    ///
    /// Once this returns `true` the promise will be skipped. Never waits for
    /// the job being executed, so it is safe to call from inside a promise.
    pub fn cancel(&self, id: &PromiseId) -> bool {
        self.shared.container.cancel(id)
    }

    fn on_own_thread(&self) -> bool {
        *lock(&self.shared.thread_id) == Some(thread::current().id())
    }

    // Consumer thread body
    fn run(&self) {
        let index = self.shared.index;
        let config = &self.shared.config;
        *lock(&self.shared.thread_id) = Some(thread::current().id());

        let span = queue_span!(index);
        let _guard = span.enter();

        let mut idle_since: Option<Instant> = None;

        loop {
            match self.shared.stop_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    self.finish(QueueState::Stopped, None);
                    return;
                }
                Err(TryRecvError::Empty) => {}
            }

            match self.shared.receiver.recv_timeout(config.queue_timeout) {
                Ok(job) => {
                    idle_since = None;

                    if let Err(error) = self.execute(job) {
                        self.finish(QueueState::Failed, Some(error));
                        return;
                    }

                    match self.shared.stop_rx.recv_timeout(config.interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            self.finish(QueueState::Stopped, None);
                            return;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_draining() && self.close_if_empty() {
                        log_queue!(index, "drained");
                        self.finish(QueueState::Stopped, None);
                        return;
                    }

                    if config.max_idle.is_zero() {
                        continue;
                    }

                    let since = *idle_since.get_or_insert_with(Instant::now);
                    if since.elapsed() < config.max_idle {
                        continue;
                    }

                    if self.close_if_empty() {
                        let idle_ms = since.elapsed().as_millis() as u64;
                        log_queue!(index, "idle", idle_ms);
                        self.finish(QueueState::Stopped, None);
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.finish(QueueState::Stopped, None);
                    return;
                }
            }
        }
    }

    // Enqueueing holds the state lock, so nothing can slip in between the
    // emptiness check and the transition.
    fn close_if_empty(&self) -> bool {
        let mut state = lock(&self.shared.state);
        if self.shared.receiver.is_empty() {
            *state = QueueState::Stopped;
            true
        } else {
            false
        }
    }

    fn execute(&self, job: Arc<dyn Job>) -> Result<(), QueueError> {
        let index = self.shared.index;
        let id = job.id();

        // Removal and the flag check pair with the container's cancel
        self.shared.container.remove(&id);
        if job.is_canceled() {
            log_queue!(index, "skipped", promise = %id);
            return Ok(());
        }

        let span = promise_span!(id, queue = index);
        let _guard = span.enter();

        match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(QueueError::PromiseFailed {
                queue: index,
                promise: id,
                source,
            }),
            Err(payload) => Err(QueueError::Panicked {
                queue: index,
                promise: id,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    fn record(&self, error: QueueError) {
        log_error!(error, queue = self.shared.index);
        lock(&self.shared.errors).push(error.clone());
        if let Some(sink) = &self.shared.error_sink {
            sink.push(error);
        }
    }

    fn finish(&self, state: QueueState, error: Option<QueueError>) {
        *lock(&self.shared.state) = state;
        if let Some(error) = error {
            self.record(error);
        }

        log_queue!(self.shared.index, "stopped", state = ?state, pending = self.pending());

        if let Some(on_stop) = &self.shared.on_stop {
            on_stop(self);
        }
    }
}

impl PromiseRunner for WorkerQueue {
    /// Register the job for cancellation and enqueue it.
    ///
    /// Refused once the queue stopped or failed. A queue that was not started
    /// yet accepts jobs and runs them once started.
    fn submit(&self, job: Arc<dyn Job>) -> Result<(), QueueError> {
        let index = self.shared.index;
        let state = lock(&self.shared.state);
        if state.is_closed() {
            return Err(QueueError::Closed { queue: index });
        }

        self.shared.container.add(&job);
        let id = job.id();
        self.shared
            .sender
            .send(job)
            .map_err(|_| QueueError::Closed { queue: index })?;
        drop(state);

        log_queue!(index, "enqueued", promise = %id);
        Ok(())
    }

    fn start(&self) -> Result<(), QueueError> {
        WorkerQueue::start(self)
    }

    fn stop(&self) {
        WorkerQueue::stop(self)
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn indices_are_unique() {
        let a = WorkerQueue::default();
        let b = WorkerQueue::default();
        assert_ne!(a.index(), b.index());
        assert_eq!(a.thread_name(), format!("pledge-queue-{}", a.index()));
    }

    #[test]
    fn stop_before_start_closes_queue() {
        let queue = WorkerQueue::default();
        queue.stop();

        assert_eq!(queue.state(), QueueState::Stopped);
        assert!(matches!(queue.start(), Err(QueueError::Closed { .. })));
        assert!(queue.join().is_ok());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload = panic::catch_unwind(|| panic!("bad {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "bad 1");

        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }

    #[test]
    fn persistent_queue_outlives_max_idle() {
        let queue = WorkerQueue::with_config(QueueConfig::persistent());
        queue.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        assert!(queue.is_running());
        queue.stop();
        queue.join().unwrap();
        assert_eq!(queue.state(), QueueState::Stopped);
    }
}

//! # Worker Pool Module
//!
//! A fixed number of worker queue slots fed round-robin.
//!
//! ## Key Concepts
//! - Slots: the pool owns `pool_size` slots, each holding one `WorkerQueue`
//! - Lazy creation: slots are filled on first submission unless the pool is
//!   configured to start immediately
//! - Replacement: a queue found stopped or failed at dispatch time is replaced
//!   in its slot by a freshly started one
//! - Error sink: failures of every queue are collected pool-wide and drained
//!   with `errors()`
//! - Drop: a non-daemon pool runs what is already queued, then joins

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, PoisonError};

use crossbeam_queue::SegQueue;

use pledge_api::errors::QueueError;
use pledge_api::sync::lock;
use pledge_api::{Job, PromiseId, PromiseRunner};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::queue::{OnStop, WorkerQueue};
use crate::{log_error, log_pool};

/// Called whenever one of the pool's queues stops or fails.
pub type QueueStopCallback = Arc<dyn Fn(&WorkerQueue) + Send + Sync + 'static>;

// Process-wide pool numbering, used in log fields
static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

struct Slots {
    /// One queue per slot, indexed by slot number
    queues: Vec<WorkerQueue>,
    /// Next slot to dispatch to
    cursor: usize,
    /// Replaced queues whose threads may still be running
    retired: Vec<WorkerQueue>,
}

struct PoolShared {
    id: usize,
    config: PoolConfig,
    slots: Mutex<Slots>,
    errors: Arc<SegQueue<QueueError>>,
    on_queue_stop: RwLock<Option<QueueStopCallback>>,
    shutting_down: AtomicBool,
}

impl PoolShared {
    // Runs on the stopping queue's thread; must not touch the slots lock,
    // the dispatching thread may hold it while this queue is being replaced.
    fn queue_stopped(&self, queue: &WorkerQueue) {
        log_pool!(
            self.id,
            "queue_stopped",
            queue = queue.index(),
            state = ?queue.state()
        );

        let callback = self
            .on_queue_stop
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(queue);
        }
    }
}

/// Round-robin pool of worker queues.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = lock(&self.shared.slots);
        f.debug_struct("WorkerPool")
            .field("id", &self.shared.id)
            .field("pool_size", &self.shared.config.pool_size)
            .field("queues", &slots.queues)
            .field("cursor", &slots.cursor)
            .field("retired", &slots.retired.len())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool. Queues are created on first use unless
    /// `start_immediately` is set.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let start_immediately = config.start_immediately;

        let pool = Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::SeqCst),
                slots: Mutex::new(Slots {
                    queues: Vec::with_capacity(config.pool_size),
                    cursor: 0,
                    retired: Vec::new(),
                }),
                config,
                errors: Arc::new(SegQueue::new()),
                on_queue_stop: RwLock::new(None),
                shutting_down: AtomicBool::new(false),
            }),
        };

        if start_immediately {
            pool.start()?;
        }
        log_pool!(
            pool.shared.id,
            "created",
            pool_size = pool.shared.config.pool_size,
            daemon = pool.shared.config.daemon
        );
        Ok(pool)
    }

    /// Pool configured from `PLEDGE_THREAD_*` environment variables.
    pub fn from_env() -> Result<Self, PoolError> {
        Self::new(PoolConfig::from_env()?)
    }

    pub fn pool_size(&self) -> usize {
        self.shared.config.pool_size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Fill every slot and make sure each queue is running.
    pub fn start(&self) -> Result<(), PoolError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }

        let mut slots = lock(&self.shared.slots);
        self.fill(&mut slots)?;
        for slot in 0..slots.queues.len() {
            if !slots.queues[slot].is_running() {
                self.replace(&mut slots, slot)?;
            }
        }
        Ok(())
    }

    /// Ask every queue to stop after its current job.
    pub fn stop(&self) {
        for queue in self.all_queues() {
            queue.stop();
        }
        log_pool!(self.shared.id, "stopping");
    }

    /// Wait for every queue thread, including replaced ones, to exit.
    ///
    /// Returns the first join failure after joining everything.
    pub fn join(&self) -> Result<(), PoolError> {
        let mut first_error = None;
        for queue in self.all_queues() {
            if let Err(e) = queue.join() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(PoolError::Queue(e)),
            None => Ok(()),
        }
    }

    /// Refuse new work, stop every queue and wait for their threads.
    pub fn shutdown(&self) -> Result<(), PoolError> {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.stop();
        let joined = self.join();
        log_pool!(self.shared.id, "shutdown");
        joined
    }

    /// Refuse new work, let every queue run what it already holds, then wait
    /// for their threads.
    pub fn close(&self) -> Result<(), PoolError> {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        for queue in self.all_queues() {
            queue.drain();
        }
        let joined = self.join();
        log_pool!(self.shared.id, "closed");
        joined
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether any queue is currently running.
    pub fn is_running(&self) -> bool {
        lock(&self.shared.slots)
            .queues
            .iter()
            .any(WorkerQueue::is_running)
    }

    /// Register the callback fired whenever a queue stops or fails.
    pub fn on_queue_stop<F>(&self, callback: F)
    where
        F: Fn(&WorkerQueue) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_queue_stop
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Drain the errors recorded by every queue of this pool.
    pub fn errors(&self) -> Vec<QueueError> {
        std::iter::from_fn(|| self.shared.errors.pop()).collect()
    }

    /// Cancel a queued promise on whichever queue holds it.
    pub fn cancel(&self, id: &PromiseId) -> bool {
        self.all_queues().iter().any(|queue| queue.cancel(id))
    }

    /// Indices of the queues currently occupying the slots, in slot order.
    pub fn queue_indices(&self) -> Vec<usize> {
        lock(&self.shared.slots)
            .queues
            .iter()
            .map(WorkerQueue::index)
            .collect()
    }

    /// Handles to the queues currently occupying the slots.
    pub fn queues(&self) -> Vec<WorkerQueue> {
        lock(&self.shared.slots).queues.clone()
    }

    fn all_queues(&self) -> Vec<WorkerQueue> {
        let slots = lock(&self.shared.slots);
        slots
            .queues
            .iter()
            .chain(slots.retired.iter())
            .cloned()
            .collect()
    }

    fn spawn_queue(&self) -> Result<WorkerQueue, QueueError> {
        let pool = Arc::downgrade(&self.shared);
        let on_stop: OnStop = Arc::new(move |queue: &WorkerQueue| {
            if let Some(pool) = pool.upgrade() {
                pool.queue_stopped(queue);
            }
        });

        let queue = WorkerQueue::create(
            self.shared.config.queue_config(),
            Some(on_stop),
            Some(Arc::clone(&self.shared.errors)),
        );
        queue.start()?;
        Ok(queue)
    }

    fn fill(&self, slots: &mut Slots) -> Result<(), QueueError> {
        while slots.queues.len() < self.shared.config.pool_size {
            let queue = self.spawn_queue()?;
            log_pool!(
                self.shared.id,
                "queue_added",
                slot = slots.queues.len(),
                queue = queue.index()
            );
            slots.queues.push(queue);
        }
        Ok(())
    }

    fn replace(&self, slots: &mut Slots, slot: usize) -> Result<(), QueueError> {
        let fresh = self.spawn_queue()?;
        log_pool!(
            self.shared.id,
            "queue_replaced",
            slot,
            old = slots.queues[slot].index(),
            new = fresh.index()
        );

        let old = std::mem::replace(&mut slots.queues[slot], fresh);
        slots.retired.retain(WorkerQueue::has_live_thread);
        if old.has_live_thread() {
            slots.retired.push(old);
        }
        Ok(())
    }
}

impl PromiseRunner for WorkerPool {
    /// Dispatch to the next slot round-robin, replacing its queue first if it
    /// is no longer running.
    fn submit(&self, job: Arc<dyn Job>) -> Result<(), QueueError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::PoolShutdown);
        }

        let mut slots = lock(&self.shared.slots);
        self.fill(&mut slots)?;

        let slot = slots.cursor % slots.queues.len();
        slots.cursor = (slot + 1) % slots.queues.len();

        if !slots.queues[slot].is_running() {
            self.replace(&mut slots, slot)?;
        }

        match slots.queues[slot].submit(Arc::clone(&job)) {
            // The queue idled out between the check and the hand-off
            Err(QueueError::Closed { .. }) => {
                self.replace(&mut slots, slot)?;
                slots.queues[slot].submit(job)
            }
            other => other,
        }
    }

    fn start(&self) -> Result<(), QueueError> {
        WorkerPool::start(self).map_err(QueueError::from)
    }

    fn stop(&self) {
        WorkerPool::stop(self)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.shared.config.daemon {
            return;
        }
        if let Err(e) = self.close() {
            log_error!(e, pool = self.shared.id);
        }
    }
}

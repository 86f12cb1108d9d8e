use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::SegQueue;
use tracing::{debug, info, warn};

use pledge_api::errors::TaskError;
use pledge_api::sync::lock;
use pledge_api::task::{Value, WorkItem};

use super::handle::TaskHandle;
use super::worker::ProcessWorker;
use crate::config::ProcessPoolConfig;

struct Workers {
    slots: Vec<Arc<ProcessWorker>>,
    cursor: usize,
}

/// Pool of worker processes executing registered task functions.
///
/// Work items are dispatched round-robin. A worker found dead at dispatch
/// time is replaced in its slot; the items it was running fail with
/// `TaskError::WorkerExited` and the exit is recorded in [`errors`].
///
/// [`errors`]: ProcessPool::errors
pub struct ProcessPool {
    config: ProcessPoolConfig,
    workers: Mutex<Workers>,
    next_id: AtomicU64,
    errors: Arc<SegQueue<TaskError>>,
    shutting_down: AtomicBool,
}

impl fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let workers = lock(&self.workers);
        f.debug_struct("ProcessPool")
            .field("program", &self.config.program)
            .field("pool_size", &self.config.pool_size)
            .field("workers", &workers.slots)
            .field("cursor", &workers.cursor)
            .finish()
    }
}

impl ProcessPool {
    /// Spawn `pool_size` worker processes.
    pub fn new(config: ProcessPoolConfig) -> Result<Self, TaskError> {
        config.validate().map_err(|e| TaskError::InvalidConfig {
            message: e.to_string(),
        })?;

        let errors = Arc::new(SegQueue::new());
        let slots = (0..config.pool_size)
            .map(|slot| ProcessWorker::spawn(slot, &config, Arc::clone(&errors)).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            program = %config.program.display(),
            pool_size = config.pool_size,
            "Process pool started"
        );
        Ok(Self {
            config,
            workers: Mutex::new(Workers { slots, cursor: 0 }),
            next_id: AtomicU64::new(1),
            errors,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    pub fn config(&self) -> &ProcessPoolConfig {
        &self.config
    }

    /// Send `item` to the next worker.
    pub fn submit(&self, item: WorkItem) -> Result<TaskHandle, TaskError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(TaskError::PoolShutdown);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (slot, worker) = self.next_worker()?;

        let function = item.function.clone();
        let receiver = match worker.send(id, item.clone()) {
            Ok(receiver) => receiver,
            // Died between the liveness check and the write
            Err(TaskError::WorkerExited { .. }) => {
                warn!(slot, pid = worker.pid(), "Worker exited during dispatch, retrying");
                let worker = self.replace(slot)?;
                worker.send(id, item)?
            }
            Err(e) => return Err(e),
        };

        debug!(id, slot, function = %function, "Task submitted");
        Ok(TaskHandle::new(id, slot, function, receiver))
    }

    /// Submit `function(args...)` and wait for the result.
    pub fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, TaskError> {
        self.submit(WorkItem::new(function, args))?.wait()
    }

    /// Drain the worker exits recorded since the last call.
    pub fn errors(&self) -> Vec<TaskError> {
        std::iter::from_fn(|| self.errors.pop()).collect()
    }

    /// Process ids of the current workers, in slot order.
    pub fn worker_pids(&self) -> Vec<u32> {
        lock(&self.workers)
            .slots
            .iter()
            .map(|worker| worker.pid())
            .collect()
    }

    /// Requests sent and not answered yet, across all workers.
    pub fn in_flight(&self) -> usize {
        lock(&self.workers)
            .slots
            .iter()
            .map(|worker| worker.in_flight())
            .sum()
    }

    /// Refuse new work and stop every worker process.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let slots = std::mem::take(&mut lock(&self.workers).slots);
        for worker in &slots {
            worker.shutdown();
        }
        info!(program = %self.config.program.display(), "Process pool shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn next_worker(&self) -> Result<(usize, Arc<ProcessWorker>), TaskError> {
        let mut workers = lock(&self.workers);
        if workers.slots.is_empty() {
            return Err(TaskError::PoolShutdown);
        }

        let slot = workers.cursor % workers.slots.len();
        workers.cursor = (slot + 1) % workers.slots.len();

        if !workers.slots[slot].is_alive() {
            self.respawn(&mut workers, slot)?;
        }
        Ok((slot, Arc::clone(&workers.slots[slot])))
    }

    fn replace(&self, slot: usize) -> Result<Arc<ProcessWorker>, TaskError> {
        let mut workers = lock(&self.workers);
        if slot >= workers.slots.len() {
            return Err(TaskError::PoolShutdown);
        }
        if !workers.slots[slot].is_alive() {
            self.respawn(&mut workers, slot)?;
        }
        Ok(Arc::clone(&workers.slots[slot]))
    }

    fn respawn(&self, workers: &mut Workers, slot: usize) -> Result<(), TaskError> {
        let fresh = Arc::new(ProcessWorker::spawn(
            slot,
            &self.config,
            Arc::clone(&self.errors),
        )?);
        info!(
            slot,
            old_pid = workers.slots[slot].pid(),
            new_pid = fresh.pid(),
            "Replacing dead worker process"
        );

        let old = std::mem::replace(&mut workers.slots[slot], fresh);
        old.reap();
        Ok(())
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

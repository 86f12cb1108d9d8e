//! # Runner Contracts
//!
//! Runners accept promises and drive them to completion. Promises of any
//! result and error type travel to a runner as type-erased [`Job`]s.

use std::error::Error;
use std::sync::Arc;

use crate::errors::{QueueError, SharedError};
use crate::promise::{Promise, PromiseId};

/// Type-erased, executable unit of work.
pub trait Job: Send + Sync {
    fn id(&self) -> PromiseId;

    fn is_canceled(&self) -> bool;

    fn cancel(&self);

    /// Execute the job once. Errors are whatever escaped the complete phase.
    fn run(&self) -> Result<(), SharedError>;
}

/// Something that accepts promises and executes them.
pub trait PromiseRunner: Send + Sync {
    /// Hand a job over for execution.
    fn submit(&self, job: Arc<dyn Job>) -> Result<(), QueueError>;

    /// Start executing. Runners that start lazily may treat this as a no-op.
    fn start(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Ask the runner to stop after its current job.
    fn stop(&self) {}

    fn add_promise<T, E>(&self, promise: &Promise<T, E>) -> Result<(), QueueError>
    where
        Self: Sized,
        T: Clone + Send + 'static,
        E: Error + Send + Sync + 'static,
    {
        self.submit(promise.job())
    }

    /// Submit several promises in order, stopping at the first refusal.
    fn add_promises<'a, T, E, I>(&self, promises: I) -> Result<(), QueueError>
    where
        Self: Sized,
        I: IntoIterator<Item = &'a Promise<T, E>>,
        T: Clone + Send + 'static,
        E: Error + Send + Sync + 'static,
    {
        for promise in promises {
            self.add_promise(promise)?;
        }
        Ok(())
    }
}

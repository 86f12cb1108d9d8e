use std::fmt;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, TryRecvError};
use serde::de::DeserializeOwned;

use pledge_api::errors::TaskError;
use pledge_api::task::Value;
use pledge_api::Promise;

/// Pending result of a work item submitted to a `ProcessPool`.
pub struct TaskHandle {
    id: u64,
    worker: usize,
    function: String,
    receiver: Receiver<Result<Value, TaskError>>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("function", &self.function)
            .field("ready", &!self.receiver.is_empty())
            .finish()
    }
}

impl TaskHandle {
    pub(crate) fn new(
        id: u64,
        worker: usize,
        function: String,
        receiver: Receiver<Result<Value, TaskError>>,
    ) -> Self {
        Self {
            id,
            worker,
            function,
            receiver,
        }
    }

    /// Request id on the wire.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Slot of the worker process the item was sent to.
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Block until the worker answers.
    pub fn wait(self) -> Result<Value, TaskError> {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Err(self.lost()))
    }

    /// Block for at most `timeout`. On timeout the item keeps running and the
    /// handle can be waited on again.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Value, TaskError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(TaskError::Timeout { timeout }),
            Err(RecvTimeoutError::Disconnected) => Err(self.lost()),
        }
    }

    /// The result if it has already arrived.
    pub fn try_result(&self) -> Option<Result<Value, TaskError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.lost())),
        }
    }

    /// Block until the worker answers and decode the value as `R`.
    pub fn wait_as<R: DeserializeOwned>(self) -> Result<R, TaskError> {
        let function = self.function.clone();
        let value = self.wait()?;
        serde_json::from_value(value).map_err(|e| {
            TaskError::transport(format!("cannot decode result of {function}: {e}"))
        })
    }

    /// Promise that waits for this item when executed.
    pub fn into_promise(self) -> Promise<Value, TaskError> {
        Promise::new(move |resolve, _| {
            resolve.resolve(self.wait()?);
            Ok(())
        })
    }

    fn lost(&self) -> TaskError {
        TaskError::WorkerExited {
            worker: self.worker,
            reason: format!("no response for request {}", self.id),
        }
    }
}

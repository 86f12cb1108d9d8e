//! # Promise Error Types
//!
//! This module defines the error taxonomy shared by the promise core, the
//! thread-backed runners and the process boundary.
//!
//! ## Core Components
//!
//! - `PromiseError`: raised out of `reject`/`exec` for unhandled rejections and
//!   the optional re-raise after the complete phase
//! - `QueueError`: failures observed by a runner while driving promises
//! - `TaskError`: serializable failures crossing the process boundary
//! - `AllError`: failure of an aggregate built with `combinators::all`

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::promise::PromiseId;

/// Type-erased error shared between a queue's own error list and a pool-wide sink.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the promise state machine.
#[derive(Error, Debug)]
pub enum PromiseError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// `reject` was called on a promise without any catch callback.
    #[error("Unhandled promise rejection: {id}")]
    Unhandled {
        id: PromiseId,
        #[source]
        source: Arc<E>,
    },

    /// Re-raise of a recorded rejection, emitted after the complete phase
    /// when the promise was built with `raise_again`.
    #[error("Promise {id} was rejected")]
    Rejected {
        id: PromiseId,
        #[source]
        source: Arc<E>,
    },

    /// The starter was already consumed by an earlier `exec`.
    #[error("Promise {0} was already executed")]
    AlreadyExecuted(PromiseId),
}

impl<E> PromiseError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Id of the promise that produced this error.
    pub fn promise_id(&self) -> PromiseId {
        match self {
            Self::Unhandled { id, .. } | Self::Rejected { id, .. } => *id,
            Self::AlreadyExecuted(id) => *id,
        }
    }

    /// The original rejection value, if this error carries one.
    pub fn rejection(&self) -> Option<&E> {
        match self {
            Self::Unhandled { source, .. } | Self::Rejected { source, .. } => Some(source.as_ref()),
            Self::AlreadyExecuted(_) => None,
        }
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self, Self::Unhandled { .. })
    }
}

/// Errors observed by a runner (queue, pool, inline) while accepting or
/// driving promises.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Promise {promise} failed on queue {queue}: {source}")]
    PromiseFailed {
        queue: usize,
        promise: PromiseId,
        #[source]
        source: SharedError,
    },

    #[error("Promise {promise} panicked on queue {queue}: {message}")]
    Panicked {
        queue: usize,
        promise: PromiseId,
        message: String,
    },

    #[error("Inline execution of promise {promise} failed: {source}")]
    Inline {
        promise: PromiseId,
        #[source]
        source: SharedError,
    },

    #[error("Worker thread of queue {queue} panicked: {message}")]
    ThreadPanicked { queue: usize, message: String },

    #[error("Queue {queue} is closed")]
    Closed { queue: usize },

    #[error("Failed to spawn worker thread for queue {queue}: {reason}")]
    Spawn { queue: usize, reason: String },

    #[error("Cannot join queue {queue} from its own worker thread")]
    SelfJoin { queue: usize },

    #[error("Pool is shutting down")]
    PoolShutdown,
}

impl QueueError {
    /// Id of the promise involved in the failure, if any.
    pub fn promise_id(&self) -> Option<PromiseId> {
        match self {
            Self::PromiseFailed { promise, .. }
            | Self::Panicked { promise, .. }
            | Self::Inline { promise, .. } => Some(*promise),
            _ => None,
        }
    }

    /// Index of the queue involved in the failure, if any.
    pub fn queue_index(&self) -> Option<usize> {
        match self {
            Self::PromiseFailed { queue, .. }
            | Self::Panicked { queue, .. }
            | Self::ThreadPanicked { queue, .. }
            | Self::Closed { queue }
            | Self::Spawn { queue, .. }
            | Self::SelfJoin { queue } => Some(*queue),
            Self::Inline { .. } | Self::PoolShutdown => None,
        }
    }
}

/// Errors crossing the process boundary. Serializable so a worker process
/// can report them back on the wire.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("Unknown task function: {name}")]
    UnknownFunction { name: String },

    #[error("Task {function} expects {expected} arguments, got {actual}")]
    Arity {
        function: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid argument {index} for task {function}: {reason}")]
    Argument {
        function: String,
        index: usize,
        reason: String,
    },

    #[error("Task {function} failed: {message}")]
    Failed { function: String, message: String },

    #[error("Failed to encode result of task {function}: {reason}")]
    Encode { function: String, reason: String },

    #[error("Worker process {worker} exited: {reason}")]
    WorkerExited { worker: usize, reason: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Task timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Process pool is shut down")]
    PoolShutdown,

    #[error("Invalid process pool configuration: {message}")]
    InvalidConfig { message: String },
}

impl TaskError {
    pub fn transport(error: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: error.to_string(),
        }
    }
}

/// Failure of an aggregate promise built with `combinators::all`.
#[derive(Error, Debug, Clone)]
pub enum AllError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error("Promise {id} was rejected: {source}")]
    Rejected {
        id: PromiseId,
        #[source]
        source: Arc<E>,
    },

    #[error("{remaining} promises were dropped before completing")]
    Abandoned { remaining: usize },
}

//! # Pledge Promise API
//!
//! Pledge is a deferred-computation library built around promises with
//! chained success, failure and completion callbacks. This crate holds the
//! runner-independent half: the promise state machine and the contracts
//! runners implement. Thread and process runners live in the `pledge` crate.
//!
//! ## Core Components
//!
//! - **Promise**: single-fire state machine driven by a starter, with then /
//!   catch / complete callbacks and a bounded buffer of resolved values
//! - **Runners**: the [`PromiseRunner`] contract and the type-erased [`Job`]
//!   a runner executes
//! - **Container**: weak id to job registry used for cancellation
//! - **Combinators**: promises built from functions, iterators and other
//!   promises
//! - **Tasks**: registered functions and the JSON-line wire format used to
//!   run them in other processes
//!
//! ## Usage Example
//!
//! ```rust
//! use pledge_api::Promise;
//! use std::sync::{Arc, Mutex};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//!
//! let promise: Promise<&str, std::io::Error> = Promise::new(|resolve, _| {
//!     resolve.resolve("hello");
//!     Ok(())
//! });
//! promise.then(move |value| sink.lock().unwrap().push(*value));
//! promise.exec().unwrap();
//!
//! assert_eq!(*seen.lock().unwrap(), vec!["hello"]);
//! ```
//!
//! ## Module Organization
//!
//! - [`promise`]: the promise, its builder and settle handles
//! - [`buffer`]: bounded result buffer and the observable result type
//! - [`callbacks`]: callback signatures
//! - [`runner`]: runner and job traits
//! - [`container`]: cancellation registry
//! - [`combinators`]: `wrap`, `from_iter`, `all`
//! - [`task`]: task registry and process wire format
//! - [`errors`]: error types

extern crate self as pledge_api;

pub mod buffer;
pub mod callbacks;
pub mod combinators;
pub mod container;
pub mod errors;
pub mod promise;
pub mod runner;
pub mod sync;
pub mod task;

pub use buffer::{Resolved, DEFAULT_BUFFER_CAPACITY};
pub use container::PromiseContainer;
pub use errors::{AllError, PromiseError, QueueError, SharedError, TaskError};
pub use promise::{Promise, PromiseBuilder, PromiseId, PromiseState, Rejecter, Resolver, WeakPromise};
pub use runner::{Job, PromiseRunner};
pub use task::{TaskDef, TaskRegistry, WorkItem};

// Re-export the attribute macro
pub use pledge_api_derive::task;

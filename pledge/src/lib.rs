// Pledge Runtime
//
// Thread-backed and process-backed runners for the promises defined in
// pledge-api: worker queues, a round-robin worker pool, an inline runner
// and a pool of worker processes executing registered task functions.

pub mod config;
pub mod error;
pub mod inline;
pub mod logging;
pub mod pool;
pub mod process;
pub mod queue;

// Re-export commonly used types
pub use config::{ConfigError, PoolConfig, ProcessPoolConfig, QueueConfig};
pub use error::PoolError;
pub use inline::InlineRunner;
pub use pool::{QueueStopCallback, WorkerPool};
pub use process::{ProcessPool, TaskHandle};
pub use queue::{OnStop, QueueState, WorkerQueue};

pub use pledge_api::*;

use thiserror::Error;

use pledge_api::errors::QueueError;

use crate::config::ConfigError;

/// Errors related to the worker pool itself.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Worker pool is shutting down")]
    ShuttingDown,
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl From<ConfigError> for PoolError {
    fn from(error: ConfigError) -> Self {
        Self::InvalidConfig(error.to_string())
    }
}

impl From<PoolError> for QueueError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Queue(e) => e,
            PoolError::ShuttingDown | PoolError::InvalidConfig(_) => QueueError::PoolShutdown,
        }
    }
}

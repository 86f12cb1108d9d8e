use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MAX_IDLE: Duration = Duration::from_millis(500);
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_millis(10);
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "pledge-queue";
pub const DEFAULT_WORKER_PROGRAM: &str = "pledge-worker";

pub const ENV_THREAD_POOL_SIZE: &str = "PLEDGE_THREAD_POOL_SIZE";
pub const ENV_THREAD_IDLE_TIME: &str = "PLEDGE_THREAD_IDLE_TIME";
pub const ENV_THREAD_DAEMON: &str = "PLEDGE_THREAD_DAEMON";
pub const ENV_PROCESS_POOL_SIZE: &str = "PLEDGE_PROCESS_POOL_SIZE";

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Pool size must be at least 1")]
    ZeroPoolSize,
}

// --- Queue Configuration ---

/// Configuration of a single worker queue.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueConfig {
    /// Idle time after which the queue stops itself. Zero never stops.
    pub max_idle: Duration,

    /// How long one dequeue attempt waits for work.
    pub queue_timeout: Duration,

    /// Pause on the stop signal after each executed promise.
    pub interval: Duration,

    /// Prefix of the consumer thread name; the queue index is appended.
    pub thread_name_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl QueueConfig {
    /// Queue that never stops on its own.
    pub fn persistent() -> Self {
        Self {
            max_idle: Duration::ZERO,
            ..Self::default()
        }
    }
}

// --- Pool Configuration ---

/// Configuration of a `WorkerPool`.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Number of queue slots.
    pub pool_size: usize,

    /// Idle time after which each queue stops itself. Overrides `queue.max_idle`.
    pub max_idle: Duration,

    /// When false, dropping the pool stops and joins every queue thread.
    pub daemon: bool,

    /// Create and start every queue at construction instead of on first use.
    pub start_immediately: bool,

    /// Settings applied to every queue the pool creates.
    pub queue: QueueConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get(),
            max_idle: DEFAULT_MAX_IDLE,
            daemon: false,
            start_immediately: false,
            queue: QueueConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `PLEDGE_THREAD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_THREAD_POOL_SIZE) {
            config.pool_size = parse_size(ENV_THREAD_POOL_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_THREAD_IDLE_TIME) {
            config.max_idle = parse_seconds(ENV_THREAD_IDLE_TIME, &value)?;
        }
        if let Some(value) = lookup(ENV_THREAD_DAEMON) {
            config.daemon = parse_bool(ENV_THREAD_DAEMON, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        Ok(())
    }

    /// Queue configuration with the pool-level idle time applied.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_idle: self.max_idle,
            ..self.queue.clone()
        }
    }
}

// --- Process Pool Configuration ---

/// Configuration of a `ProcessPool`.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessPoolConfig {
    /// Number of worker processes.
    pub pool_size: usize,

    /// Worker executable. It must serve the task wire protocol on stdin/stdout.
    pub program: PathBuf,

    /// Extra arguments passed to every worker.
    pub args: Vec<String>,

    /// Extra environment variables set on every worker.
    pub env: Vec<(String, String)>,
}

impl Default for ProcessPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get(),
            program: PathBuf::from(DEFAULT_WORKER_PROGRAM),
            args: Vec::new(),
            env: Vec::new(),
        }
    }
}

impl ProcessPoolConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// `program` with the pool size taken from `PLEDGE_PROCESS_POOL_SIZE`.
    pub fn from_env(program: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::from_lookup(program, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(program: impl Into<PathBuf>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(program);
        if let Some(value) = lookup(ENV_PROCESS_POOL_SIZE) {
            config.pool_size = parse_size(ENV_PROCESS_POOL_SIZE, &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_size(key: &str, value: &str) -> Result<usize, ConfigError> {
    let size: usize = value.trim().parse().map_err(|e| invalid(key, value, e))?;
    if size == 0 {
        return Err(invalid(key, value, "must be at least 1"));
    }
    Ok(size)
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let seconds: f64 = value.trim().parse().map_err(|e| invalid(key, value, e))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| invalid(key, value, e))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(key, value, "expected true or false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn parses_seconds_as_float() {
        assert_eq!(
            parse_seconds(ENV_THREAD_IDLE_TIME, "0.25"),
            Ok(Duration::from_millis(250))
        );
        assert!(parse_seconds(ENV_THREAD_IDLE_TIME, "-1").is_err());
        assert!(parse_seconds(ENV_THREAD_IDLE_TIME, "soon").is_err());
    }

    #[test]
    fn process_pool_size_from_lookup() {
        let config =
            ProcessPoolConfig::from_lookup("worker", lookup(&[(ENV_PROCESS_POOL_SIZE, "3")]))
                .unwrap();
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.program, PathBuf::from("worker"));
    }
}

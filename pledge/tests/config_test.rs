// Integration tests for config types in pledge::config

use pledge::config::*;
use pledge::{PoolError, WorkerPool};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key: &str| vars.get(key).cloned()
}

#[test]
fn test_queue_config_defaults() {
    let config = QueueConfig::default();

    assert_eq!(config.max_idle, Duration::from_millis(500));
    assert_eq!(config.queue_timeout, Duration::from_millis(10));
    assert_eq!(config.interval, Duration::from_millis(10));
    assert_eq!(config.thread_name_prefix, "pledge-queue");
    assert_eq!(QueueConfig::persistent().max_idle, Duration::ZERO);
}

#[test]
fn test_pool_config_defaults() {
    let config = PoolConfig::default();

    assert_eq!(config.pool_size, num_cpus::get());
    assert_eq!(config.max_idle, DEFAULT_MAX_IDLE);
    assert!(!config.daemon);
    assert!(!config.start_immediately);
    assert_eq!(PoolConfig::from_lookup(env(&[])).unwrap(), config);
}

#[test]
fn test_pool_config_from_lookup() {
    let config = PoolConfig::from_lookup(env(&[
        (ENV_THREAD_POOL_SIZE, "3"),
        (ENV_THREAD_IDLE_TIME, "1.5"),
        (ENV_THREAD_DAEMON, "yes"),
    ]))
    .unwrap();

    assert_eq!(config.pool_size, 3);
    assert_eq!(config.max_idle, Duration::from_millis(1500));
    assert!(config.daemon);
    // The pool-level idle time wins over the queue template
    assert_eq!(config.queue_config().max_idle, Duration::from_millis(1500));
}

#[test]
fn test_invalid_values_are_rejected() {
    let error = PoolConfig::from_lookup(env(&[(ENV_THREAD_POOL_SIZE, "many")])).unwrap_err();
    assert!(matches!(
        &error,
        ConfigError::InvalidValue { key, value, .. }
            if key == ENV_THREAD_POOL_SIZE && value == "many"
    ));

    assert!(PoolConfig::from_lookup(env(&[(ENV_THREAD_POOL_SIZE, "0")])).is_err());
    assert!(PoolConfig::from_lookup(env(&[(ENV_THREAD_IDLE_TIME, "-2")])).is_err());
    assert!(PoolConfig::from_lookup(env(&[(ENV_THREAD_DAEMON, "maybe")])).is_err());
}

#[test]
fn test_zero_pool_size() {
    let config = PoolConfig::default().with_pool_size(0);
    assert_eq!(config.validate(), Err(ConfigError::ZeroPoolSize));
    assert!(matches!(
        WorkerPool::new(config),
        Err(PoolError::InvalidConfig(_))
    ));
}

#[test]
fn test_process_pool_config() {
    let config = ProcessPoolConfig::new("/usr/local/bin/worker")
        .with_pool_size(2)
        .arg("--quiet")
        .env("RUST_LOG", "warn");

    assert_eq!(config.program, PathBuf::from("/usr/local/bin/worker"));
    assert_eq!(config.pool_size, 2);
    assert_eq!(config.args, vec!["--quiet".to_string()]);
    assert_eq!(config.env, vec![("RUST_LOG".to_string(), "warn".to_string())]);

    assert_eq!(
        ProcessPoolConfig::default().program,
        PathBuf::from(DEFAULT_WORKER_PROGRAM)
    );
    assert!(ProcessPoolConfig::from_lookup("worker", env(&[(ENV_PROCESS_POOL_SIZE, "x")])).is_err());
}

#[test]
fn test_config_debug_format() {
    let config = PoolConfig::default();
    assert!(format!("{config:?}").contains("pool_size"));
}

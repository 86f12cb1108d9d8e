//! Worker process for `pledge::process::ProcessPool`.
//!
//! Serves the built-in task set on stdin/stdout. Logs go to stderr so they
//! never mix with responses.

use std::thread;
use std::time::Duration;

use anyhow::Context;
use pledge::logging::{self, LogConfig};
use pledge_api::task::{TaskRegistry, Value};
use pledge_api::task;
use tracing::Level;

/// Returns its argument unchanged.
#[task]
fn echo(value: Value) -> Result<Value, String> {
    Ok(value)
}

#[task]
fn add(a: i64, b: i64) -> Result<i64, String> {
    a.checked_add(b)
        .ok_or_else(|| format!("{a} + {b} overflows"))
}

#[task]
fn sum(values: Vec<f64>) -> Result<f64, String> {
    Ok(values.iter().sum())
}

#[task]
fn sleep_ms(millis: u64) -> Result<u64, String> {
    thread::sleep(Duration::from_millis(millis));
    Ok(millis)
}

/// Always rejects with `message`.
#[task]
fn fail(message: String) -> Result<(), String> {
    Err(message)
}

#[task]
fn pid() -> Result<u32, String> {
    Ok(std::process::id())
}

/// Terminates the worker without answering.
#[task]
fn exit(code: i32) -> Result<(), String> {
    std::process::exit(code)
}

#[task]
fn crash(message: String) -> Result<(), String> {
    panic!("{message}")
}

fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .with(ECHO_TASK)
        .with(ADD_TASK)
        .with(SUM_TASK)
        .with(SLEEP_MS_TASK)
        .with(FAIL_TASK)
        .with(PID_TASK)
        .with(EXIT_TASK)
        .with(CRASH_TASK)
}

fn main() -> anyhow::Result<()> {
    logging::init(LogConfig {
        level: Level::WARN,
        to_stderr: true,
        show_time: false,
        ..Default::default()
    });

    pledge::process::serve(&registry()).context("worker request stream failed")
}

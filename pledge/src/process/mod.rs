//! # Process Pool Module
//!
//! Runs registered task functions in a pool of worker processes.
//!
//! ## Key Concepts
//! - Work items: a function name plus JSON argument values; closures never
//!   cross the process boundary
//! - Workers: child processes serving the line-delimited JSON protocol of
//!   `pledge_api::task` on stdin/stdout, see [`serve`]
//! - Dispatch: round-robin across workers; a dead worker is replaced in its
//!   slot on the next dispatch and its in-flight items fail with
//!   `TaskError::WorkerExited`
//! - Results: each submission yields a [`TaskHandle`] that can be waited on
//!   or turned into a promise
//!
//! ## Writing a worker
//!
//! ```rust,no_run
//! use pledge_api::{task, TaskRegistry};
//!
//! #[task]
//! fn add(a: i64, b: i64) -> Result<i64, String> {
//!     Ok(a + b)
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let registry = TaskRegistry::new().with(ADD_TASK);
//!     pledge::process::serve(&registry)
//! }
//! ```

mod handle;
mod pool;
mod worker;

use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};

use pledge_api::errors::TaskError;
use pledge_api::task::{Outcome, Request, Response, TaskRegistry, Value, WorkItem};
use tracing::{debug, error, warn};

use crate::queue::panic_message;

pub use handle::TaskHandle;
pub use pool::ProcessPool;

/// Serve task requests from stdin, answering on stdout, until stdin closes.
pub fn serve(registry: &TaskRegistry) -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve_io(registry, stdin.lock(), stdout.lock())
}

/// Serve task requests read from `reader`, one response line per request.
///
/// Requests are handled one at a time, in order. A panicking task is reported
/// as `TaskError::Failed`; a line that is not a request is answered with
/// `TaskError::Transport` when it still carries an id and skipped otherwise.
pub fn serve_io<R, W>(registry: &TaskRegistry, reader: R, mut writer: W) -> io::Result<()>
where
    R: BufRead,
    W: Write,
{
    debug!(functions = ?registry.names(), "Serving tasks");

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => Response {
                id: request.id,
                outcome: execute(registry, request.item),
            },
            Err(e) => match request_id(&line) {
                Some(id) => {
                    warn!(id, error = %e, "Malformed request");
                    Response {
                        id,
                        outcome: Outcome::Rejected(TaskError::transport(e)),
                    }
                }
                None => {
                    error!(error = %e, "Discarding request without id");
                    continue;
                }
            },
        };

        serde_json::to_writer(&mut writer, &response)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }

    debug!("Request stream closed");
    Ok(())
}

fn execute(registry: &TaskRegistry, item: WorkItem) -> Outcome {
    let WorkItem { function, args } = item;
    let result = panic::catch_unwind(AssertUnwindSafe(|| registry.invoke(&function, args)))
        .unwrap_or_else(|payload| {
            Err(TaskError::Failed {
                function: function.clone(),
                message: format!("panicked: {}", panic_message(payload.as_ref())),
            })
        });

    if let Err(e) = &result {
        debug!(function = %function, error = %e, "Task rejected");
    }
    result.into()
}

fn request_id(line: &str) -> Option<u64> {
    serde_json::from_str::<Value>(line)
        .ok()?
        .get("id")?
        .as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pledge_api::task::{check_arity, TaskDef};
    use serde_json::json;

    fn negate(args: Vec<Value>) -> Result<Value, TaskError> {
        check_arity("negate", 1, &args)?;
        let n = args[0].as_i64().ok_or_else(|| TaskError::Argument {
            function: "negate".into(),
            index: 0,
            reason: "not an integer".into(),
        })?;
        Ok(json!(-n))
    }

    fn explode(_: Vec<Value>) -> Result<Value, TaskError> {
        panic!("kaboom")
    }

    fn responses(input: &str) -> Vec<Response> {
        let registry = TaskRegistry::new()
            .with(TaskDef::new("negate", negate))
            .with(TaskDef::new("explode", explode));
        let mut output = Vec::new();
        serve_io(&registry, input.as_bytes(), &mut output).unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn answers_each_request_in_order() {
        let out = responses(concat!(
            r#"{"id": 1, "function": "negate", "args": [5]}"#,
            "\n\n",
            r#"{"id": 2, "function": "missing", "args": []}"#,
            "\n",
        ));

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].outcome, Outcome::Resolved(json!(-5)));
        assert_eq!(
            out[1].outcome,
            Outcome::Rejected(TaskError::UnknownFunction {
                name: "missing".into()
            })
        );
    }

    #[test]
    fn panics_become_failures() {
        let out = responses("{\"id\": 9, \"function\": \"explode\"}\n");
        assert!(matches!(
            &out[0].outcome,
            Outcome::Rejected(TaskError::Failed { message, .. }) if message.contains("kaboom")
        ));
    }

    #[test]
    fn malformed_requests() {
        let out = responses("{\"id\": 4, \"function\": 12}\nnot json\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 4);
        assert!(matches!(out[0].outcome, Outcome::Rejected(TaskError::Transport { .. })));
    }
}

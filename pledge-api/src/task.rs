//! # Task Functions
//!
//! Work crossing a process boundary is described by a registered function
//! name plus JSON argument values. Each process owns a [`TaskRegistry`]
//! mapping those names to plain Rust functions; the `#[task]` attribute
//! generates the glue that decodes arguments and encodes the result.
//!
//! ## Wire format
//!
//! One JSON document per line in each direction:
//!
//! ```text
//! -> {"id": 7, "function": "add", "args": [1, 2]}
//! <- {"id": 7, "outcome": {"resolved": 3}}
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::TaskError;

pub use serde_json::Value;

/// Signature every registered task function is lowered to.
pub type TaskFn = fn(Vec<Value>) -> Result<Value, TaskError>;

/// A named task function, usually produced by `#[task]`.
#[derive(Clone, Copy)]
pub struct TaskDef {
    pub name: &'static str,
    pub func: TaskFn,
}

impl TaskDef {
    pub const fn new(name: &'static str, func: TaskFn) -> Self {
        Self { name, func }
    }
}

impl fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDef").field("name", &self.name).finish()
    }
}

/// Name to function lookup owned by each process.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    functions: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, replacing any previous one with the same name.
    pub fn register(&mut self, task: TaskDef) -> &mut Self {
        self.functions.insert(task.name.to_string(), task.func);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, task: TaskDef) -> Self {
        self.register(task);
        self
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Look up `function` and call it with `args`.
    pub fn invoke(&self, function: &str, args: Vec<Value>) -> Result<Value, TaskError> {
        let func = self.get(function).ok_or_else(|| TaskError::UnknownFunction {
            name: function.to_string(),
        })?;
        func(args)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// Function name plus argument values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl WorkItem {
    pub fn new(function: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }
}

/// A work item tagged with the id its response will carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub item: WorkItem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Resolved(Value),
    Rejected(TaskError),
}

impl From<Result<Value, TaskError>> for Outcome {
    fn from(result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(value) => Self::Resolved(value),
            Err(e) => Self::Rejected(e),
        }
    }
}

impl From<Outcome> for Result<Value, TaskError> {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Rejected(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub outcome: Outcome,
}

/// Used by `#[task]`: fail unless exactly `expected` arguments were passed.
pub fn check_arity(function: &str, expected: usize, args: &[Value]) -> Result<(), TaskError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(TaskError::Arity {
            function: function.to_string(),
            expected,
            actual: args.len(),
        })
    }
}

/// Used by `#[task]`: decode one argument.
pub fn decode_arg<A: DeserializeOwned>(
    function: &str,
    index: usize,
    value: Value,
) -> Result<A, TaskError> {
    serde_json::from_value(value).map_err(|e| TaskError::Argument {
        function: function.to_string(),
        index,
        reason: e.to_string(),
    })
}

/// Used by `#[task]`: encode the return value.
pub fn encode_result<R: Serialize>(function: &str, value: &R) -> Result<Value, TaskError> {
    serde_json::to_value(value).map_err(|e| TaskError::Encode {
        function: function.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn double(args: Vec<Value>) -> Result<Value, TaskError> {
        check_arity("double", 1, &args)?;
        let mut args = args.into_iter();
        let n: i64 = decode_arg("double", 0, args.next().unwrap_or(Value::Null))?;
        encode_result("double", &(n * 2))
    }

    #[test]
    fn request_wire_shape() {
        let request = Request {
            id: 3,
            item: WorkItem::new("double", vec![json!(4)]),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"id": 3, "function": "double", "args": [4]})
        );
    }

    #[test]
    fn rejected_outcome_wire_shape() {
        let response = Response {
            id: 1,
            outcome: Outcome::Rejected(TaskError::UnknownFunction {
                name: "nope".into(),
            }),
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"id": 1, "outcome": {"rejected": {"kind": "unknown_function", "name": "nope"}}})
        );
    }

    #[test]
    fn invoke_dispatches_by_name() {
        let registry = TaskRegistry::new().with(TaskDef::new("double", double));

        assert_eq!(registry.invoke("double", vec![json!(21)]), Ok(json!(42)));
        assert!(matches!(
            registry.invoke("double", vec![]),
            Err(TaskError::Arity { expected: 1, actual: 0, .. })
        ));
        assert!(matches!(
            registry.invoke("double", vec![json!("x")]),
            Err(TaskError::Argument { index: 0, .. })
        ));
        assert!(matches!(
            registry.invoke("triple", vec![]),
            Err(TaskError::UnknownFunction { .. })
        ));
    }
}

//! Units of deferred work.
//!
//! A [`Task`] is a named async function from JSON arguments to a JSON result.
//! Tasks are grouped into [`TaskModule`]s, registered with the runner under
//! `module.task` names.

use crate::error::TaskFault;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by a task invocation.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskFault>> + Send>>;

/// Type-erased task body.
pub type TaskFn = Arc<dyn Fn(Value) -> TaskFuture + Send + Sync>;

/// Default number of retries after a retryable failure.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// A named unit of deferred work.
#[derive(Clone)]
pub struct Task {
    name: String,
    handler: TaskFn,
    max_retries: usize,
    wrapped: bool,
}

impl Task {
    /// Create a task from an async function.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskFault>> + Send + 'static,
    {
        let handler: TaskFn = Arc::new(move |args| -> TaskFuture { Box::pin(f(args)) });
        Self {
            name: name.into(),
            handler,
            max_retries: DEFAULT_MAX_RETRIES,
            wrapped: false,
        }
    }

    pub(crate) fn from_parts(name: String, handler: TaskFn, max_retries: usize, wrapped: bool) -> Self {
        Self {
            name,
            handler,
            max_retries,
            wrapped,
        }
    }

    /// Set how many times a retryable failure is retried.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Retry budget.
    #[must_use]
    pub const fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Whether the task re-enters an application context when invoked.
    #[must_use]
    pub const fn is_wrapped(&self) -> bool {
        self.wrapped
    }

    pub(crate) fn handler(&self) -> TaskFn {
        Arc::clone(&self.handler)
    }

    #[must_use]
    pub(crate) fn renamed(mut self, name: String) -> Self {
        self.name = name;
        self
    }

    /// Invoke the task.
    pub fn call(&self, args: Value) -> TaskFuture {
        (self.handler)(args)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("wrapped", &self.wrapped)
            .finish_non_exhaustive()
    }
}

/// A named group of tasks.
pub trait TaskModule: Send + Sync {
    /// Module name; prefixes every task name.
    fn name(&self) -> &'static str;

    /// Tasks provided by the module.
    fn tasks(&self) -> Vec<Task>;
}

/// Decode task arguments.
///
/// # Errors
///
/// Returns [`TaskFault::InvalidArguments`] when `args` does not match `T`.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, TaskFault> {
    serde_json::from_value(args).map_err(|e| TaskFault::InvalidArguments(e.to_string()))
}

//! Error types for the task runner, broker and scheduler.

use keel_core::{ConfigError, ContextError};
use thiserror::Error;

/// Failure of one task execution.
///
/// The context wrapper passes these through unchanged; the runner decides
/// whether to retry.
#[derive(Error, Debug)]
pub enum TaskFault {
    /// Arguments could not be decoded. Never retried.
    #[error("invalid task arguments: {0}")]
    InvalidArguments(String),

    /// The task needed context state that is not available. Never retried.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The task panicked. Never retried.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task body failed.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskFault {
    /// Shorthand for a task body failure with a message.
    #[must_use]
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{message}"))
    }

    /// Whether the runner may retry after this fault.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Broker failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Could not reach the broker.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// A broker command failed.
    #[error("broker command failed: {0}")]
    Command(String),

    /// A message could not be encoded or decoded.
    #[error("broker message is malformed: {0}")]
    Serialization(String),

    /// The broker has been shut down.
    #[error("broker is closed")]
    Closed,
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors building or driving the task runner.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Two tasks were registered under one name.
    #[error("task `{0}` is registered twice")]
    DuplicateTask(String),

    /// A task name that no module registered.
    #[error("task `{0}` is not registered")]
    UnknownTask(String),

    /// Runner settings are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The broker failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors reading the periodic schedule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// A cron expression could not be parsed.
    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidCron {
        /// Offending expression
        expr: String,
        /// Why it was rejected
        reason: String,
    },

    /// A schedule entry is missing fields or has the wrong shape.
    #[error("invalid schedule entry `{name}`: {reason}")]
    InvalidEntry {
        /// Entry name
        name: String,
        /// Why it was rejected
        reason: String,
    },
}

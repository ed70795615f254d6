//! # Keel Runtime
//!
//! Deferred work for Keel: the task runner, the periodic scheduler and the
//! metrics both of them report.
//!
//! ## Core Components
//!
//! - **Task / TaskModule**: named async units of work and the modules that group them
//! - **wrap**: the decorator that re-enters the application context for every task run
//! - **Broker**: the queue tasks travel through (`RedisBroker` in production)
//! - **TaskRunner**: a pool of workers executing wrapped tasks, with retries
//! - **Beat**: queues tasks from `CELERYBEAT_SCHEDULE` as they come due
//!
//! ## Example
//!
//! ```ignore
//! use keel_runtime::{RedisBroker, TaskRunner};
//!
//! let broker = Arc::new(RedisBroker::from_config(instance.config()).await?);
//! let runner = TaskRunner::builder(instance.context(), broker)
//!     .module(&FeedTasks)
//!     .build()?;
//!
//! Arc::new(runner).run(&shutdown_tx).await;
//! ```

/// Task broker abstraction and the Redis broker
pub mod broker;

/// Error types for tasks, brokers and schedules
pub mod error;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Task runner and worker pool
pub mod runner;

/// Cron parsing and the periodic scheduler
pub mod schedule;

/// Task definitions
pub mod task;

/// Context re-entry for tasks
pub mod wrapper;

pub use broker::{Broker, RedisBroker, TaskEnvelope, TaskResult, TaskState};
pub use error::{BrokerError, RunnerError, ScheduleError, TaskFault};
pub use retry::RetryPolicy;
pub use runner::{Execution, TaskRunner, TaskRunnerBuilder};
pub use schedule::{Beat, CronSchedule, Schedule, ScheduleEntry};
pub use task::{Task, TaskModule, parse_args};
pub use wrapper::wrap;

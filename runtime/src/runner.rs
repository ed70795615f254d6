//! The task runner: registration, execution and the worker pool.
//!
//! A [`TaskRunner`] is built from the application context of an already
//! wired instance. Every task registered through the builder is wrapped with
//! [`crate::wrapper::wrap`], so it executes inside that context.
//!
//! Failure bookkeeping:
//! - retryable faults are queued again after `RetryPolicy::delay_for_attempt`
//!   until the task's `max_retries` is spent
//! - the final failure is logged at error level (and so reaches the fault
//!   notifier) and stored as the invocation's result
//!
//! # Example
//!
//! ```ignore
//! let runner = TaskRunner::builder(instance.context(), broker)
//!     .module(&FeedTasks)
//!     .build()?;
//!
//! let (shutdown_tx, _) = broadcast::channel(1);
//! Arc::new(runner).run(&shutdown_tx).await;
//! ```

use crate::broker::{Broker, TaskEnvelope, TaskResult};
use crate::error::{RunnerError, TaskFault};
use crate::metrics::TaskMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::task::{Task, TaskModule};
use crate::wrapper;
use futures::FutureExt;
use keel_core::AppContext;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default number of workers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default time a worker waits on the broker before polling again.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// What happened to one dequeued invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The task returned a value.
    Succeeded(Value),
    /// The task failed and attempt `attempt` was queued.
    RetryScheduled {
        /// Attempt number of the queued retry
        attempt: usize,
        /// Delay before the retry is queued
        delay: Duration,
    },
    /// The task failed for good.
    Failed(String),
    /// No task is registered under the envelope's name.
    Unregistered,
}

/// Executes registered tasks pulled from a broker.
pub struct TaskRunner {
    context: Arc<AppContext>,
    broker: Arc<dyn Broker>,
    tasks: HashMap<String, Task>,
    concurrency: usize,
    poll_timeout: Duration,
    retry: RetryPolicy,
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("instance", &self.context.instance_id())
            .field("tasks", &self.task_names())
            .field("concurrency", &self.concurrency)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

impl TaskRunner {
    /// Start building a runner for `context` pulling from `broker`.
    #[must_use]
    pub fn builder(context: Arc<AppContext>, broker: Arc<dyn Broker>) -> TaskRunnerBuilder {
        TaskRunnerBuilder {
            context,
            broker,
            tasks: Vec::new(),
            concurrency: None,
            poll_timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Look up a registered (wrapped) task.
    #[must_use]
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    /// Registered task names, sorted.
    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of workers [`TaskRunner::run`] starts.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// How long a worker blocks on the broker per poll.
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Context every task runs in.
    #[must_use]
    pub fn context(&self) -> Arc<AppContext> {
        Arc::clone(&self.context)
    }

    /// Queue an invocation of a registered task.
    ///
    /// # Errors
    ///
    /// - [`RunnerError::UnknownTask`] if `name` is not registered
    /// - [`RunnerError::Broker`] if the broker rejects the message
    pub async fn enqueue(&self, name: &str, args: Value) -> Result<Uuid, RunnerError> {
        if !self.tasks.contains_key(name) {
            return Err(RunnerError::UnknownTask(name.to_string()));
        }
        let envelope = TaskEnvelope::new(name, args);
        let id = envelope.id;
        self.broker.enqueue(envelope).await?;
        Ok(id)
    }

    /// Execute one dequeued invocation and do its bookkeeping.
    ///
    /// Once the task starts it runs to completion.
    pub async fn execute(&self, envelope: TaskEnvelope) -> Execution {
        let Some(task) = self.tasks.get(&envelope.task) else {
            tracing::error!(task = %envelope.task, id = %envelope.id, "Received unregistered task");
            self.store(TaskResult::failure(&envelope, "unregistered task")).await;
            return Execution::Unregistered;
        };

        let started = Instant::now();
        let args = envelope.args.clone();
        let outcome = AssertUnwindSafe(async move { task.call(args).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskFault::Panicked(panic_message(panic.as_ref()))));
        let elapsed = started.elapsed();

        match outcome {
            Ok(value) => {
                TaskMetrics::record_success(&envelope.task, elapsed);
                tracing::info!(
                    task = %envelope.task,
                    id = %envelope.id,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "Task succeeded"
                );
                self.store(TaskResult::success(&envelope, value.clone())).await;
                Execution::Succeeded(value)
            }
            Err(fault) if fault.is_retryable() && envelope.attempt < task.max_retries() => {
                let delay = self.retry.delay_for_attempt(envelope.attempt);
                let next = envelope.next_attempt();
                let attempt = next.attempt;
                TaskMetrics::record_retry(&envelope.task);
                tracing::warn!(
                    task = %envelope.task,
                    id = %envelope.id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %fault,
                    "Task failed, retry scheduled"
                );
                self.schedule_retry(next, delay);
                Execution::RetryScheduled { attempt, delay }
            }
            Err(fault) => {
                TaskMetrics::record_failure(&envelope.task, elapsed);
                tracing::error!(
                    task = %envelope.task,
                    id = %envelope.id,
                    attempts = envelope.attempt + 1,
                    error = %fault,
                    "Task failed"
                );
                self.store(TaskResult::failure(&envelope, &fault)).await;
                Execution::Failed(fault.to_string())
            }
        }
    }

    /// Run the worker pool until `shutdown` fires.
    ///
    /// Each worker pulls one invocation at a time; an invocation already
    /// executing when shutdown fires is finished first.
    pub async fn run(self: Arc<Self>, shutdown: &broadcast::Sender<()>) {
        tracing::info!(
            workers = self.concurrency,
            tasks = self.tasks.len(),
            "Task runner starting"
        );

        let workers: Vec<_> = (0..self.concurrency)
            .map(|worker| {
                let runner = Arc::clone(&self);
                let shutdown = shutdown.subscribe();
                tokio::spawn(async move { runner.worker_loop(worker, shutdown).await })
            })
            .collect();

        for handle in futures::future::join_all(workers).await {
            if let Err(e) = handle {
                tracing::error!(error = %e, "Worker terminated abnormally");
            }
        }

        tracing::info!("Task runner stopped");
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!(worker, "Worker started");
        let mut broker_failures = 0usize;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                polled = self.broker.dequeue(self.poll_timeout) => match polled {
                    Ok(Some(envelope)) => {
                        broker_failures = 0;
                        self.execute(envelope).await;
                    }
                    Ok(None) => broker_failures = 0,
                    Err(e) => {
                        TaskMetrics::record_broker_error();
                        let delay = self.retry.delay_for_attempt(broker_failures);
                        broker_failures += 1;
                        tracing::warn!(
                            worker,
                            error = %e,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Broker read failed, backing off"
                        );
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }

        tracing::debug!(worker, "Worker stopped");
    }

    fn schedule_retry(&self, envelope: TaskEnvelope, delay: Duration) {
        let broker = Arc::clone(&self.broker);
        let policy = self.retry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = retry_with_backoff(policy, || broker.enqueue(envelope.clone())).await {
                tracing::error!(
                    task = %envelope.task,
                    id = %envelope.id,
                    error = %e,
                    "Failed to queue task retry"
                );
            }
        });
    }

    async fn store(&self, result: TaskResult) {
        let id = result.id;
        if let Err(e) = self.broker.store_result(result).await {
            tracing::warn!(id = %id, error = %e, "Failed to store task result");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Builder for [`TaskRunner`].
pub struct TaskRunnerBuilder {
    context: Arc<AppContext>,
    broker: Arc<dyn Broker>,
    tasks: Vec<Task>,
    concurrency: Option<usize>,
    poll_timeout: Option<Duration>,
    retry: RetryPolicy,
}

impl TaskRunnerBuilder {
    /// Register every task of `module` as `module.task`.
    #[must_use]
    pub fn module(mut self, module: &dyn TaskModule) -> Self {
        let prefix = module.name();
        self.tasks.extend(module.tasks().into_iter().map(|task| {
            let name = format!("{prefix}.{}", task.name());
            task.renamed(name)
        }));
        self
    }

    /// Register a single task under its own name.
    #[must_use]
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Override the number of workers.
    #[must_use]
    pub const fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers);
        self
    }

    /// Override how long a worker waits on the broker per poll.
    #[must_use]
    pub const fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Override the backoff used for task retries and broker errors.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Wrap and register every task.
    ///
    /// Unset options come from `WORKER_CONCURRENCY` and
    /// `WORKER_POLL_TIMEOUT` (seconds).
    ///
    /// # Errors
    ///
    /// - [`RunnerError::DuplicateTask`] if two tasks share a name
    /// - [`RunnerError::Config`] if a runner setting is malformed
    pub fn build(self) -> Result<TaskRunner, RunnerError> {
        let config = self.context.config();

        let concurrency = match self.concurrency {
            Some(n) => n,
            None => config
                .get_u64("WORKER_CONCURRENCY")?
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(DEFAULT_CONCURRENCY),
        }
        .max(1);

        let poll_timeout = match self.poll_timeout {
            Some(t) => t,
            None => config
                .get_duration("WORKER_POLL_TIMEOUT")?
                .unwrap_or(DEFAULT_POLL_TIMEOUT),
        };

        let mut tasks = HashMap::with_capacity(self.tasks.len());
        for task in self.tasks {
            let name = task.name().to_string();
            if tasks.contains_key(&name) {
                return Err(RunnerError::DuplicateTask(name));
            }
            tasks.insert(name, wrapper::wrap(Arc::clone(&self.context), task));
        }

        tracing::debug!(tasks = tasks.len(), concurrency, "Task runner built");

        Ok(TaskRunner {
            context: self.context,
            broker: self.broker,
            tasks,
            concurrency,
            poll_timeout,
            retry: self.retry,
        })
    }
}

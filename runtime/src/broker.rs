//! Task broker abstraction and the Redis broker.
//!
//! Messages are JSON [`TaskEnvelope`]s pushed onto a Redis list with `LPUSH`
//! and popped by workers with `BRPOP`. Results are stored as JSON under
//! `keel:task-meta:{id}` with the configured expiry.
//!
//! # Example
//!
//! ```no_run
//! use keel_runtime::broker::RedisBroker;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedisBroker::connect("redis://127.0.0.1:6379", Duration::from_secs(300)).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::BrokerError;
use chrono::{DateTime, Utc};
use keel_core::Configuration;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Default queue name.
pub const DEFAULT_QUEUE: &str = "keel:tasks";

/// Default number of idle blocking connections kept by [`RedisBroker`].
pub const DEFAULT_MAX_CONNECTIONS: usize = 20;

/// A queued task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Invocation id; stable across retries.
    pub id: Uuid,
    /// Registered task name.
    pub task: String,
    /// JSON arguments.
    pub args: Value,
    /// Zero for the first run, incremented on each retry.
    pub attempt: usize,
    /// When this attempt was queued.
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// First attempt of an invocation.
    #[must_use]
    pub fn new(task: impl Into<String>, args: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            args,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The envelope for the next retry of this invocation.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Final state of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Completed successfully.
    Success,
    /// Failed after exhausting retries, or with a non-retryable fault.
    Failure,
}

/// Stored outcome of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Invocation id.
    pub id: Uuid,
    /// Task name.
    pub task: String,
    /// Final state.
    pub state: TaskState,
    /// Return value on success, error text on failure.
    pub result: Value,
    /// When the invocation finished.
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    /// Successful outcome.
    #[must_use]
    pub fn success(envelope: &TaskEnvelope, value: Value) -> Self {
        Self {
            id: envelope.id,
            task: envelope.task.clone(),
            state: TaskState::Success,
            result: value,
            finished_at: Utc::now(),
        }
    }

    /// Failed outcome.
    #[must_use]
    pub fn failure(envelope: &TaskEnvelope, error: impl std::fmt::Display) -> Self {
        Self {
            id: envelope.id,
            task: envelope.task.clone(),
            state: TaskState::Failure,
            result: Value::String(error.to_string()),
            finished_at: Utc::now(),
        }
    }
}

/// Queue of pending task invocations plus a result backend.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the runner can hold an
/// `Arc<dyn Broker>`.
pub trait Broker: Send + Sync + 'static {
    /// Queue an invocation.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] when the message cannot be queued.
    fn enqueue(
        &self,
        envelope: TaskEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Wait up to `timeout` for the next invocation.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] when the broker cannot be read.
    fn dequeue(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TaskEnvelope>, BrokerError>> + Send + '_>>;

    /// Record the outcome of an invocation.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] when the result cannot be stored.
    fn store_result(
        &self,
        result: TaskResult,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Fetch a stored outcome.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] when the backend cannot be read.
    fn fetch_result(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TaskResult>, BrokerError>> + Send + '_>>;
}

/// Redis list broker with a Redis result backend.
///
/// Queue writes and result storage go through a shared `ConnectionManager`.
/// `BRPOP` blocks its connection, so each waiting worker borrows a dedicated
/// connection from a small idle list instead.
pub struct RedisBroker {
    client: Client,
    queue_conn: ConnectionManager,
    result_conn: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    max_idle: usize,
    queue: String,
    result_ttl: Duration,
}

impl RedisBroker {
    /// Connect to one Redis used as both broker and result backend.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if Redis cannot be reached.
    pub async fn connect(url: &str, result_ttl: Duration) -> Result<Self, BrokerError> {
        Self::connect_split(url, url, result_ttl).await
    }

    /// Connect with separate broker and result backend locations.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if either Redis cannot be reached.
    pub async fn connect_split(
        broker_url: &str,
        result_url: &str,
        result_ttl: Duration,
    ) -> Result<Self, BrokerError> {
        let client = Client::open(broker_url)
            .map_err(|e| BrokerError::Connection(format!("Failed to create Redis client: {e}")))?;
        let queue_conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
            BrokerError::Connection(format!("Failed to create Redis connection manager: {e}"))
        })?;

        let result_conn = if result_url == broker_url {
            queue_conn.clone()
        } else {
            let result_client = Client::open(result_url).map_err(|e| {
                BrokerError::Connection(format!("Failed to create Redis result client: {e}"))
            })?;
            ConnectionManager::new(result_client).await.map_err(|e| {
                BrokerError::Connection(format!("Failed to connect to result backend: {e}"))
            })?
        };

        Ok(Self {
            client,
            queue_conn,
            result_conn,
            blocking: Mutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_CONNECTIONS,
            queue: DEFAULT_QUEUE.to_string(),
            result_ttl,
        })
    }

    /// Connect using `CELERY_BROKER_URL`, `CELERY_RESULT_BACKEND`,
    /// `CELERY_RESULT_EXPIRES` and `CELERY_REDIS_MAX_CONNECTIONS`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] when the broker URL is missing or
    /// unreachable.
    pub async fn from_config(config: &Configuration) -> Result<Self, BrokerError> {
        let broker_url = config
            .get_str("CELERY_BROKER_URL")
            .ok_or_else(|| BrokerError::Connection("CELERY_BROKER_URL is not set".into()))?;
        let result_url = config.get_str("CELERY_RESULT_BACKEND").unwrap_or(broker_url);
        let result_ttl = config
            .get_duration("CELERY_RESULT_EXPIRES")
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .unwrap_or(Duration::from_secs(300));
        let max_idle = config
            .get_u64("CELERY_REDIS_MAX_CONNECTIONS")
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let mut broker = Self::connect_split(broker_url, result_url, result_ttl).await?;
        broker.max_idle = max_idle.max(1);
        Ok(broker)
    }

    /// Use a different queue name.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    fn result_key(id: Uuid) -> String {
        format!("keel:task-meta:{id}")
    }

    async fn take_blocking(&self) -> Result<MultiplexedConnection, BrokerError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(BrokerError::from)
    }

    async fn return_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.blocking.lock().await;
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }
}

impl Broker for RedisBroker {
    fn enqueue(
        &self,
        envelope: TaskEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let payload = serde_json::to_string(&envelope)?;
            let mut conn = self.queue_conn.clone();
            let _: () = conn.lpush(&self.queue, payload).await?;

            tracing::debug!(
                task = %envelope.task,
                id = %envelope.id,
                attempt = envelope.attempt,
                "Task queued"
            );
            Ok(())
        })
    }

    fn dequeue(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TaskEnvelope>, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.take_blocking().await?;
            let timeout_secs = timeout.as_secs_f64().max(0.1);

            // A failed connection is dropped rather than returned to the idle list.
            let popped: Option<(String, String)> = conn.brpop(&self.queue, timeout_secs).await?;
            self.return_blocking(conn).await;

            match popped {
                Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
                None => Ok(None),
            }
        })
    }

    fn store_result(
        &self,
        result: TaskResult,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let payload = serde_json::to_string(&result)?;
            let mut conn = self.result_conn.clone();
            let ttl = self.result_ttl.as_secs().max(1);
            let _: () = conn.set_ex(Self::result_key(result.id), payload, ttl).await?;
            Ok(())
        })
    }

    fn fetch_result(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TaskResult>, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.result_conn.clone();
            let payload: Option<String> = conn.get(Self::result_key(id)).await?;
            payload
                .map(|p| serde_json::from_str(&p).map_err(BrokerError::from))
                .transpose()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_attempt_keeps_identity() {
        let first = TaskEnvelope::new("tasks.ping", json!({"n": 1}));
        let second = first.next_attempt();

        assert_eq!(second.id, first.id);
        assert_eq!(second.args, first.args);
        assert_eq!(second.attempt, 1);
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = TaskEnvelope::new("tasks.ping", json!([1, 2]));
        let wire: Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(wire["task"], "tasks.ping");
        assert_eq!(wire["args"], json!([1, 2]));
        assert_eq!(wire["attempt"], 0);
    }

    #[test]
    fn test_failure_result_carries_error_text() {
        let envelope = TaskEnvelope::new("tasks.ping", Value::Null);
        let result = TaskResult::failure(&envelope, "feed offline");

        assert_eq!(result.state, TaskState::Failure);
        assert_eq!(result.result, json!("feed offline"));
        assert_eq!(serde_json::to_value(result.state).unwrap(), json!("FAILURE"));
    }

    #[test]
    fn test_result_keys_are_namespaced() {
        let id = Uuid::nil();
        assert_eq!(
            RedisBroker::result_key(id),
            "keel:task-meta:00000000-0000-0000-0000-000000000000"
        );
    }
}

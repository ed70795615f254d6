//! In-memory task broker.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use keel_runtime::broker::{Broker, TaskEnvelope, TaskResult};
use keel_runtime::error::BrokerError;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// FIFO queue plus result map, for runner and beat tests.
///
/// Can be switched offline to exercise broker-error handling.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    queue: Arc<Mutex<VecDeque<TaskEnvelope>>>,
    results: Arc<Mutex<HashMap<Uuid, TaskResult>>>,
    queued: Arc<Notify>,
    offline: Arc<AtomicBool>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the pending queue, next to run first.
    #[must_use]
    pub fn pending(&self) -> Vec<TaskEnvelope> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }

    /// Number of pending invocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Take the next pending invocation without waiting.
    #[must_use]
    pub fn pop(&self) -> Option<TaskEnvelope> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Stored result for `id`.
    #[must_use]
    pub fn result(&self, id: Uuid) -> Option<TaskResult> {
        self.results.lock().unwrap().get(&id).cloned()
    }

    /// Make every operation fail with a connection error until turned back on.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Wait until at least `count` invocations are pending, or `timeout` passes.
    pub async fn wait_for_pending(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.queued.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    fn check_online(&self) -> Result<(), BrokerError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BrokerError::Connection("broker offline".into()))
        } else {
            Ok(())
        }
    }
}

impl Broker for InMemoryBroker {
    fn enqueue(
        &self,
        envelope: TaskEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_online()?;
            self.queue.lock().unwrap().push_back(envelope);
            self.queued.notify_waiters();
            Ok(())
        })
    }

    fn dequeue(
        &self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TaskEnvelope>, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_online()?;
            let waited = tokio::time::timeout(timeout, async {
                loop {
                    let notified = self.queued.notified();
                    if let Some(envelope) = self.pop() {
                        return envelope;
                    }
                    notified.await;
                }
            })
            .await;
            Ok(waited.ok())
        })
    }

    fn store_result(
        &self,
        result: TaskResult,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_online()?;
            self.results.lock().unwrap().insert(result.id, result);
            Ok(())
        })
    }

    fn fetch_result(
        &self,
        id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TaskResult>, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_online()?;
            Ok(self.result(id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fifo_order() {
        let broker = InMemoryBroker::new();
        broker.enqueue(TaskEnvelope::new("a.first", json!(null))).await.unwrap();
        broker.enqueue(TaskEnvelope::new("a.second", json!(null))).await.unwrap();

        let first = broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.task, "a.first");
        assert_eq!(broker.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_times_out_when_empty() {
        let broker = InMemoryBroker::new();
        assert!(broker.dequeue(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_broker_fails() {
        let broker = InMemoryBroker::new();
        broker.set_offline(true);
        let err = broker
            .enqueue(TaskEnvelope::new("a.task", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Connection(_)));
    }
}

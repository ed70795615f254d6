//! Mail transports that never touch the network.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use keel_core::mail::{MailError, MailMessage, MailTransport};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Records every message it is asked to send.
///
/// # Example
///
/// ```
/// use keel_testing::RecordingMailTransport;
///
/// let transport = RecordingMailTransport::new();
/// assert!(transport.sent().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingMailTransport {
    sent: Arc<Mutex<Vec<MailMessage>>>,
    delivered: Arc<Notify>,
}

impl RecordingMailTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of messages sent so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Wait until at least `count` messages were sent, or `timeout` passes.
    ///
    /// Returns whether the count was reached. Notifiers deliver on their own
    /// task, so tests wait here instead of sleeping.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.delivered.notified();
                if self.count() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

impl MailTransport for RecordingMailTransport {
    fn send(
        &self,
        message: MailMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), MailError>> + Send + '_>> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(message);
            self.delivered.notify_waiters();
            Ok(())
        })
    }
}

/// Fails every send, counting the attempts.
#[derive(Clone, Debug, Default)]
pub struct FailingMailTransport {
    attempts: Arc<AtomicUsize>,
    attempted: Arc<Notify>,
}

impl FailingMailTransport {
    /// Create a transport that always fails.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of send attempts so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` attempts were made, or `timeout` passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.attempted.notified();
                if self.attempts() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

impl MailTransport for FailingMailTransport {
    fn send(
        &self,
        _message: MailMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), MailError>> + Send + '_>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.attempted.notify_waiters();
            Err(MailError::Transport("connection refused".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> MailMessage {
        MailMessage {
            from: "ops@example.com".into(),
            to: vec!["ops@example.com".into()],
            subject: "hello".into(),
            body: "body".into(),
        }
    }

    #[tokio::test]
    async fn test_recording_transport_records() {
        let transport = RecordingMailTransport::new();
        transport.send(message()).await.unwrap();
        assert!(transport.wait_for(1, Duration::from_millis(10)).await);
        assert_eq!(transport.sent()[0].subject, "hello");
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let transport = RecordingMailTransport::new();
        assert!(!transport.wait_for(1, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_failing_transport_counts_attempts() {
        let transport = FailingMailTransport::new();
        assert!(transport.send(message()).await.is_err());
        assert_eq!(transport.attempts(), 1);
    }
}

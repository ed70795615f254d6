//! Mails operators about faults.
//!
//! The notifier subscribes to the [`FaultBus`] and sends one message per
//! event on its own task. Delivery is best effort: failures are logged at
//! warn level (never error, which would feed the bus again) and dropped.

use keel_core::config::Configuration;
use keel_core::error::ConfigError;
use keel_core::fault::{FaultBus, FaultEvent};
use keel_core::mail::{MailMessage, MailTransport};
use keel_runtime::metrics::FaultMetrics;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::mail::SmtpMailTransport;

/// Subject of every notification.
pub const NOTIFICATION_SUBJECT: &str = "[Exception handler] A 5xx was thrown";

/// Formats fault events and hands them to a mail transport.
#[derive(Clone)]
pub struct ExceptionNotifier {
    transport: Arc<dyn MailTransport>,
    from: String,
    to: Vec<String>,
}

impl std::fmt::Debug for ExceptionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionNotifier")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

impl ExceptionNotifier {
    /// Notifier mailing `operator` from `operator`.
    #[must_use]
    pub fn new(transport: Arc<dyn MailTransport>, operator: impl Into<String>) -> Self {
        let operator = operator.into();
        Self {
            transport,
            from: operator.clone(),
            to: vec![operator],
        }
    }

    /// Notifier addressed to the `MAIL_USERNAME` mailbox.
    ///
    /// Without an explicit `transport` an SMTP transport is built from the
    /// `MAIL_*` settings; when `MAIL_SERVER` is unset too, notifications are
    /// disabled and `None` is returned.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`] when a transport exists but `MAIL_USERNAME` is unset
    /// - [`ConfigError::Invalid`] for a malformed `MAIL_PORT`
    pub fn from_config(
        config: &Configuration,
        transport: Option<Arc<dyn MailTransport>>,
    ) -> Result<Option<Self>, ConfigError> {
        let transport = match transport {
            Some(transport) => transport,
            None => match SmtpMailTransport::from_config(config)? {
                Some(smtp) => Arc::new(smtp),
                None => return Ok(None),
            },
        };
        let operator = config.require_str("MAIL_USERNAME")?;
        Ok(Some(Self::new(transport, operator)))
    }

    /// The message sent for `event`.
    #[must_use]
    pub fn format(&self, event: &FaultEvent) -> MailMessage {
        let body = format!(
            "Time:               {}\nMessage type:       {}\n\n\nMessage:\n\n{}\n",
            event.occurred_at.format("%Y-%m-%d %H:%M:%S,%3f"),
            event.level,
            event.message,
        );

        MailMessage {
            from: self.from.clone(),
            to: self.to.clone(),
            subject: NOTIFICATION_SUBJECT.to_string(),
            body,
        }
    }

    /// Send one notification; returns whether the transport accepted it.
    pub async fn notify(&self, event: &FaultEvent) -> bool {
        match self.transport.send(self.format(event)).await {
            Ok(()) => {
                FaultMetrics::record_notification_sent();
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Fault notification could not be delivered");
                false
            }
        }
    }

    /// Subscribe to `bus` and start notifying in the background.
    ///
    /// The subscription exists when this returns, so faults published
    /// afterwards are never missed. Must be called from within a Tokio
    /// runtime.
    #[must_use]
    pub fn attach(self, bus: &FaultBus) -> NotifierHandle {
        let mut rx = bus.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        self.notify(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        FaultMetrics::record_notification_dropped(skipped);
                        tracing::warn!(skipped, "Fault notifier fell behind; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Fault notifier stopped");
        });

        NotifierHandle { task }
    }
}

/// The running notifier; stops it when dropped.
#[derive(Debug)]
pub struct NotifierHandle {
    task: JoinHandle<()>,
}

impl NotifierHandle {
    /// Whether the notifier task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for NotifierHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use keel_core::fault::ErrorRecord;
    use keel_testing::{FailingMailTransport, RecordingMailTransport, test_config};
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_format_matches_operator_mail_layout() {
        let notifier = ExceptionNotifier::new(Arc::new(RecordingMailTransport::new()), "ops@example.com");
        let event = FaultEvent::from_record(
            &ErrorRecord::new(500).with_message("database unavailable"),
            "GET",
            "/feeds",
        );

        let message = notifier.format(&event);
        assert_eq!(message.subject, "[Exception handler] A 5xx was thrown");
        assert_eq!(message.to, vec!["ops@example.com".to_string()]);
        assert!(message.body.starts_with("Time:               "));
        assert!(message.body.contains("\nMessage type:       ERROR\n\n\nMessage:\n\n"));
        assert!(message.body.contains("GET /feeds"));
    }

    #[tokio::test]
    async fn test_each_published_fault_is_mailed_once() {
        let transport = RecordingMailTransport::new();
        let bus = FaultBus::default();
        let _handle = ExceptionNotifier::new(Arc::new(transport.clone()), "ops@example.com").attach(&bus);

        bus.publish(FaultEvent::from_log("feeds", "refresh failed".into()));
        bus.publish(FaultEvent::from_log("feeds", "refresh failed again".into()));

        assert!(transport.wait_for(2, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.count(), 2);
    }

    #[tokio::test]
    async fn test_transport_failures_are_absorbed() {
        let transport = FailingMailTransport::new();
        let bus = FaultBus::default();
        let handle = ExceptionNotifier::new(Arc::new(transport.clone()), "ops@example.com").attach(&bus);

        bus.publish(FaultEvent::from_log("feeds", "one".into()));
        bus.publish(FaultEvent::from_log("feeds", "two".into()));

        assert!(transport.wait_for(2, Duration::from_secs(1)).await);
        assert!(!handle.is_finished());
    }

    #[test]
    fn test_from_config() {
        let disabled = ExceptionNotifier::from_config(&Configuration::from_map(BTreeMap::new()), None);
        assert!(disabled.unwrap().is_none());

        let explicit: Arc<dyn MailTransport> = Arc::new(RecordingMailTransport::new());
        let err = ExceptionNotifier::from_config(
            &Configuration::from_map(BTreeMap::new()),
            Some(explicit),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing(key) if key == "MAIL_USERNAME"));

        let notifier = ExceptionNotifier::from_config(&test_config(), None).unwrap().unwrap();
        assert_eq!(notifier.from, "ops@example.com");
    }
}

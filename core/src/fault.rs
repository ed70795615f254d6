//! Fault records and the fault event stream.
//!
//! [`ErrorRecord`] is the normalized form of a failure that drives response
//! rendering. Faults that operators should hear about are published as
//! [`FaultEvent`]s on a [`FaultBus`]; notifiers subscribe to the bus instead of
//! hooking into log formatting.
//!
//! Two producers feed the bus:
//! - the error pipeline, for every 5xx record it renders
//! - [`FaultCaptureLayer`], for every ERROR-level tracing event emitted
//!   anywhere else in the process

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Tracing target used by the error pipeline for the faults it publishes
/// itself. [`FaultCaptureLayer`] ignores this target so a fault is never
/// published twice.
pub const FAULT_TARGET: &str = "keel::fault";

/// Default capacity of the fault bus.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Severity of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational; rendered but not reported.
    Info,
    /// Unexpected but recovered.
    Warning,
    /// Needs operator attention.
    Error,
    /// Process-level failure.
    Critical,
}

impl Severity {
    /// Severity implied by an HTTP status.
    #[must_use]
    pub const fn for_status(status: u16) -> Self {
        if status >= 500 {
            Self::Error
        } else {
            Self::Info
        }
    }

    /// Whether operators are notified at this severity.
    #[must_use]
    pub fn is_reportable(self) -> bool {
        self >= Self::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Normalized failure produced when a handler fails or responds with 4xx/5xx.
///
/// Immutable once built; handlers receive it by reference.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    status: u16,
    code: Option<u16>,
    message: String,
    source: Option<Arc<anyhow::Error>>,
    level: Severity,
}

impl ErrorRecord {
    /// Record for a bare status.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            code: None,
            message: String::new(),
            source: None,
            level: Severity::for_status(status),
        }
    }

    /// Attach the explicit code carried by the originating error.
    #[must_use]
    pub const fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach the originating error.
    #[must_use]
    pub fn with_source(mut self, source: Arc<anyhow::Error>) -> Self {
        self.source = Some(source);
        self
    }

    /// Override the severity.
    #[must_use]
    pub const fn with_level(mut self, level: Severity) -> Self {
        self.level = level;
        self
    }

    /// Status of the response that carried the failure.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    /// Explicit code carried by the error, if any.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        self.code
    }

    /// Message, possibly empty.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Originating error, if any.
    #[must_use]
    pub fn source(&self) -> Option<&anyhow::Error> {
        self.source.as_deref()
    }

    /// Severity.
    #[must_use]
    pub const fn level(&self) -> Severity {
        self.level
    }

    /// Whether this is a 5xx record.
    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    /// One-line description for logs and notifications.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut text = format!("{} error", self.status);
        if !self.message.is_empty() {
            text.push_str(": ");
            text.push_str(&self.message);
        }
        if let Some(source) = &self.source {
            text.push_str(&format!(" (caused by: {source:#})"));
        }
        text
    }
}

/// Where a fault was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultOrigin {
    /// Rendered by the error pipeline for a request.
    Request {
        /// HTTP method
        method: String,
        /// Request path
        path: String,
    },
    /// Captured from an ERROR-level log event.
    Log {
        /// Tracing target of the event
        target: String,
    },
}

/// A fault that operators should be told about.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    /// When the fault was observed.
    pub occurred_at: DateTime<Utc>,
    /// Severity.
    pub level: Severity,
    /// Message body.
    pub message: String,
    /// HTTP status, for request faults.
    pub status: Option<u16>,
    /// Where the fault came from.
    pub origin: FaultOrigin,
}

impl FaultEvent {
    /// Fault for a rendered 5xx record.
    #[must_use]
    pub fn from_record(record: &ErrorRecord, method: &str, path: &str) -> Self {
        Self {
            occurred_at: Utc::now(),
            level: record.level(),
            message: format!("{method} {path}: {}", record.describe()),
            status: Some(record.status()),
            origin: FaultOrigin::Request {
                method: method.to_string(),
                path: path.to_string(),
            },
        }
    }

    /// Fault for an ERROR-level log event.
    #[must_use]
    pub fn from_log(target: &str, message: String) -> Self {
        Self {
            occurred_at: Utc::now(),
            level: Severity::Error,
            message,
            status: None,
            origin: FaultOrigin::Log {
                target: target.to_string(),
            },
        }
    }
}

/// Broadcast stream of fault events.
///
/// Publishing never blocks and never fails; with no subscribers the event is
/// dropped.
#[derive(Debug, Clone)]
pub struct FaultBus {
    tx: broadcast::Sender<FaultEvent>,
}

impl Default for FaultBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl FaultBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns the number of subscribers that will see it.
    pub fn publish(&self, event: FaultEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FaultEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// A tracing layer that publishes ERROR-level events to this bus.
    #[must_use]
    pub fn capture_layer(&self) -> FaultCaptureLayer {
        FaultCaptureLayer { bus: self.clone() }
    }
}

/// Tracing layer publishing every ERROR-level event to a [`FaultBus`].
///
/// Events with the [`FAULT_TARGET`] target are skipped; the error pipeline
/// publishes those directly.
#[derive(Debug, Clone)]
pub struct FaultCaptureLayer {
    bus: FaultBus,
}

impl<S: Subscriber> Layer<S> for FaultCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() != Level::ERROR || meta.target() == FAULT_TARGET {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.bus
            .publish(FaultEvent::from_log(meta.target(), visitor.finish()));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }
}

//! Prometheus metrics for faults, notifications and tasks.
//!
//! Recorders are free functions on zero-sized types so call sites read
//! `TaskMetrics::record_success(elapsed)`. Without an installed recorder the
//! calls are no-ops.
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! let body = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
    /// Failed to bind the scrape listener
    #[error("Failed to bind metrics server: {0}")]
    Bind(#[from] std::io::Error),
}

/// Prometheus recorder plus the address its scrape endpoint is served on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create an unstarted server for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Scrape address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe every metric and install the Prometheus recorder.
    ///
    /// A recorder installed earlier in the process (tests) is tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] when the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Recorder handle, once started.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Current metrics in Prometheus text format, once started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Error pipeline
    describe_counter!(
        "keel_faults_rendered_total",
        "Error responses rendered by the error pipeline, labelled by status"
    );
    describe_counter!(
        "keel_render_fallbacks_total",
        "Error responses that fell back to the hardcoded body"
    );

    // Notifier
    describe_counter!(
        "keel_notifications_sent_total",
        "Fault notifications delivered to the mail transport"
    );
    describe_counter!(
        "keel_notifications_dropped_total",
        "Fault notifications dropped after a transport failure or lag"
    );

    // Tasks
    describe_counter!("keel_tasks_succeeded_total", "Task invocations that succeeded");
    describe_counter!("keel_tasks_failed_total", "Task invocations that failed for good");
    describe_counter!("keel_tasks_retried_total", "Task invocations queued for a retry");
    describe_histogram!("keel_task_duration_seconds", "Time spent executing one task attempt");
    describe_counter!("keel_broker_errors_total", "Broker reads that failed");

    // Retry helper
    describe_counter!("keel_retry_attempts_total", "Retries performed by the backoff helper");
    describe_counter!("keel_retry_successes_total", "Operations that succeeded after a retry");
    describe_counter!("keel_retry_exhausted_total", "Operations that ran out of retries");
}

/// Error pipeline and notifier metrics.
pub struct FaultMetrics;

impl FaultMetrics {
    /// Record a rendered error response.
    pub fn record_rendered(status: u16) {
        counter!("keel_faults_rendered_total", "status" => status.to_string()).increment(1);
    }

    /// Record a render that fell back to the hardcoded body.
    pub fn record_fallback() {
        counter!("keel_render_fallbacks_total").increment(1);
    }

    /// Record a delivered notification.
    pub fn record_notification_sent() {
        counter!("keel_notifications_sent_total").increment(1);
    }

    /// Record dropped notifications.
    pub fn record_notification_dropped(count: u64) {
        counter!("keel_notifications_dropped_total").increment(count);
    }
}

/// Task runner metrics.
pub struct TaskMetrics;

impl TaskMetrics {
    /// Record a successful attempt.
    pub fn record_success(task: &str, duration: Duration) {
        counter!("keel_tasks_succeeded_total", "task" => task.to_string()).increment(1);
        histogram!("keel_task_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a final failure.
    pub fn record_failure(task: &str, duration: Duration) {
        counter!("keel_tasks_failed_total", "task" => task.to_string()).increment(1);
        histogram!("keel_task_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a retry being queued.
    pub fn record_retry(task: &str) {
        counter!("keel_tasks_retried_total", "task" => task.to_string()).increment(1);
    }

    /// Record a failed broker read.
    pub fn record_broker_error() {
        counter!("keel_broker_errors_total").increment(1);
    }
}

/// Backoff helper metrics.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("keel_retry_attempts_total").increment(1);
    }

    /// Record a success after retrying.
    pub fn record_success() {
        counter!("keel_retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("keel_retry_exhausted_total").increment(1);
    }
}

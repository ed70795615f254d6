//! The error pipeline: `ErrorRecord -> Response`.
//!
//! Two kinds of handler turn a record into a page:
//!
//! - **structural** handlers, registered per status (404 for unmatched paths,
//!   500 for panics, 502), render that status's template with that status
//! - the **generic** renderer, used for everything else, derives the code from
//!   the record's explicit code (500 when absent), renders that code's
//!   template (the 500 template when there is none) with the derived status
//!
//! Rendering never fails: a broken template escalates to a minimal hardcoded
//! 500 body. Reporting is separate from rendering: 5xx records are logged at
//! error level under [`FAULT_TARGET`] and published on the fault bus; the
//! notifier consumes the bus on its own task.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use keel_core::fault::{ErrorRecord, FAULT_TARGET, FaultBus, FaultEvent};
use keel_runtime::metrics::FaultMetrics;
use std::collections::BTreeMap;

use crate::templates::{ErrorTemplates, TemplateHelpers};

/// Body served when the error page itself cannot be rendered.
pub const FALLBACK_BODY: &str =
    "<!DOCTYPE html><html><body><h1>500 Internal Server Error</h1></body></html>";

const HTML: &str = "text/html; charset=utf-8";

/// Which handler a record maps to, and the status it renders with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// A structural handler for this status.
    Structural(u16),
    /// The generic renderer with this derived code.
    Generic(u16),
}

/// Maps error records to rendered responses.
#[derive(Debug, Clone)]
pub struct ErrorPipeline {
    templates: ErrorTemplates,
    structural: BTreeMap<u16, u16>,
    helpers: TemplateHelpers,
    bus: FaultBus,
}

impl ErrorPipeline {
    /// A pipeline with no structural handlers.
    #[must_use]
    pub fn new(templates: ErrorTemplates, bus: FaultBus) -> Self {
        Self {
            templates,
            structural: BTreeMap::new(),
            helpers: TemplateHelpers::default(),
            bus,
        }
    }

    /// Register a structural handler for `status` rendering `template`.
    pub fn register_structural(&mut self, status: u16, template: u16) {
        self.structural.insert(status, template);
    }

    /// Install the template helpers.
    pub fn set_helpers(&mut self, helpers: TemplateHelpers) {
        self.helpers = helpers;
    }

    /// Statuses with a structural handler.
    #[must_use]
    pub fn structural_statuses(&self) -> Vec<u16> {
        self.structural.keys().copied().collect()
    }

    /// The registered templates.
    #[must_use]
    pub const fn templates(&self) -> &ErrorTemplates {
        &self.templates
    }

    /// The bus 5xx records are published on.
    #[must_use]
    pub const fn fault_bus(&self) -> &FaultBus {
        &self.bus
    }

    /// Decide which handler renders `record`.
    ///
    /// Records carrying an explicit code always go to the generic renderer.
    #[must_use]
    pub fn map(&self, record: &ErrorRecord) -> Mapping {
        match record.code() {
            None if self.structural.contains_key(&record.status()) => {
                Mapping::Structural(record.status())
            }
            code => Mapping::Generic(code.unwrap_or(500)),
        }
    }

    /// Render `record` without reporting it.
    #[must_use]
    pub fn render(&self, record: &ErrorRecord) -> Response {
        match self.map(record) {
            Mapping::Structural(status) => self.render_structural(status),
            Mapping::Generic(_) => self.render_generic(record),
        }
    }

    /// The structural handler for `status`; statuses without one render the
    /// 500 page.
    #[must_use]
    pub fn render_structural(&self, status: u16) -> Response {
        let template = self.structural.get(&status).copied().unwrap_or(500);
        self.page(template, status)
    }

    /// The generic renderer.
    #[must_use]
    pub fn render_generic(&self, record: &ErrorRecord) -> Response {
        let code = record.code().unwrap_or(500);
        let template = if self.templates.contains(code) { code } else { 500 };
        self.page(template, code)
    }

    /// Report then render `record` for the request `method path`.
    #[must_use]
    pub fn handle(&self, record: &ErrorRecord, method: &str, path: &str) -> Response {
        self.report(record, method, path);
        self.render(record)
    }

    /// Log `record` and, for 5xx, publish it as a fault event.
    pub fn report(&self, record: &ErrorRecord, method: &str, path: &str) {
        FaultMetrics::record_rendered(record.status());

        if record.is_server_error() {
            tracing::error!(
                target: FAULT_TARGET,
                status = record.status(),
                method = %method,
                path = %path,
                error = %record.describe(),
                "Request failed"
            );
            self.bus.publish(FaultEvent::from_record(record, method, path));
        } else {
            tracing::debug!(
                status = record.status(),
                method = %method,
                path = %path,
                "Request rejected"
            );
        }
    }

    fn page(&self, template: u16, status: u16) -> Response {
        let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        match self.templates.render(template, status_code.as_u16(), &self.helpers) {
            Ok(body) => ([(header::CONTENT_TYPE, HTML)], body)
                .into_response()
                .with_status(status_code),
            Err(e) => {
                FaultMetrics::record_fallback();
                let message = format!("Error page for status {status} could not be rendered: {e}");
                tracing::error!(target: FAULT_TARGET, template, status, error = %e, "Error page rendering failed");
                self.bus.publish(FaultEvent::from_log(FAULT_TARGET, message));

                ([(header::CONTENT_TYPE, HTML)], FALLBACK_BODY)
                    .into_response()
                    .with_status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

trait WithStatus {
    fn with_status(self, status: StatusCode) -> Self;
}

impl WithStatus for Response {
    fn with_status(mut self, status: StatusCode) -> Self {
        *self.status_mut() = status;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pipeline() -> ErrorPipeline {
        let templates = ErrorTemplates::empty()
            .with_template(404, "missing {{ status }}")
            .with_template(500, "broken {{ status }}")
            .with_template(418, "teapot {{ status }}");
        let mut pipeline = ErrorPipeline::new(templates, FaultBus::default());
        pipeline.register_structural(404, 404);
        pipeline.register_structural(500, 500);
        pipeline.register_structural(502, 500);
        pipeline
    }

    async fn body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_mapping() {
        let pipeline = pipeline();
        assert_eq!(pipeline.map(&ErrorRecord::new(404)), Mapping::Structural(404));
        assert_eq!(pipeline.map(&ErrorRecord::new(500)), Mapping::Structural(500));
        assert_eq!(pipeline.map(&ErrorRecord::new(503)), Mapping::Generic(500));
        assert_eq!(
            pipeline.map(&ErrorRecord::new(500).with_code(418)),
            Mapping::Generic(418)
        );
    }

    #[tokio::test]
    async fn test_generic_uses_explicit_code_template() {
        let response = pipeline().render_generic(&ErrorRecord::new(500).with_code(418));
        assert_eq!(response.status().as_u16(), 418);
        assert_eq!(body(response).await, "teapot 418");
    }

    #[tokio::test]
    async fn test_generic_without_template_uses_500_page() {
        let response = pipeline().render_generic(&ErrorRecord::new(503).with_code(503));
        assert_eq!(response.status().as_u16(), 503);
        assert_eq!(body(response).await, "broken 503");
    }

    #[tokio::test]
    async fn test_broken_template_falls_back() {
        let templates = ErrorTemplates::empty()
            .with_template(404, "{{ nope }}")
            .with_template(500, "ok");
        let bus = FaultBus::default();
        let mut rx = bus.subscribe();
        let mut pipeline = ErrorPipeline::new(templates, bus);
        pipeline.register_structural(404, 404);

        let response = pipeline.render(&ErrorRecord::new(404));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(response).await, FALLBACK_BODY);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_only_server_errors_are_published() {
        let pipeline = pipeline();
        let mut rx = pipeline.fault_bus().subscribe();

        pipeline.report(&ErrorRecord::new(404), "GET", "/missing");
        assert!(rx.try_recv().is_err());

        pipeline.report(&ErrorRecord::new(500).with_message("boom"), "GET", "/explode");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.status, Some(500));
        assert!(event.message.contains("GET /explode"));
        assert!(rx.try_recv().is_err());
    }
}

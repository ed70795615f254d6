//! Error types for web handlers.
//!
//! Handlers return [`AppError`]; its `IntoResponse` impl does not render a
//! body. It places an [`ErrorRecord`] in the response extensions, and the
//! error pipeline layer turns that record into the final response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use keel_core::fault::ErrorRecord;
use std::fmt;
use std::sync::Arc;

/// Application error type for web handlers.
///
/// # Examples
///
/// ```ignore
/// async fn handler() -> Result<Json<Feed>, AppError> {
///     let feed = load_feed(id).await.map_err(|e| AppError::upstream("feed service").with_source(e))?;
///     Ok(Json(feed))
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code
    status: StatusCode,
    /// Explicit code carried by the error; drives template selection
    code: Option<u16>,
    /// Error message (for logs and notifications, never shown to clients)
    message: String,
    /// Internal error
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Error with `status` carrying `status` as its explicit code.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: Some(status.as_u16()),
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying error.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Override the explicit code.
    #[must_use]
    pub const fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Create a 401 Unauthorized error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// Create a 403 Forbidden error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    /// Create a 404 Not Found error.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{resource} with id {id} not found"))
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Create a 502 Bad Gateway error for a failed upstream call.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    /// Create a 503 Service Unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    /// Status of the response.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Explicit code, if any.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        self.code
    }

    /// Normalize into the record the pipeline consumes.
    #[must_use]
    pub fn into_record(self) -> ErrorRecord {
        let mut record = ErrorRecord::new(self.status.as_u16()).with_message(self.message);
        if let Some(code) = self.code {
            record = record.with_code(code);
        }
        if let Some(source) = self.source {
            record = record.with_source(Arc::new(source));
        }
        record
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status.as_u16(), self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let mut response = status.into_response();
        response.extensions_mut().insert(self.into_record());
        response
    }
}

/// Unexpected failures carry no explicit code and render as 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: None,
            message: "An internal error occurred".to_string(),
            source: Some(err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::bad_request("Invalid input");
        assert_eq!(err.to_string(), "[400] Invalid input");
    }

    #[test]
    fn test_not_found() {
        let err = AppError::not_found("User", "123");
        assert_eq!(err.to_string(), "[404] User with id 123 not found");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), Some(404));
    }

    #[test]
    fn test_anyhow_errors_have_no_code() {
        let err = AppError::from(anyhow::anyhow!("disk full"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), None);

        let record = err.into_record();
        assert_eq!(record.code(), None);
        assert!(record.describe().contains("disk full"));
    }

    #[test]
    fn test_into_response_carries_record() {
        let response = AppError::upstream("feed service down").into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let record = response.extensions().get::<ErrorRecord>().unwrap();
        assert_eq!(record.status(), 502);
        assert_eq!(record.code(), Some(502));
        assert_eq!(record.message(), "feed service down");
    }
}

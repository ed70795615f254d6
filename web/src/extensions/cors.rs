//! Cross-origin policy extension.

use axum::http::HeaderName;
use keel_core::config::Configuration;
use keel_core::error::ExtensionBindingFault;
use keel_core::extension::{Binding, Extension};
use tower_http::cors::{AllowMethods, AllowOrigin, CorsLayer};

/// Every origin allowed (mirrored back), credentials enabled, request headers
/// limited to `CORS_HEADERS`.
#[derive(Debug)]
pub struct CorsPolicy {
    binding: Binding,
    allowed_headers: Vec<HeaderName>,
}

impl Extension for CorsPolicy {
    const NAME: &'static str = "cors";

    fn binding(&self) -> &Binding {
        &self.binding
    }
}

impl CorsPolicy {
    /// Policy allowing the comma-separated `CORS_HEADERS` (default
    /// `Content-Type`).
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionBindingFault::Init`] for an invalid header name.
    pub fn from_config(config: &Configuration) -> Result<Self, ExtensionBindingFault> {
        let mut names = config.get_list("CORS_HEADERS");
        if names.is_empty() {
            names.push("Content-Type".to_string());
        }

        let allowed_headers = names
            .iter()
            .map(|name| {
                HeaderName::try_from(name.as_str()).map_err(|e| ExtensionBindingFault::Init {
                    extension: Self::NAME,
                    reason: format!("invalid CORS header {name:?}: {e}"),
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            binding: Binding::new(),
            allowed_headers,
        })
    }

    /// Request headers cross-origin callers may send.
    #[must_use]
    pub fn allowed_headers(&self) -> &[HeaderName] {
        &self.allowed_headers
    }

    /// The tower layer enforcing this policy.
    #[must_use]
    pub fn layer(&self) -> CorsLayer {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(self.allowed_headers.clone())
            .allow_credentials(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::{Method, Request, header},
        routing::get,
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_preflight_mirrors_origin_with_credentials() {
        let policy = CorsPolicy::from_config(&keel_testing::test_config()).unwrap();
        assert_eq!(policy.allowed_headers(), &[header::CONTENT_TYPE]);

        let app = Router::new()
            .route("/feeds", get(|| async { "[]" }))
            .layer(policy.layer());

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/feeds")
                    .header(header::ORIGIN, "https://reader.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://reader.example"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "content-type"
        );
    }
}

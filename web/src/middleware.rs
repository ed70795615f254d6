//! Tower layers wrapped around every instance's router.
//!
//! - [`ProxyFixLayer`]: trust `X-Forwarded-*` headers from a fixed number of proxies
//! - [`ContextLayer`]: run each request inside the instance's application context
//! - [`ErrorPipelineLayer`]: turn failed responses into rendered error pages
//!
//! # Example
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/health", get(health))
//!     .layer(ErrorPipelineLayer::new(pipeline))
//!     .layer(ContextLayer::new(ctx))
//!     .layer(ProxyFixLayer::new(1));
//! ```

use axum::{
    body::HttpBody,
    extract::Request,
    http::HeaderMap,
    response::Response,
};
use keel_core::context::{self, AppContext};
use keel_core::fault::ErrorRecord;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

use crate::pipeline::ErrorPipeline;

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

// ═══════════════════════════════════════════════════════════════════════
// Proxy fix
// ═══════════════════════════════════════════════════════════════════════

/// Client details recovered from proxy headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forwarded {
    /// Client address as seen by the outermost trusted proxy.
    pub client_ip: Option<IpAddr>,
    /// Original scheme (`http`/`https`).
    pub proto: Option<String>,
    /// Original `Host`.
    pub host: Option<String>,
}

impl Forwarded {
    /// Read the forwarding headers set by `num_proxies` trusted proxies.
    ///
    /// Each header is a comma-separated list with one entry appended per
    /// hop; the entry `num_proxies` from the end is the one the outermost
    /// trusted proxy wrote. Lists shorter than that are ignored as spoofed.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, num_proxies: usize) -> Self {
        Self {
            client_ip: trusted_entry(headers, "x-forwarded-for", num_proxies)
                .and_then(|ip| ip.parse().ok()),
            proto: trusted_entry(headers, "x-forwarded-proto", num_proxies),
            host: trusted_entry(headers, "x-forwarded-host", num_proxies),
        }
    }
}

fn trusted_entry(headers: &HeaderMap, name: &str, num_proxies: usize) -> Option<String> {
    if num_proxies == 0 {
        return None;
    }
    let entries: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();

    entries
        .len()
        .checked_sub(num_proxies)
        .map(|index| entries[index].to_string())
}

/// Layer recording [`Forwarded`] details in request extensions.
#[derive(Clone, Copy, Debug)]
pub struct ProxyFixLayer {
    num_proxies: usize,
}

impl ProxyFixLayer {
    /// Trust `num_proxies` reverse proxies in front of the service.
    #[must_use]
    pub const fn new(num_proxies: usize) -> Self {
        Self { num_proxies }
    }
}

impl<S> Layer<S> for ProxyFixLayer {
    type Service = ProxyFix<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ProxyFix {
            inner,
            num_proxies: self.num_proxies,
        }
    }
}

/// Service produced by [`ProxyFixLayer`].
#[derive(Clone, Debug)]
pub struct ProxyFix<S> {
    inner: S,
    num_proxies: usize,
}

impl<S> Service<Request> for ProxyFix<S>
where
    S: Service<Request>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let forwarded = Forwarded::from_headers(req.headers(), self.num_proxies);
        req.extensions_mut().insert(forwarded);
        self.inner.call(req)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Application context
// ═══════════════════════════════════════════════════════════════════════

/// Layer running requests inside an application context.
#[derive(Clone, Debug)]
pub struct ContextLayer {
    ctx: Arc<AppContext>,
}

impl ContextLayer {
    /// Scope requests to `ctx`.
    #[must_use]
    pub const fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

impl<S> Layer<S> for ContextLayer {
    type Service = ContextMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ContextMiddleware {
            inner,
            ctx: Arc::clone(&self.ctx),
        }
    }
}

/// Service produced by [`ContextLayer`].
#[derive(Clone, Debug)]
pub struct ContextMiddleware<S> {
    inner: S,
    ctx: Arc<AppContext>,
}

impl<S> Service<Request> for ContextMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let span = tracing::info_span!(
            "http_request",
            instance = %self.ctx.instance_id(),
            method = %req.method(),
            uri = %req.uri(),
        );
        let ctx = Arc::clone(&self.ctx);
        let fut = self.inner.call(req);

        Box::pin(context::scope(ctx, fut).instrument(span))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Error pipeline
// ═══════════════════════════════════════════════════════════════════════

/// Layer routing failed responses through an [`ErrorPipeline`].
///
/// A response is failed when it carries an [`ErrorRecord`] extension, or
/// when it has a 4xx/5xx status and an empty body. Error responses that
/// already carry a body are passed through; 5xx ones are still reported.
#[derive(Clone, Debug)]
pub struct ErrorPipelineLayer {
    pipeline: Arc<ErrorPipeline>,
}

impl ErrorPipelineLayer {
    /// Render failures with `pipeline`.
    #[must_use]
    pub const fn new(pipeline: Arc<ErrorPipeline>) -> Self {
        Self { pipeline }
    }
}

impl<S> Layer<S> for ErrorPipelineLayer {
    type Service = ErrorPipelineMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorPipelineMiddleware {
            inner,
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

/// Service produced by [`ErrorPipelineLayer`].
#[derive(Clone, Debug)]
pub struct ErrorPipelineMiddleware<S> {
    inner: S,
    pipeline: Arc<ErrorPipeline>,
}

impl<S> Service<Request> for ErrorPipelineMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let pipeline = Arc::clone(&self.pipeline);
        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut response = fut.await?;
            let status = response.status();

            let record = match response.extensions_mut().remove::<ErrorRecord>() {
                Some(record) => record,
                None if !(status.is_client_error() || status.is_server_error()) => {
                    return Ok(response);
                }
                None if response.body().size_hint().exact() != Some(0) => {
                    if status.is_server_error() {
                        pipeline.report(&ErrorRecord::new(status.as_u16()), method.as_str(), &path);
                    }
                    return Ok(response);
                }
                None => ErrorRecord::new(status.as_u16()).with_code(status.as_u16()),
            };

            let mut rendered = pipeline.handle(&record, method.as_str(), &path);
            carry_headers(&response, &mut rendered);
            Ok(rendered)
        })
    }
}

/// Keep headers the failing handler set (`Allow`, `Retry-After`,
/// `Set-Cookie`, ...) except the ones describing the replaced body.
fn carry_headers(from: &Response, to: &mut Response) {
    use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};

    for (name, value) in from.headers() {
        if name != CONTENT_TYPE && name != CONTENT_LENGTH {
            to.headers_mut().append(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::templates::ErrorTemplates;
    use axum::{Router, body::Body, http::StatusCode, routing::get};
    use keel_core::config::Configuration;
    use keel_core::extension::{ExtensionMap, InstanceId};
    use keel_core::fault::FaultBus;
    use tower::ServiceExt;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_forwarded_uses_entry_written_by_trusted_proxy() {
        let map = headers(&[
            ("x-forwarded-for", "6.6.6.6, 203.0.113.9"),
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "example.com"),
        ]);

        let forwarded = Forwarded::from_headers(&map, 1);
        assert_eq!(forwarded.client_ip, Some("203.0.113.9".parse().unwrap()));
        assert_eq!(forwarded.proto.as_deref(), Some("https"));
        assert_eq!(forwarded.host.as_deref(), Some("example.com"));

        let forwarded = Forwarded::from_headers(&map, 2);
        assert_eq!(forwarded.client_ip, Some("6.6.6.6".parse().unwrap()));
    }

    #[test]
    fn test_forwarded_ignores_short_chains() {
        let map = headers(&[("x-forwarded-for", "203.0.113.9")]);
        assert_eq!(Forwarded::from_headers(&map, 2), Forwarded::default());
        assert_eq!(Forwarded::from_headers(&map, 0), Forwarded::default());
    }

    #[tokio::test]
    async fn test_context_layer_scopes_requests() {
        let ctx = AppContext::new(
            InstanceId::new(),
            Arc::new(Configuration::default()),
            ExtensionMap::new(),
        );
        let expected = ctx.instance_id().to_string();

        let app = Router::new()
            .route(
                "/who",
                get(|| async {
                    context::current()
                        .map(|ctx| ctx.instance_id().to_string())
                        .unwrap_or_default()
                }),
            )
            .layer(ContextLayer::new(ctx));

        let response = app
            .oneshot(Request::builder().uri("/who").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, expected.as_bytes());
    }

    #[tokio::test]
    async fn test_pipeline_layer_renders_bare_statuses_and_keeps_bodies() {
        let templates = ErrorTemplates::empty()
            .with_template(404, "nf")
            .with_template(500, "ise {{ status }}");
        let pipeline = Arc::new(ErrorPipeline::new(templates, FaultBus::default()));

        let app = Router::new()
            .route("/bare", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
            .route(
                "/json",
                get(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "{\"field\":\"name\"}") }),
            )
            .layer(ErrorPipelineLayer::new(pipeline));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/bare").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "ise 503".as_bytes());

        let response = app
            .oneshot(Request::builder().uri("/json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "{\"field\":\"name\"}".as_bytes());
    }
}

//! End-to-end tests for the application factory.
//!
//! Every test builds a full instance against [`keel_testing`] doubles and
//! drives the layered router with `oneshot`. Nothing here needs Postgres or
//! Redis: both clients connect lazily.

#![allow(clippy::unwrap_used)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use keel_auth::AuthError;
use keel_core::config::ConfigSource;
use keel_core::error::ExtensionBindingFault;
use keel_core::fault::{FAULT_TARGET, FaultBus, FaultOrigin};
use keel_testing::{
    FailingMailTransport, InMemorySessionStore, RecordingMailTransport, StaticIdentityLookup,
    test_settings, test_source,
};
use keel_web::{
    AppCtx, AppError, AppFactory, BuildError, ErrorTemplates, LoginRequired, RouteNamespace,
    WiringStep,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tracing_subscriber::layer::SubscriberExt;

// ═══════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════

fn templates() -> ErrorTemplates {
    ErrorTemplates::empty()
        .with_template(404, "{{ site_name }}: nothing here ({{ status }})")
        .with_template(500, "{{ site_name }}: something broke ({{ status }})")
}

fn api() -> RouteNamespace {
    RouteNamespace::new("api", "/api")
        .route("login", "/login", post(|| async { "logged in" }))
        .route(
            "whoami",
            "/whoami",
            get(|LoginRequired(identity): LoginRequired| async move {
                identity.identifier().unwrap_or_default().to_string()
            }),
        )
        .route(
            "instance",
            "/instance",
            get(|AppCtx(ctx): AppCtx| async move { ctx.instance_id().to_string() }),
        )
}

fn failures() -> RouteNamespace {
    RouteNamespace::new("fail", "/fail")
        .route("panic", "/panic", get(explode))
        .route(
            "upstream",
            "/upstream",
            get(|| async { Err::<(), _>(AppError::upstream("feed service timed out")) }),
        )
        .route(
            "unavailable",
            "/unavailable",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        )
        .route(
            "validation",
            "/validation",
            get(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "title is required").into_response() }),
        )
}

#[allow(clippy::unused_async)]
async fn explode() -> &'static str {
    panic!("handler exploded")
}

fn factory(mail: &RecordingMailTransport) -> AppFactory {
    AppFactory::new()
        .config_source(test_source())
        .namespace(api())
        .namespace(failures())
        .templates(templates())
        .session_store(Arc::new(InMemorySessionStore::new()))
        .identity_lookup(Arc::new(StaticIdentityLookup::with_users(["alice"])))
        .mail_transport(Arc::new(mail.clone()))
}

async fn send(router: Router, request: Request<Body>) -> Response {
    router.oneshot(request).await.unwrap()
}

async fn get_path(router: Router, path: &str) -> Response {
    send(router, Request::get(path).body(Body::empty()).unwrap()).await
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
// Wiring
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_wiring_runs_every_step_in_order() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();

    assert_eq!(instance.wiring(), WiringStep::ORDER.as_slice());
    assert_eq!(instance.url_for("api.login"), Some("/api/login"));
    assert_eq!(instance.url_for("fail.panic"), Some("/fail/panic"));
    assert!(instance.notifier_enabled());
    assert_eq!(instance.pipeline().structural_statuses(), vec![404, 500, 502]);
    assert_eq!(instance.extensions().login().login_url(), Some("/api/login"));
}

#[tokio::test]
async fn test_requests_run_inside_the_instance_context() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();

    let response = get_path(instance.router(), "/api/instance").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, instance.id().to_string());
}

#[tokio::test]
async fn test_overrides_take_precedence() {
    let mail = RecordingMailTransport::new();
    let mut overrides = keel_core::config::Overrides::new();
    overrides.insert("SITE_NAME".to_string(), "Overridden".into());
    let instance = factory(&mail).build(Some(overrides)).unwrap();

    assert_eq!(instance.config().get_str("SITE_NAME"), Some("Overridden"));
    let body = body_text(get_path(instance.router(), "/nowhere").await).await;
    assert!(body.starts_with("Overridden:"));
}

// ═══════════════════════════════════════════════════════════════════════
// Error pipeline
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_unknown_route_renders_not_found_page() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();

    let response = get_path(instance.router(), "/nowhere").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/html; charset=utf-8"
    );
    assert_eq!(body_text(response).await, "Keel Test: nothing here (404)");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mail.count(), 0);
}

#[tokio::test]
async fn test_rendered_error_pages_are_compressed() {
    let mail = RecordingMailTransport::new();
    let page = "<html><body><h1>{{ site_name }}</h1><p>Nothing lives at this address ({{ status }}).</p></body></html>";
    let instance = factory(&mail)
        .templates(templates().with_template(404, page))
        .build(None)
        .unwrap();

    let request = Request::get("/unknown")
        .header(header::ACCEPT_ENCODING, "gzip")
        .body(Body::empty())
        .unwrap();
    let response = send(instance.router(), request).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers().get(header::CONTENT_ENCODING).unwrap(),
        "gzip"
    );
}

#[tokio::test]
async fn test_panic_renders_server_error_and_notifies_once() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();

    let response = get_path(instance.router(), "/fail/panic").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Keel Test: something broke (500)");

    assert!(mail.wait_for(1, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = mail.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "[Exception handler] A 5xx was thrown");
    assert_eq!(sent[0].to, vec!["ops@example.com".to_string()]);
    assert!(sent[0].body.contains("handler exploded"));
}

#[tokio::test]
async fn test_bad_gateway_uses_server_error_page() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();

    let response = get_path(instance.router(), "/fail/upstream").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_text(response).await, "Keel Test: something broke (502)");
    assert!(mail.wait_for(1, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_bare_error_status_without_template_uses_server_error_page() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();

    let response = get_path(instance.router(), "/fail/unavailable").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(response).await, "Keel Test: something broke (503)");
}

#[tokio::test]
async fn test_error_with_handler_body_passes_through() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();

    let response = get_path(instance.router(), "/fail/validation").await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_text(response).await, "title is required");
}

#[tokio::test]
async fn test_failing_mail_transport_does_not_change_the_response() {
    let failing = FailingMailTransport::new();
    let instance = factory(&RecordingMailTransport::new())
        .mail_transport(Arc::new(failing.clone()))
        .build(None)
        .unwrap();

    let response = get_path(instance.router(), "/fail/panic").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "Keel Test: something broke (500)");
    assert!(failing.wait_for(1, Duration::from_secs(1)).await);

    let response = get_path(instance.router(), "/fail/upstream").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(failing.wait_for(2, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_notifier_disabled_without_mail_server() {
    let mut settings = test_settings();
    settings.remove("MAIL_SERVER");
    let source = ConfigSource::new()
        .without_instance_file()
        .with_overrides(settings);

    let instance = AppFactory::new()
        .config_source(source)
        .namespace(api())
        .session_store(Arc::new(InMemorySessionStore::new()))
        .identity_lookup(Arc::new(StaticIdentityLookup::new()))
        .build(None)
        .unwrap();

    assert!(!instance.notifier_enabled());
    assert_eq!(instance.fault_bus().subscriber_count(), 0);
}

// ═══════════════════════════════════════════════════════════════════════
// Fault capture
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_error_logs_reach_the_bus_but_pipeline_logs_do_not() {
    let bus = FaultBus::default();
    let mut rx = bus.subscribe();
    let subscriber = tracing_subscriber::registry().with(bus.capture_layer());
    let _guard = tracing::subscriber::set_default(subscriber);

    tracing::error!(target: "feeds", "refresh failed");
    tracing::error!(target: FAULT_TARGET, "already published by the pipeline");
    tracing::warn!(target: "feeds", "slow refresh");

    let event = rx.try_recv().unwrap();
    assert!(event.message.contains("refresh failed"));
    assert!(matches!(event.origin, FaultOrigin::Log { ref target } if target == "feeds"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_log_faults_are_mailed_through_the_instance_bus() {
    let mail = RecordingMailTransport::new();
    let bus = FaultBus::default();
    let _instance = factory(&mail).fault_bus(bus.clone()).build(None).unwrap();

    let subscriber = tracing_subscriber::registry().with(bus.capture_layer());
    tracing::subscriber::with_default(subscriber, || {
        tracing::error!(target: "feeds", "refresh failed");
    });

    assert!(mail.wait_for(1, Duration::from_secs(1)).await);
    assert!(mail.sent()[0].body.contains("Message type:       ERROR"));
}

// ═══════════════════════════════════════════════════════════════════════
// Authentication, CSRF and CORS
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_anonymous_request_is_redirected_to_login() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();

    let response = get_path(instance.router(), "/api/whoami?tab=feeds").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "/api/login?next=%2Fapi%2Fwhoami%3Ftab%3Dfeeds"
    );
}

#[tokio::test]
async fn test_session_cookie_authenticates() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();
    let (session, _cookie) = instance.extensions().login().login("alice").await.unwrap();

    let request = Request::get("/api/whoami")
        .header(header::COOKIE, format!("session={}", session.session_id.as_str()))
        .body(Body::empty())
        .unwrap();
    let response = send(instance.router(), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "alice");
}

#[tokio::test]
async fn test_unsafe_request_requires_csrf_token() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();

    let response = send(
        instance.router(),
        Request::post("/api/login").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get_path(instance.router(), "/api/instance").await;
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let token = cookie
        .split(';')
        .next()
        .and_then(|pair| pair.strip_prefix("csrf_token="))
        .unwrap()
        .to_string();

    let request = Request::post("/api/login")
        .header(header::COOKIE, format!("csrf_token={token}"))
        .header("x-csrftoken", &token)
        .body(Body::empty())
        .unwrap();
    let response = send(instance.router(), request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "logged in");
}

#[tokio::test]
async fn test_cors_preflight_echoes_origin() {
    let mail = RecordingMailTransport::new();
    let instance = factory(&mail).build(None).unwrap();

    let request = Request::options("/api/login")
        .header(header::ORIGIN, "https://app.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = send(instance.router(), request).await;

    let headers = response.headers();
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "https://app.example.com"
    );
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
        "true"
    );
}

// ═══════════════════════════════════════════════════════════════════════
// Build failures
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_extensions_cannot_be_bound_to_two_instances() {
    let mail = RecordingMailTransport::new();
    let first = factory(&mail).build(None).unwrap();

    let err = factory(&mail)
        .extensions(first.extensions().clone())
        .build(None)
        .unwrap_err();
    assert!(matches!(
        err,
        BuildError::Extension(ExtensionBindingFault::BoundElsewhere { extension: "persistence", owner })
            if owner == first.id()
    ));
}

#[tokio::test]
async fn test_missing_secret_key_aborts_the_build() {
    let mut settings = test_settings();
    settings.remove("SECRET_KEY");
    let source = ConfigSource::new()
        .without_instance_file()
        .with_overrides(settings);

    let err = factory(&RecordingMailTransport::new())
        .config_source(source)
        .build(None)
        .unwrap_err();
    assert!(matches!(
        err,
        BuildError::Extension(ExtensionBindingFault::MissingConfig { extension: "csrf", .. })
    ));
}

#[tokio::test]
async fn test_identity_lookup_is_required() {
    let err = AppFactory::new()
        .config_source(test_source())
        .namespace(api())
        .session_store(Arc::new(InMemorySessionStore::new()))
        .mail_transport(Arc::new(RecordingMailTransport::new()))
        .build(None)
        .unwrap_err();
    assert!(matches!(err, BuildError::MissingIdentityLookup));
}

#[tokio::test]
async fn test_unknown_login_route_aborts_the_build() {
    let err = factory(&RecordingMailTransport::new())
        .login_endpoint("api.signin")
        .build(None)
        .unwrap_err();
    assert!(matches!(
        err,
        BuildError::Auth(AuthError::UnknownLoginRoute(ref endpoint)) if endpoint == "api.signin"
    ));
}

#[tokio::test]
async fn test_duplicate_namespaces_and_incomplete_templates_are_rejected() {
    let err = factory(&RecordingMailTransport::new())
        .namespace(RouteNamespace::new("api", "/v2"))
        .build(None)
        .unwrap_err();
    assert!(matches!(err, BuildError::DuplicateNamespace(ref name) if name == "api"));

    let err = factory(&RecordingMailTransport::new())
        .templates(ErrorTemplates::empty().with_template(404, "missing"))
        .build(None)
        .unwrap_err();
    assert!(matches!(err, BuildError::Template(_)));
}

//! The application factory.
//!
//! [`AppFactory::build`] is the only place that knows the full wiring order.
//! It runs these steps, in order, and records each on the instance:
//!
//! 1. proxy-address normalization
//! 2. error templates for 404, 500 and 502
//! 3. exception notifier subscription
//! 4. route namespaces
//! 5. structural error handlers (404 fallback, 500 for panics)
//! 6. template helpers
//! 7. extension binding
//! 8. authentication binding
//! 9. response compression (outermost layer, so rendered error pages are compressed too)
//!
//! Any failing step aborts the build; no partially wired instance escapes.
//!
//! # Example
//!
//! ```ignore
//! let instance = AppFactory::new()
//!     .namespace(RouteNamespace::new("api", "/api").route("login", "/login", post(login)))
//!     .identity_lookup(Arc::new(SqlIdentityLookup))
//!     .build(None)?;
//!
//! axum::serve(listener, instance.router()).await?;
//! ```

use axum::{
    Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::MethodRouter,
};
use keel_auth::{AuthError, AuthenticationBinder, IdentityLookup, LOGIN_ENDPOINT, RedisSessionStore, SessionStore};
use keel_core::config::{ConfigSource, Configuration, Overrides};
use keel_core::context::AppContext;
use keel_core::error::{ConfigError, ExtensionBindingFault};
use keel_core::extension::{ExtensionMap, InstanceId};
use keel_core::fault::{ErrorRecord, FaultBus};
use keel_core::mail::MailTransport;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;

use crate::extensions::{self, CsrfLayer, ExtensionRegistry};
use crate::middleware::{ContextLayer, ErrorPipelineLayer, ProxyFixLayer};
use crate::notifier::{ExceptionNotifier, NotifierHandle};
use crate::pipeline::ErrorPipeline;
use crate::templates::{ErrorTemplates, TemplateError, TemplateHelpers};

/// Proxies trusted when `PROXY_FIX_NUM_PROXIES` is unset.
pub const DEFAULT_NUM_PROXIES: usize = 1;

// ═══════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════

/// Reasons an application could not be built.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An extension could not be constructed or bound.
    #[error("extension binding failed: {0}")]
    Extension(#[from] ExtensionBindingFault),

    /// The identity lookup could not be attached.
    #[error("authentication binding failed: {0}")]
    Auth(#[from] AuthError),

    /// Required error templates are missing.
    #[error("error templates are incomplete: {0}")]
    Template(#[from] TemplateError),

    /// Two namespaces share a name.
    #[error("route namespace `{0}` is registered twice")]
    DuplicateNamespace(String),

    /// Two routes in one namespace share an endpoint name.
    #[error("endpoint `{0}` is registered twice")]
    DuplicateEndpoint(String),

    /// Two routes share a path.
    #[error("path `{0}` is routed twice")]
    DuplicatePath(String),

    /// No identity lookup was supplied.
    #[error("an identity lookup is required to bind authentication")]
    MissingIdentityLookup,

    /// The factory was called outside a Tokio runtime.
    #[error("the application factory must run inside a Tokio runtime")]
    NoRuntime,
}

// ═══════════════════════════════════════════════════════════════════════
// Wiring record
// ═══════════════════════════════════════════════════════════════════════

/// A completed wiring step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WiringStep {
    /// Proxy fix layer configured.
    ProxyFix,
    /// Error templates validated and registered.
    ErrorTemplates,
    /// Notifier subscribed to the fault bus (or disabled).
    ExceptionNotifier,
    /// Route namespaces mounted.
    RouteNamespaces,
    /// Fallback and panic handlers installed.
    StructuralHandlers,
    /// Template helpers registered.
    TemplateHelpers,
    /// Extensions bound to the instance.
    Extensions,
    /// Identity lookup attached to the login manager.
    Authentication,
    /// Response compression enabled.
    Compression,
}

impl WiringStep {
    /// The nine steps in the order every build runs them.
    pub const ORDER: [Self; 9] = [
        Self::ProxyFix,
        Self::ErrorTemplates,
        Self::ExceptionNotifier,
        Self::RouteNamespaces,
        Self::StructuralHandlers,
        Self::TemplateHelpers,
        Self::Extensions,
        Self::Authentication,
        Self::Compression,
    ];

    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProxyFix => "proxy_fix",
            Self::ErrorTemplates => "error_templates",
            Self::ExceptionNotifier => "exception_notifier",
            Self::RouteNamespaces => "route_namespaces",
            Self::StructuralHandlers => "structural_handlers",
            Self::TemplateHelpers => "template_helpers",
            Self::Extensions => "extensions",
            Self::Authentication => "authentication",
            Self::Compression => "compression",
        }
    }
}

impl fmt::Display for WiringStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Route namespaces
// ═══════════════════════════════════════════════════════════════════════

/// A named group of routes under a path prefix.
///
/// Endpoints are addressed as `{namespace}.{endpoint}`, e.g. `api.login`.
pub struct RouteNamespace {
    name: String,
    prefix: String,
    routes: Vec<(String, String, MethodRouter)>,
}

impl fmt::Debug for RouteNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteNamespace")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field(
                "endpoints",
                &self.routes.iter().map(|(e, p, _)| (e, p)).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl RouteNamespace {
    /// Empty namespace mounted at `prefix` (`""` or `"/"` for the root).
    #[must_use]
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            name: name.into(),
            prefix: prefix.trim_end_matches('/').to_string(),
            routes: Vec::new(),
        }
    }

    /// Add a route named `endpoint` at `path` relative to the prefix.
    #[must_use]
    pub fn route(mut self, endpoint: impl Into<String>, path: &str, handler: MethodRouter) -> Self {
        let path = format!("{}/{}", self.prefix, path.trim_start_matches('/'));
        self.routes.push((endpoint.into(), path, handler));
        self
    }

    /// Namespace name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full path of `endpoint`.
    #[must_use]
    pub fn url_for(&self, endpoint: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(name, _, _)| name == endpoint)
            .map(|(_, path, _)| path.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Application instance
// ═══════════════════════════════════════════════════════════════════════

/// A fully wired application.
///
/// Dropping the instance stops its exception notifier.
pub struct ApplicationInstance {
    id: InstanceId,
    context: Arc<AppContext>,
    router: Router,
    wiring: Vec<WiringStep>,
    endpoints: BTreeMap<String, String>,
    pipeline: Arc<ErrorPipeline>,
    fault_bus: FaultBus,
    extensions: ExtensionRegistry,
    notifier: Option<NotifierHandle>,
}

impl fmt::Debug for ApplicationInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationInstance")
            .field("id", &self.id)
            .field("wiring", &self.wiring)
            .field("endpoints", &self.endpoints)
            .field("notifier", &self.notifier.is_some())
            .finish_non_exhaustive()
    }
}

impl ApplicationInstance {
    /// Instance identity.
    #[must_use]
    pub const fn id(&self) -> InstanceId {
        self.id
    }

    /// Context shared by requests and tasks of this instance.
    #[must_use]
    pub fn context(&self) -> Arc<AppContext> {
        Arc::clone(&self.context)
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Configuration {
        self.context.config()
    }

    /// The fully layered router.
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Steps performed by the factory, in order.
    #[must_use]
    pub fn wiring(&self) -> &[WiringStep] {
        &self.wiring
    }

    /// Path of the named route `namespace.endpoint`.
    #[must_use]
    pub fn url_for(&self, endpoint: &str) -> Option<&str> {
        self.endpoints.get(endpoint).map(String::as_str)
    }

    /// The error pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &Arc<ErrorPipeline> {
        &self.pipeline
    }

    /// The fault bus; attach [`keel_core::fault::FaultCaptureLayer`] to the
    /// tracing subscriber to feed it error logs.
    #[must_use]
    pub const fn fault_bus(&self) -> &FaultBus {
        &self.fault_bus
    }

    /// The bound extensions.
    #[must_use]
    pub const fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    /// Whether fault notifications are mailed.
    #[must_use]
    pub const fn notifier_enabled(&self) -> bool {
        self.notifier.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Factory
// ═══════════════════════════════════════════════════════════════════════

/// Builds [`ApplicationInstance`]s.
pub struct AppFactory {
    source: ConfigSource,
    namespaces: Vec<RouteNamespace>,
    identity_lookup: Option<Arc<dyn IdentityLookup>>,
    login_endpoint: String,
    session_store: Option<Arc<dyn SessionStore>>,
    mail_transport: Option<Arc<dyn MailTransport>>,
    templates: ErrorTemplates,
    fault_bus: FaultBus,
    extensions: Option<ExtensionRegistry>,
}

impl Default for AppFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AppFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppFactory")
            .field("source", &self.source)
            .field("namespaces", &self.namespaces)
            .field("login_endpoint", &self.login_endpoint)
            .finish_non_exhaustive()
    }
}

impl AppFactory {
    /// Factory reading defaults, `instance/settings.toml` and the process
    /// environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            source: ConfigSource::from_env(),
            namespaces: Vec::new(),
            identity_lookup: None,
            login_endpoint: LOGIN_ENDPOINT.to_string(),
            session_store: None,
            mail_transport: None,
            templates: ErrorTemplates::default(),
            fault_bus: FaultBus::default(),
            extensions: None,
        }
    }

    /// Use a different configuration source.
    #[must_use]
    pub fn config_source(mut self, source: ConfigSource) -> Self {
        self.source = source;
        self
    }

    /// Mount a route namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: RouteNamespace) -> Self {
        self.namespaces.push(namespace);
        self
    }

    /// The user-model collaborator resolving session identifiers.
    #[must_use]
    pub fn identity_lookup(mut self, lookup: Arc<dyn IdentityLookup>) -> Self {
        self.identity_lookup = Some(lookup);
        self
    }

    /// Named route unauthenticated requests are sent to (default `api.login`).
    #[must_use]
    pub fn login_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.login_endpoint = endpoint.into();
        self
    }

    /// Session store; defaults to Redis at the cache location.
    #[must_use]
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    /// Mail transport for fault notifications; defaults to SMTP from `MAIL_*`.
    #[must_use]
    pub fn mail_transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.mail_transport = Some(transport);
        self
    }

    /// Error page templates.
    #[must_use]
    pub fn templates(mut self, templates: ErrorTemplates) -> Self {
        self.templates = templates;
        self
    }

    /// Fault bus shared with the tracing capture layer.
    #[must_use]
    pub fn fault_bus(mut self, bus: FaultBus) -> Self {
        self.fault_bus = bus;
        self
    }

    /// Bind these extension objects instead of constructing new ones.
    #[must_use]
    pub fn extensions(mut self, registry: ExtensionRegistry) -> Self {
        self.extensions = Some(registry);
        self
    }

    /// Wire a new application instance.
    ///
    /// # Errors
    ///
    /// Returns the [`BuildError`] of the first failing step.
    #[allow(clippy::too_many_lines)]
    pub fn build(self, overrides: Option<Overrides>) -> Result<ApplicationInstance, BuildError> {
        let source = match overrides {
            Some(overrides) => self.source.with_overrides(overrides),
            None => self.source,
        };
        let config = source.load()?;
        let instance = InstanceId::new();
        let mut wiring = Vec::with_capacity(WiringStep::ORDER.len());
        let mut record = |step: WiringStep| {
            tracing::debug!(instance = %instance, step = %step, "Wiring step complete");
            wiring.push(step);
        };

        // 1
        let num_proxies = match config.get_u64("PROXY_FIX_NUM_PROXIES")? {
            None => DEFAULT_NUM_PROXIES,
            Some(n) => usize::try_from(n).map_err(|_| ConfigError::Invalid {
                key: "PROXY_FIX_NUM_PROXIES".to_string(),
                reason: format!("{n} is out of range"),
            })?,
        };
        record(WiringStep::ProxyFix);

        // 2
        self.templates.validate()?;
        let mut pipeline = ErrorPipeline::new(self.templates, self.fault_bus.clone());
        pipeline.register_structural(404, 404);
        pipeline.register_structural(500, 500);
        pipeline.register_structural(502, 500);
        record(WiringStep::ErrorTemplates);

        // 3
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(BuildError::NoRuntime);
        }
        let notifier = ExceptionNotifier::from_config(&config, self.mail_transport)?
            .map(|notifier| notifier.attach(&self.fault_bus));
        if notifier.is_none() {
            tracing::warn!("MAIL_SERVER is not set; fault notifications are disabled");
        }
        record(WiringStep::ExceptionNotifier);

        // 4
        let mut router = Router::new();
        let mut endpoints = BTreeMap::new();
        let mut seen = Vec::new();
        for namespace in self.namespaces {
            if seen.contains(&namespace.name) {
                return Err(BuildError::DuplicateNamespace(namespace.name));
            }
            for (endpoint, path, handler) in namespace.routes {
                let key = format!("{}.{endpoint}", namespace.name);
                if endpoints.values().any(|existing| *existing == path) {
                    return Err(BuildError::DuplicatePath(path));
                }
                if endpoints.insert(key.clone(), path.clone()).is_some() {
                    return Err(BuildError::DuplicateEndpoint(key));
                }
                router = router.route(&path, handler);
            }
            seen.push(namespace.name);
        }
        record(WiringStep::RouteNamespaces);

        // 5
        let router = router.fallback(not_found);
        record(WiringStep::StructuralHandlers);

        // 6
        pipeline.set_helpers(TemplateHelpers::from_config(&config));
        record(WiringStep::TemplateHelpers);

        // 7
        let registry = match self.extensions {
            Some(registry) => registry,
            None => {
                let store = match self.session_store {
                    Some(store) => store,
                    None => default_session_store(&config)?,
                };
                ExtensionRegistry::from_config(&config, store)?
            }
        };
        let mut bound = ExtensionMap::new();
        registry.bind(instance, &mut bound)?;
        record(WiringStep::Extensions);

        // 8
        let lookup = self.identity_lookup.ok_or(BuildError::MissingIdentityLookup)?;
        AuthenticationBinder::new(lookup)
            .with_login_endpoint(self.login_endpoint)
            .attach(registry.login(), |endpoint| endpoints.get(endpoint).cloned())?;
        record(WiringStep::Authentication);

        // 9
        record(WiringStep::Compression);

        let context = AppContext::new(instance, Arc::new(config), bound);
        let pipeline = Arc::new(pipeline);
        let router = router
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(CsrfLayer::new(Arc::clone(registry.csrf())))
            .layer(ErrorPipelineLayer::new(Arc::clone(&pipeline)))
            .layer(registry.cors().layer())
            .layer(ContextLayer::new(Arc::clone(&context)))
            .layer(ProxyFixLayer::new(num_proxies))
            .layer(CompressionLayer::new());

        tracing::info!(
            instance = %instance,
            routes = endpoints.len(),
            notifier = notifier.is_some(),
            "Application built"
        );

        Ok(ApplicationInstance {
            id: instance,
            context,
            router,
            wiring,
            endpoints,
            pipeline,
            fault_bus: self.fault_bus,
            extensions: registry,
            notifier,
        })
    }
}

fn default_session_store(config: &Configuration) -> Result<Arc<dyn SessionStore>, BuildError> {
    let url = extensions::cache::redis_url(config)?;
    let prefix = config.get_string("CACHE_KEY_PREFIX").unwrap_or_default();
    Ok(Arc::new(RedisSessionStore::new(&url)?.with_prefix(prefix)))
}

async fn not_found() -> Response {
    let mut response = StatusCode::NOT_FOUND.into_response();
    response.extensions_mut().insert(ErrorRecord::new(404));
    response
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");

    let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
    response
        .extensions_mut()
        .insert(ErrorRecord::new(500).with_message(format!("handler panicked: {detail}")));
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[test]
    fn test_namespace_paths() {
        let api = RouteNamespace::new("api", "/api/")
            .route("login", "/login", get(|| async { "" }))
            .route("feeds", "feeds", get(|| async { "" }));
        assert_eq!(api.url_for("login"), Some("/api/login"));
        assert_eq!(api.url_for("feeds"), Some("/api/feeds"));
        assert_eq!(api.url_for("missing"), None);

        let root = RouteNamespace::new("site", "/").route("home", "/", get(|| async { "" }));
        assert_eq!(root.url_for("home"), Some("/"));
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let err = AppFactory::new()
            .config_source(keel_testing::test_source())
            .session_store(Arc::new(keel_testing::InMemorySessionStore::new()))
            .build(None)
            .unwrap_err();
        assert!(matches!(err, BuildError::NoRuntime));
    }

    #[test]
    fn test_panic_payloads_become_records() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let record = response.extensions().get::<ErrorRecord>().unwrap();
        assert_eq!(record.code(), None);
        assert!(record.message().contains("boom"));

        let response = panic_response(Box::new(String::from("owned")));
        let record = response.extensions().get::<ErrorRecord>().unwrap();
        assert!(record.message().contains("owned"));
    }
}

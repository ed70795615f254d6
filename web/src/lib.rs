//! HTTP composition root for Keel.
//!
//! This crate turns a resolved configuration into a running Axum router:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ CompressionLayer                             │  ← outermost
//! │  ProxyFixLayer        X-Forwarded-* → peer   │
//! │   ContextLayer        task-local AppContext  │
//! │    CorsLayer                                 │
//! │     ErrorPipelineLayer  ErrorRecord → page   │
//! │      CsrfLayer                               │
//! │       CatchPanicLayer   panic → 500 record   │
//! │        routes + 404 fallback                 │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Handlers never render error bodies. They return [`AppError`] (or a bare
//! error status) and the [`ErrorPipeline`] picks the template, logs the
//! failure and publishes 5xx faults to the [`FaultBus`](keel_core::fault::FaultBus),
//! where the [`ExceptionNotifier`] mails them to operators.
//!
//! # Example
//!
//! ```ignore
//! use keel_web::{AppFactory, RouteNamespace};
//! use axum::routing::post;
//!
//! let instance = AppFactory::new()
//!     .namespace(RouteNamespace::new("api", "/api").route("login", "/login", post(login)))
//!     .identity_lookup(lookup)
//!     .build(None)?;
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, instance.router()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extensions;
pub mod extractors;
pub mod factory;
pub mod mail;
pub mod middleware;
pub mod notifier;
pub mod pipeline;
pub mod templates;

// Re-export key types for convenience
pub use error::AppError;
pub use extensions::{Cache, CorsPolicy, CsrfGuard, CsrfToken, ExtensionRegistry, Persistence};
pub use extractors::{AppCtx, ClientIp, CurrentIdentity, LoginRequired};
pub use factory::{AppFactory, ApplicationInstance, BuildError, RouteNamespace, WiringStep};
pub use mail::SmtpMailTransport;
pub use middleware::{ContextLayer, ErrorPipelineLayer, Forwarded, ProxyFixLayer};
pub use notifier::{ExceptionNotifier, NotifierHandle};
pub use pipeline::ErrorPipeline;
pub use templates::{ErrorTemplates, TemplateError, TemplateHelpers};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

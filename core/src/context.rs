//! The application context shared by requests and deferred tasks.
//!
//! Request handling and task execution both run inside [`scope`], so code
//! deep in either path can reach configuration and extensions through
//! [`current`] without threading them through every call.
//!
//! Re-entering the context that is already active is a no-op: nested
//! [`scope`] calls with the same context run the future directly instead of
//! stacking a second scope.

use crate::config::Configuration;
use crate::error::ContextError;
use crate::extension::{Extension, ExtensionMap, InstanceId};
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT: Arc<AppContext>;
}

/// Configuration and extension bindings of one application instance.
#[derive(Debug)]
pub struct AppContext {
    instance: InstanceId,
    config: Arc<Configuration>,
    extensions: ExtensionMap,
}

impl AppContext {
    /// Freeze an instance's configuration and bindings into a context.
    #[must_use]
    pub fn new(
        instance: InstanceId,
        config: Arc<Configuration>,
        extensions: ExtensionMap,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance,
            config,
            extensions,
        })
    }

    /// Instance this context belongs to.
    #[must_use]
    pub const fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Shared handle to the configuration.
    #[must_use]
    pub fn config_arc(&self) -> Arc<Configuration> {
        Arc::clone(&self.config)
    }

    /// Bound extensions.
    #[must_use]
    pub const fn extensions(&self) -> &ExtensionMap {
        &self.extensions
    }

    /// Look up a bound extension.
    #[must_use]
    pub fn extension<E: Extension>(&self) -> Option<Arc<E>> {
        self.extensions.get::<E>()
    }

    /// Look up a bound extension that must be present.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::MissingExtension`] if `E` is not bound.
    pub fn require<E: Extension>(&self) -> Result<Arc<E>, ContextError> {
        self.extension::<E>()
            .ok_or(ContextError::MissingExtension(E::NAME))
    }
}

/// Run `future` with `ctx` as the active context.
///
/// If `ctx` is already active for the calling task the future runs as-is.
pub async fn scope<F>(ctx: Arc<AppContext>, future: F) -> F::Output
where
    F: Future,
{
    if is_active(&ctx) {
        future.await
    } else {
        CURRENT.scope(ctx, future).await
    }
}

/// Run a synchronous closure with `ctx` as the active context.
pub fn sync_scope<R>(ctx: Arc<AppContext>, f: impl FnOnce() -> R) -> R {
    if is_active(&ctx) {
        f()
    } else {
        CURRENT.sync_scope(ctx, f)
    }
}

/// Whether `ctx` is the context active for the calling task.
#[must_use]
pub fn is_active(ctx: &Arc<AppContext>) -> bool {
    CURRENT
        .try_with(|active| Arc::ptr_eq(active, ctx))
        .unwrap_or(false)
}

/// The active context, if any.
#[must_use]
pub fn current() -> Option<Arc<AppContext>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// The active context.
///
/// # Errors
///
/// Returns [`ContextError::NoActiveContext`] outside of a request or task.
pub fn require_current() -> Result<Arc<AppContext>, ContextError> {
    current().ok_or(ContextError::NoActiveContext)
}

//! Stateful integrations bound to one application instance.
//!
//! | Extension | Type | Required settings |
//! |-----------|------|-------------------|
//! | persistence | [`Persistence`] | `SQLALCHEMY_DATABASE_URI` |
//! | cache | [`Cache`] | `CACHE_REDIS_URL` or `CACHE_REDIS_HOST` |
//! | login manager | [`keel_auth::LoginManager`] | none |
//! | CSRF guard | [`CsrfGuard`] | `SECRET_KEY` |
//! | cross-origin policy | [`CorsPolicy`] | none |

pub mod cache;
pub mod cors;
pub mod csrf;
pub mod persistence;

pub use cache::{Cache, CacheError};
pub use cors::CorsPolicy;
pub use csrf::{CSRF_COOKIE, CSRF_HEADER, CsrfGuard, CsrfLayer, CsrfToken};
pub use persistence::Persistence;

use keel_auth::{LoginManager, SessionStore};
use keel_core::config::Configuration;
use keel_core::error::ExtensionBindingFault;
use keel_core::extension::{Extension, ExtensionMap, InstanceId};
use std::sync::Arc;

/// The extension singletons of one application instance.
///
/// Cloning shares the same objects; binding the clone to a second instance
/// fails with [`ExtensionBindingFault::BoundElsewhere`].
#[derive(Debug, Clone)]
pub struct ExtensionRegistry {
    persistence: Arc<Persistence>,
    cache: Arc<Cache>,
    login: Arc<LoginManager>,
    csrf: Arc<CsrfGuard>,
    cors: Arc<CorsPolicy>,
}

impl ExtensionRegistry {
    /// Construct every extension from `config`. Nothing connects yet.
    ///
    /// # Errors
    ///
    /// Returns the first [`ExtensionBindingFault`] raised by an extension's
    /// construction, typically [`ExtensionBindingFault::MissingConfig`].
    pub fn from_config(
        config: &Configuration,
        session_store: Arc<dyn SessionStore>,
    ) -> Result<Self, ExtensionBindingFault> {
        let login = LoginManager::from_config(config, session_store).map_err(|e| {
            ExtensionBindingFault::Init {
                extension: LoginManager::NAME,
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            persistence: Arc::new(Persistence::from_config(config)?),
            cache: Arc::new(Cache::from_config(config)?),
            login: Arc::new(login),
            csrf: Arc::new(CsrfGuard::from_config(config)?),
            cors: Arc::new(CorsPolicy::from_config(config)?),
        })
    }

    /// Bind every extension to `instance`, storing them in `map`.
    ///
    /// All checks run before anything is claimed, so a failure leaves both
    /// `map` and the extension objects exactly as they were.
    ///
    /// # Errors
    ///
    /// - [`ExtensionBindingFault::AlreadyBound`] if `map` or an object is already bound to `instance`
    /// - [`ExtensionBindingFault::BoundElsewhere`] if an object belongs to another instance
    pub fn bind(&self, instance: InstanceId, map: &mut ExtensionMap) -> Result<(), ExtensionBindingFault> {
        precheck(&self.persistence, instance, map)?;
        precheck(&self.cache, instance, map)?;
        precheck(&self.login, instance, map)?;
        precheck(&self.csrf, instance, map)?;
        precheck(&self.cors, instance, map)?;

        map.bind(instance, Arc::clone(&self.persistence))?;
        map.bind(instance, Arc::clone(&self.cache))?;
        map.bind(instance, Arc::clone(&self.login))?;
        map.bind(instance, Arc::clone(&self.csrf))?;
        map.bind(instance, Arc::clone(&self.cors))?;

        tracing::info!(instance = %instance, extensions = ?map.names(), "Extensions bound");
        Ok(())
    }

    /// The persistence client.
    #[must_use]
    pub const fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    /// The cache client.
    #[must_use]
    pub const fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// The login manager.
    #[must_use]
    pub const fn login(&self) -> &Arc<LoginManager> {
        &self.login
    }

    /// The CSRF guard.
    #[must_use]
    pub const fn csrf(&self) -> &Arc<CsrfGuard> {
        &self.csrf
    }

    /// The cross-origin policy.
    #[must_use]
    pub const fn cors(&self) -> &Arc<CorsPolicy> {
        &self.cors
    }
}

fn precheck<E: Extension>(
    extension: &Arc<E>,
    instance: InstanceId,
    map: &ExtensionMap,
) -> Result<(), ExtensionBindingFault> {
    map.check_bindable::<E>(instance)?;
    match extension.binding().owner() {
        None => Ok(()),
        Some(owner) if owner == instance => Err(ExtensionBindingFault::AlreadyBound { extension: E::NAME }),
        Some(owner) => Err(ExtensionBindingFault::BoundElsewhere {
            extension: E::NAME,
            owner,
        }),
    }
}

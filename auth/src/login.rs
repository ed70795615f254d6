//! The login manager extension.
//!
//! Owns the session store, the session cookie settings, and (once the
//! [`crate::AuthenticationBinder`] has run) the user loader and the URL of the
//! login route.

use crate::cookie::{self, SameSite, SetCookie};
use crate::error::{AuthError, Result};
use crate::identity::{Identity, IdentityLookup};
use crate::session::{Session, SessionId, SessionStore};
use http::HeaderMap;
use keel_core::config::Configuration;
use keel_core::error::ConfigError;
use keel_core::extension::{Binding, Extension};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Session cookie settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    /// Cookie name (`SESSION_COOKIE_NAME`).
    pub name: String,
    /// Session lifetime (`REMEMBER_COOKIE_DURATION`).
    pub duration: Duration,
    /// Cookie domain (`REMEMBER_COOKIE_DOMAIN`).
    pub domain: Option<String>,
    /// Whether the cookie is HTTPS-only (`SESSION_COOKIE_SECURE`).
    pub secure: bool,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            duration: Duration::from_secs(90 * 24 * 60 * 60),
            domain: None,
            secure: false,
        }
    }
}

impl CookieSettings {
    /// Read cookie settings, keeping defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for malformed durations or booleans.
    pub fn from_config(config: &Configuration) -> std::result::Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            name: config
                .get_string("SESSION_COOKIE_NAME")
                .unwrap_or(defaults.name),
            duration: config
                .get_duration("REMEMBER_COOKIE_DURATION")?
                .unwrap_or(defaults.duration),
            domain: config.get_string("REMEMBER_COOKIE_DOMAIN"),
            secure: config
                .get_bool("SESSION_COOKIE_SECURE")?
                .unwrap_or(defaults.secure),
        })
    }

    fn max_age(&self) -> i64 {
        i64::try_from(self.duration.as_secs()).unwrap_or(i64::MAX)
    }
}

/// Session-based login management, bound to one application instance.
pub struct LoginManager {
    binding: Binding,
    store: Arc<dyn SessionStore>,
    cookie: CookieSettings,
    user_loader: OnceLock<Arc<dyn IdentityLookup>>,
    login_url: OnceLock<String>,
}

impl Extension for LoginManager {
    const NAME: &'static str = "login_manager";

    fn binding(&self) -> &Binding {
        &self.binding
    }
}

impl LoginManager {
    /// Login manager over `store` with the given cookie settings.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, cookie: CookieSettings) -> Self {
        Self {
            binding: Binding::new(),
            store,
            cookie,
            user_loader: OnceLock::new(),
            login_url: OnceLock::new(),
        }
    }

    /// Login manager with cookie settings read from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for malformed cookie settings.
    pub fn from_config(
        config: &Configuration,
        store: Arc<dyn SessionStore>,
    ) -> std::result::Result<Self, ConfigError> {
        Ok(Self::new(store, CookieSettings::from_config(config)?))
    }

    /// Cookie settings in effect.
    #[must_use]
    pub const fn cookie_settings(&self) -> &CookieSettings {
        &self.cookie
    }

    /// Whether a user loader has been attached.
    #[must_use]
    pub fn has_user_loader(&self) -> bool {
        self.user_loader.get().is_some()
    }

    /// URL unauthenticated requests are redirected to, once attached.
    #[must_use]
    pub fn login_url(&self) -> Option<&str> {
        self.login_url.get().map(String::as_str)
    }

    /// Install the user loader and login URL. Both are set at most once.
    pub(crate) fn attach(&self, loader: Arc<dyn IdentityLookup>, login_url: String) -> Result<()> {
        if self.has_user_loader() || self.login_url.get().is_some() {
            return Err(AuthError::AlreadyAttached);
        }
        self.user_loader
            .set(loader)
            .map_err(|_| AuthError::AlreadyAttached)?;
        self.login_url
            .set(login_url)
            .map_err(|_| AuthError::AlreadyAttached)
    }

    /// Start a session for `identifier`.
    ///
    /// Credentials are checked by the caller; this only records the result.
    ///
    /// # Errors
    ///
    /// Propagates session store failures.
    pub async fn login(&self, identifier: &str) -> Result<(Session, SetCookie)> {
        let ttl = chrono::Duration::from_std(self.cookie.duration)
            .map_err(|e| AuthError::SessionStore(e.to_string()))?;
        let session = Session::new(identifier, ttl);
        self.store.create(session.clone()).await?;

        tracing::info!(identifier = %identifier, "User logged in");
        let cookie = self.session_cookie(session.session_id.as_str());
        Ok((session, cookie))
    }

    /// End the request's session, if any, and return the clearing cookie.
    ///
    /// # Errors
    ///
    /// Propagates session store failures.
    pub async fn logout(&self, headers: &HeaderMap) -> Result<SetCookie> {
        if let Some(token) = cookie::get(headers, &self.cookie.name) {
            self.store.delete(&SessionId::from_token(token)).await?;
            tracing::info!("User logged out");
        }
        Ok(SetCookie::removal(self.cookie.name.clone()).domain(self.cookie.domain.clone()))
    }

    /// Identity of the request carrying `headers`.
    ///
    /// Missing, unknown and expired sessions are anonymous. The user record
    /// itself is resolved lazily by [`Identity::record`].
    ///
    /// # Errors
    ///
    /// - [`AuthError::NoUserLoader`] when a session exists but no loader is attached
    /// - session store failures other than "not found"
    pub async fn identity(&self, headers: &HeaderMap) -> Result<Identity> {
        let Some(token) = cookie::get(headers, &self.cookie.name) else {
            return Ok(Identity::anonymous());
        };

        let session = match self.store.get(&SessionId::from_token(token)).await {
            Ok(session) => session,
            Err(AuthError::SessionNotFound) => return Ok(Identity::anonymous()),
            Err(e) => return Err(e),
        };

        let loader = self.user_loader.get().ok_or(AuthError::NoUserLoader)?;
        Ok(Identity::new(session.identifier, Arc::clone(loader)))
    }

    /// Redirect target for an unauthenticated request to `next`.
    ///
    /// `None` until the login route has been attached.
    #[must_use]
    pub fn login_redirect(&self, next: &str) -> Option<String> {
        self.login_url()
            .map(|url| format!("{url}?next={}", urlencoding::encode(next)))
    }

    fn session_cookie(&self, token: &str) -> SetCookie {
        SetCookie::new(self.cookie.name.clone(), token)
            .max_age(self.cookie.max_age())
            .domain(self.cookie.domain.clone())
            .secure(self.cookie.secure)
            .http_only(true)
            .same_site(SameSite::Lax)
    }
}

impl std::fmt::Debug for LoginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginManager")
            .field("cookie", &self.cookie)
            .field("has_user_loader", &self.has_user_loader())
            .field("login_url", &self.login_url())
            .finish_non_exhaustive()
    }
}

//! Connects the user-model collaborator to the login manager.

use crate::error::{AuthError, Result};
use crate::identity::IdentityLookup;
use crate::login::LoginManager;
use std::sync::Arc;

/// Route unauthenticated requests are redirected to.
pub const LOGIN_ENDPOINT: &str = "api.login";

/// Binds an identity lookup to a [`LoginManager`] and fixes the login route.
///
/// Does not verify credentials.
#[derive(Clone)]
pub struct AuthenticationBinder {
    lookup: Arc<dyn IdentityLookup>,
    login_endpoint: String,
}

impl AuthenticationBinder {
    /// Binder redirecting to [`LOGIN_ENDPOINT`].
    #[must_use]
    pub fn new(lookup: Arc<dyn IdentityLookup>) -> Self {
        Self {
            lookup,
            login_endpoint: LOGIN_ENDPOINT.to_string(),
        }
    }

    /// Redirect to a different named route.
    #[must_use]
    pub fn with_login_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.login_endpoint = endpoint.into();
        self
    }

    /// Named route unauthenticated requests are redirected to.
    #[must_use]
    pub fn login_endpoint(&self) -> &str {
        &self.login_endpoint
    }

    /// Register the lookup as `manager`'s user loader.
    ///
    /// `resolve` maps a named route (`namespace.endpoint`) to its URL; the
    /// login route is resolved now so a typo fails the build rather than the
    /// first redirect. Returns the resolved login URL.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownLoginRoute`] if `resolve` does not know the route
    /// - [`AuthError::AlreadyAttached`] if `manager` already has a user loader
    pub fn attach<F>(&self, manager: &LoginManager, resolve: F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = resolve(&self.login_endpoint)
            .ok_or_else(|| AuthError::UnknownLoginRoute(self.login_endpoint.clone()))?;

        manager.attach(Arc::clone(&self.lookup), url.clone())?;
        tracing::debug!(endpoint = %self.login_endpoint, url = %url, "User loader attached");
        Ok(url)
    }
}

impl std::fmt::Debug for AuthenticationBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationBinder")
            .field("login_endpoint", &self.login_endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::IdentityRecord;
    use crate::login::CookieSettings;
    use crate::session::{Session, SessionId, SessionStore};
    use std::future::Future;
    use std::pin::Pin;

    struct NoSessions;

    impl SessionStore for NoSessions {
        fn create(&self, _: Session) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn get<'a>(
            &'a self,
            _: &'a SessionId,
        ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + 'a>> {
            Box::pin(async { Err(AuthError::SessionNotFound) })
        }

        fn delete<'a>(
            &'a self,
            _: &'a SessionId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct Nobody;

    impl IdentityLookup for Nobody {
        fn lookup<'a>(
            &'a self,
            _: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<IdentityRecord>>> + Send + 'a>> {
            Box::pin(async { Ok(None) })
        }
    }

    fn routes(name: &str) -> Option<String> {
        (name == "api.login").then(|| "/api/login".to_string())
    }

    fn manager() -> LoginManager {
        LoginManager::new(Arc::new(NoSessions), CookieSettings::default())
    }

    #[test]
    fn test_attach_resolves_login_route() {
        let manager = manager();
        let url = AuthenticationBinder::new(Arc::new(Nobody))
            .attach(&manager, routes)
            .unwrap();
        assert_eq!(url, "/api/login");
        assert!(manager.has_user_loader());
        assert_eq!(manager.login_url(), Some("/api/login"));
    }

    #[test]
    fn test_unknown_route_leaves_manager_untouched() {
        let manager = manager();
        let err = AuthenticationBinder::new(Arc::new(Nobody))
            .with_login_endpoint("auth.signin")
            .attach(&manager, routes)
            .unwrap_err();
        assert_eq!(err, AuthError::UnknownLoginRoute("auth.signin".into()));
        assert!(!manager.has_user_loader());
    }

    #[test]
    fn test_second_attach_fails() {
        let manager = manager();
        let binder = AuthenticationBinder::new(Arc::new(Nobody));
        binder.attach(&manager, routes).unwrap();
        assert_eq!(
            binder.attach(&manager, routes).unwrap_err(),
            AuthError::AlreadyAttached
        );
    }
}

//! Login sessions and the session store abstraction.

use crate::error::Result;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Opaque session token carried in the session cookie.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session id.
    ///
    /// Uses 256 bits of randomness.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Wrap a token read from a cookie.
    #[must_use]
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionId(..)")
    }
}

/// A login session: which identifier a session token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session token.
    pub session_id: SessionId,
    /// Opaque user identifier.
    pub identifier: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// New session for `identifier` lasting `ttl`.
    #[must_use]
    pub fn new(identifier: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::generate(),
            identifier: identifier.into(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Whether the session has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Remaining lifetime at `now`, never negative.
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

/// Storage for login sessions.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the login manager can
/// hold an `Arc<dyn SessionStore>`.
pub trait SessionStore: Send + Sync + 'static {
    /// Store a new session.
    ///
    /// # Errors
    ///
    /// - [`crate::AuthError::SessionExists`] if the id is taken
    /// - [`crate::AuthError::SessionStore`] if the store fails
    fn create(&self, session: Session) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Load a live session.
    ///
    /// # Errors
    ///
    /// - [`crate::AuthError::SessionNotFound`] if unknown or expired
    /// - [`crate::AuthError::SessionStore`] if the store fails
    fn get<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + 'a>>;

    /// Delete a session. Deleting an unknown session succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AuthError::SessionStore`] if the store fails.
    fn delete<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_url_safe() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 43);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_debug_hides_token() {
        let id = SessionId::from_token("secret-token");
        assert_eq!(format!("{id:?}"), "SessionId(..)");
    }

    #[test]
    fn test_expiry() {
        let session = Session::new("42", Duration::minutes(5));
        assert!(!session.is_expired_at(Utc::now()));
        assert!(session.is_expired_at(Utc::now() + Duration::minutes(6)));
        assert_eq!(
            session.remaining_at(Utc::now() + Duration::hours(1)),
            Duration::zero()
        );
    }
}

//! Error types for login management and identity binding.

use thiserror::Error;

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Failure modes of the authentication layer.
///
/// Credential checks are out of scope; these cover session storage, identity
/// lookup and wiring.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    // ═══════════════════════════════════════════════════════════
    // Session Errors
    // ═══════════════════════════════════════════════════════════

    /// Session not found (unknown or expired).
    #[error("Session not found")]
    SessionNotFound,

    /// A session with this id already exists.
    #[error("Session already exists")]
    SessionExists,

    /// The session store failed.
    #[error("Session store error: {0}")]
    SessionStore(String),

    /// A session could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ═══════════════════════════════════════════════════════════
    // Identity Errors
    // ═══════════════════════════════════════════════════════════

    /// The identity lookup failed (as opposed to finding nothing).
    #[error("Identity lookup failed: {0}")]
    Lookup(String),

    /// No user loader has been attached to the login manager.
    #[error("No user loader is attached to the login manager")]
    NoUserLoader,

    // ═══════════════════════════════════════════════════════════
    // Wiring Errors
    // ═══════════════════════════════════════════════════════════

    /// The unauthenticated-redirect route is not registered.
    #[error("Login route `{0}` is not registered")]
    UnknownLoginRoute(String),

    /// An identity lookup is already attached to the login manager.
    #[error("An identity lookup is already attached")]
    AlreadyAttached,
}

impl From<redis::RedisError> for AuthError {
    fn from(err: redis::RedisError) -> Self {
        Self::SessionStore(err.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

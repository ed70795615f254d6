//! In-memory session store and identity lookup.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use keel_auth::{AuthError, IdentityLookup, IdentityRecord, Result, Session, SessionId, SessionStore};
use keel_core::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// HashMap-backed session store.
///
/// Expired sessions are treated as missing, like the Redis store.
#[derive(Clone, Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self, session: Session) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().unwrap();
            let key = session.session_id.as_str().to_string();
            if sessions.contains_key(&key) {
                return Err(AuthError::SessionExists);
            }
            sessions.insert(key, session);
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + 'a>> {
        Box::pin(async move {
            self.sessions
                .read()
                .unwrap()
                .get(session_id.as_str())
                .filter(|session| !session.is_expired_at(Utc::now()))
                .cloned()
                .ok_or(AuthError::SessionNotFound)
        })
    }

    fn delete<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.sessions.write().unwrap().remove(session_id.as_str());
            Ok(())
        })
    }
}

/// Identity lookup over a fixed set of users.
#[derive(Clone, Debug, Default)]
pub struct StaticIdentityLookup {
    users: Arc<HashMap<String, IdentityRecord>>,
}

impl StaticIdentityLookup {
    /// Lookup that knows nobody.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup that knows the given identifiers.
    #[must_use]
    pub fn with_users<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let users = ids
            .into_iter()
            .map(|id| {
                let id = id.into();
                (id.clone(), IdentityRecord::new(id))
            })
            .collect();
        Self {
            users: Arc::new(users),
        }
    }
}

impl IdentityLookup for StaticIdentityLookup {
    fn lookup<'a>(
        &'a self,
        identifier: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<IdentityRecord>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.users.get(identifier).cloned()) })
    }
}

//! Redis-based session store implementation.
//!
//! Sessions are stored in Redis with:
//! - **Key**: `{prefix}session:{session_id}` → JSON-encoded [`Session`]
//! - **TTL**: the session's remaining lifetime
//!
//! # Example
//!
//! ```no_run
//! use keel_auth::stores::RedisSessionStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisSessionStore::connect("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::session::{Session, SessionId, SessionStore};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::OnceCell;

/// Redis-based session store with TTL-based expiration.
///
/// The connection is opened on first use, so building the store never
/// touches the network.
pub struct RedisSessionStore {
    client: Client,
    conn_manager: OnceCell<ConnectionManager>,
    prefix: String,
}

impl RedisSessionStore {
    /// Create a store that connects lazily.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SessionStore`] if the URL is invalid.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| AuthError::SessionStore(format!("Failed to create Redis client: {e}")))?;

        Ok(Self {
            client,
            conn_manager: OnceCell::new(),
            prefix: String::new(),
        })
    }

    /// Create a store and connect immediately.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SessionStore`] if Redis cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let store = Self::new(redis_url)?;
        store.conn().await?;
        Ok(store)
    }

    /// Namespace every key, e.g. with `CACHE_KEY_PREFIX`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        self.conn_manager
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone()).await.map_err(|e| {
                    AuthError::SessionStore(format!(
                        "Failed to create Redis connection manager: {e}"
                    ))
                })
            })
            .await
            .cloned()
    }

    fn session_key(&self, session_id: &SessionId) -> String {
        format!("{}session:{}", self.prefix, session_id.as_str())
    }
}

impl SessionStore for RedisSessionStore {
    fn create(&self, session: Session) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let key = self.session_key(&session.session_id);
            let payload = serde_json::to_string(&session)?;

            #[allow(clippy::cast_sign_loss)]
            let ttl_seconds = session.remaining_at(Utc::now()).num_seconds().max(1) as u64;

            // SET NX rejects an id that is already in use (session fixation).
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(payload)
                .arg("NX")
                .arg("EX")
                .arg(ttl_seconds)
                .query_async(&mut conn)
                .await?;

            if reply.is_none() {
                return Err(AuthError::SessionExists);
            }

            tracing::info!(
                identifier = %session.identifier,
                ttl_seconds,
                "Created session in Redis"
            );
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + 'a>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let payload: Option<String> = conn.get(self.session_key(session_id)).await?;

            let session: Session = match payload {
                Some(payload) => serde_json::from_str(&payload)?,
                None => return Err(AuthError::SessionNotFound),
            };

            // TTL normally removes expired sessions; check anyway in case of clock skew.
            if session.is_expired_at(Utc::now()) {
                tracing::warn!(
                    expires_at = %session.expires_at,
                    "Session expired (TTL should have cleaned this up)"
                );
                return Err(AuthError::SessionNotFound);
            }

            Ok(session)
        })
    }

    fn delete<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let _: () = conn.del(self.session_key(session_id)).await?;
            tracing::debug!("Deleted session from Redis");
            Ok(())
        })
    }
}

//! Identity lookup and the per-request identity.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// A user record as returned by the user-model collaborator.
///
/// The attributes are opaque to this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Opaque user identifier (what the session stores).
    pub id: String,
    /// Everything else the lookup returned.
    #[serde(default)]
    pub attributes: Value,
}

impl IdentityRecord {
    /// Record with no attributes.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Value::Null,
        }
    }

    /// Attach attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = attributes;
        self
    }

    /// Read one attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// Resolves an opaque identifier to a user record.
///
/// Supplied by the user-model collaborator. Returning `Ok(None)` means the
/// identifier is unknown; `Err` means the lookup itself failed.
pub trait IdentityLookup: Send + Sync + 'static {
    /// Look up `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AuthError::Lookup`] when the backing store fails.
    fn lookup<'a>(
        &'a self,
        identifier: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<IdentityRecord>>> + Send + 'a>>;
}

/// The identity of one request: an optional identifier plus a record
/// resolved through the user loader on first access.
///
/// Never persisted; dropped with the request.
pub struct Identity {
    identifier: Option<String>,
    loader: Option<Arc<dyn IdentityLookup>>,
    record: OnceCell<Option<IdentityRecord>>,
}

impl Identity {
    /// An unauthenticated request.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            identifier: None,
            loader: None,
            record: OnceCell::new(),
        }
    }

    /// A request carrying `identifier`, resolved lazily through `loader`.
    #[must_use]
    pub fn new(identifier: String, loader: Arc<dyn IdentityLookup>) -> Self {
        Self {
            identifier: Some(identifier),
            loader: Some(loader),
            record: OnceCell::new(),
        }
    }

    /// The session's identifier, if any. Does not trigger a lookup.
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// The user record; looked up at most once per request.
    ///
    /// An identifier the loader does not know resolves to `None`.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures; a failed lookup is retried on the next call.
    pub async fn record(&self) -> Result<Option<&IdentityRecord>> {
        let (Some(identifier), Some(loader)) = (&self.identifier, &self.loader) else {
            return Ok(None);
        };

        let record = self
            .record
            .get_or_try_init(|| async {
                let found = loader.lookup(identifier).await?;
                if found.is_none() {
                    tracing::debug!(identifier = %identifier, "Session refers to an unknown user");
                }
                Ok::<_, crate::AuthError>(found)
            })
            .await?;
        Ok(record.as_ref())
    }

    /// Whether the identifier resolves to a user.
    ///
    /// # Errors
    ///
    /// Propagates lookup failures.
    pub async fn is_authenticated(&self) -> Result<bool> {
        Ok(self.record().await?.is_some())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("identifier", &self.identifier)
            .field("resolved", &self.record.initialized())
            .finish_non_exhaustive()
    }
}

//! Redis-backed cache extension.
//!
//! Values are stored as JSON under `{CACHE_KEY_PREFIX}{key}`. Entries expire
//! after `CACHE_DEFAULT_TIMEOUT` seconds unless a timeout is given per key;
//! without a default (or with `0`) entries never expire.

use keel_core::config::Configuration;
use keel_core::error::ExtensionBindingFault;
use keel_core::extension::{Binding, Extension};
use keel_core::settings::NO_EXPIRY_TIMEOUT_SECS;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Cache operation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Redis could not be reached.
    #[error("cache connection failed: {0}")]
    Connection(String),

    /// A Redis command failed.
    #[error("cache command failed: {0}")]
    Command(String),

    /// A value could not be encoded or decoded.
    #[error("cache value serialization failed: {0}")]
    Serialization(String),
}

/// The cache client.
pub struct Cache {
    binding: Binding,
    client: Client,
    conn_manager: OnceCell<ConnectionManager>,
    prefix: String,
    default_timeout: Option<Duration>,
}

impl Extension for Cache {
    const NAME: &'static str = "cache";

    fn binding(&self) -> &Binding {
        &self.binding
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("prefix", &self.prefix)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Build the client from `CACHE_REDIS_URL`, or from
    /// `CACHE_REDIS_HOST`/`CACHE_REDIS_PORT`/`CACHE_REDIS_PASSWORD`.
    ///
    /// Connects on first use.
    ///
    /// # Errors
    ///
    /// - [`ExtensionBindingFault::MissingConfig`] when no Redis location is set
    /// - [`ExtensionBindingFault::Init`] for a malformed URL or timeout
    pub fn from_config(config: &Configuration) -> Result<Self, ExtensionBindingFault> {
        let url = redis_url(config)?;
        let client = Client::open(url.as_str()).map_err(|e| ExtensionBindingFault::Init {
            extension: Self::NAME,
            reason: format!("invalid Redis URL: {e}"),
        })?;

        let default_timeout = config
            .get_u64("CACHE_DEFAULT_TIMEOUT")
            .map_err(|e| ExtensionBindingFault::Init {
                extension: Self::NAME,
                reason: e.to_string(),
            })?
            .and_then(expiry);

        Ok(Self {
            binding: Binding::new(),
            client,
            conn_manager: OnceCell::new(),
            prefix: config.get_string("CACHE_KEY_PREFIX").unwrap_or_default(),
            default_timeout,
        })
    }

    /// Expiry applied by [`Cache::set`]; `None` means entries never expire.
    #[must_use]
    pub const fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// The namespaced Redis key for `key`.
    #[must_use]
    pub fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    async fn conn(&self) -> Result<ConnectionManager, CacheError> {
        self.conn_manager
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| CacheError::Connection(e.to_string()))
            })
            .await
            .cloned()
    }

    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if Redis fails or the stored value does not
    /// decode as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(self.key(key))
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;

        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| CacheError::Serialization(e.to_string()))
        })
        .transpose()
    }

    /// Store a value with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if encoding or the Redis write fails.
    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.set_with_timeout(key, value, self.default_timeout).await
    }

    /// Store a value with an explicit timeout; `None` stores without expiry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if encoding or the Redis write fails.
    pub async fn set_with_timeout<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        timeout: Option<Duration>,
    ) -> Result<(), CacheError> {
        let encoded =
            serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let mut conn = self.conn().await?;
        let key = self.key(key);

        match timeout.filter(|t| t.as_secs() > 0) {
            Some(timeout) => conn.set_ex::<_, _, ()>(key, encoded, timeout.as_secs()).await,
            None => conn.set::<_, _, ()>(key, encoded).await,
        }
        .map_err(|e| CacheError::Command(e.to_string()))
    }

    /// Remove a value; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the Redis command fails.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let removed: u32 = conn
            .del(self.key(key))
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;
        Ok(removed > 0)
    }
}

fn expiry(seconds: u64) -> Option<Duration> {
    (seconds > 0 && seconds < NO_EXPIRY_TIMEOUT_SECS).then(|| Duration::from_secs(seconds))
}

pub(crate) fn redis_url(config: &Configuration) -> Result<String, ExtensionBindingFault> {
    if let Some(url) = config.get_string("CACHE_REDIS_URL") {
        return Ok(url);
    }

    let host = config
        .get_string("CACHE_REDIS_HOST")
        .ok_or_else(|| ExtensionBindingFault::MissingConfig {
            extension: Cache::NAME,
            key: "CACHE_REDIS_URL".to_string(),
        })?;
    let port = config
        .get_u64("CACHE_REDIS_PORT")
        .map_err(|e| ExtensionBindingFault::Init {
            extension: Cache::NAME,
            reason: e.to_string(),
        })?
        .unwrap_or(6379);

    Ok(match config.get_string("CACHE_REDIS_PASSWORD") {
        Some(password) => format!("redis://:{}@{host}:{port}", urlencoding::encode(&password)),
        None => format!("redis://{host}:{port}"),
    })
}

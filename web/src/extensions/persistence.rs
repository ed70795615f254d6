//! Postgres connection pool extension.

use keel_core::config::Configuration;
use keel_core::error::ExtensionBindingFault;
use keel_core::extension::{Binding, Extension};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Pooled connections older than this are closed and reopened.
pub const DEFAULT_POOL_RECYCLE: Duration = Duration::from_secs(499);

/// How long a caller waits for a pooled connection.
pub const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(120);

/// The persistence client: a lazily connecting Postgres pool.
#[derive(Debug)]
pub struct Persistence {
    binding: Binding,
    pool: PgPool,
    max_lifetime: Duration,
    acquire_timeout: Duration,
}

impl Extension for Persistence {
    const NAME: &'static str = "persistence";

    fn binding(&self) -> &Binding {
        &self.binding
    }
}

impl Persistence {
    /// Build the pool from `SQLALCHEMY_DATABASE_URI`.
    ///
    /// No connection is opened until the pool is first used. Must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`ExtensionBindingFault::MissingConfig`] without a database URI
    /// - [`ExtensionBindingFault::Init`] for a malformed URI or pool setting
    pub fn from_config(config: &Configuration) -> Result<Self, ExtensionBindingFault> {
        let url = config.get_str("SQLALCHEMY_DATABASE_URI").ok_or_else(|| {
            ExtensionBindingFault::MissingConfig {
                extension: Self::NAME,
                key: "SQLALCHEMY_DATABASE_URI".to_string(),
            }
        })?;

        let max_lifetime = seconds(config, "SQLALCHEMY_POOL_RECYCLE")?.unwrap_or(DEFAULT_POOL_RECYCLE);
        let acquire_timeout =
            seconds(config, "SQLALCHEMY_POOL_TIMEOUT")?.unwrap_or(DEFAULT_POOL_TIMEOUT);

        let pool = PgPoolOptions::new()
            .max_lifetime(max_lifetime)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)
            .map_err(|e| ExtensionBindingFault::Init {
                extension: Self::NAME,
                reason: format!("invalid database URI: {e}"),
            })?;

        Ok(Self {
            binding: Binding::new(),
            pool,
            max_lifetime,
            acquire_timeout,
        })
    }

    /// The connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connection recycle age.
    #[must_use]
    pub const fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    /// Connection acquire timeout.
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }
}

fn seconds(config: &Configuration, key: &str) -> Result<Option<Duration>, ExtensionBindingFault> {
    config
        .get_u64(key)
        .map(|value| value.map(Duration::from_secs))
        .map_err(|e| ExtensionBindingFault::Init {
            extension: Persistence::NAME,
            reason: e.to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use keel_core::config::SettingValue;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_pool_is_lazy_and_uses_recycle_settings() {
        let config = keel_testing::test_config();
        let persistence = Persistence::from_config(&config).unwrap();

        assert_eq!(persistence.max_lifetime(), Duration::from_secs(499));
        assert_eq!(persistence.acquire_timeout(), Duration::from_secs(120));
        assert_eq!(persistence.pool().size(), 0);
    }

    #[tokio::test]
    async fn test_missing_uri_is_reported() {
        let err = Persistence::from_config(&Configuration::from_map(BTreeMap::new())).unwrap_err();
        assert_eq!(
            err,
            ExtensionBindingFault::MissingConfig {
                extension: "persistence",
                key: "SQLALCHEMY_DATABASE_URI".into()
            }
        );

        let mut values = BTreeMap::new();
        values.insert("SQLALCHEMY_DATABASE_URI".into(), SettingValue::from("not a url"));
        assert!(matches!(
            Persistence::from_config(&Configuration::from_map(values)),
            Err(ExtensionBindingFault::Init { .. })
        ));
    }
}

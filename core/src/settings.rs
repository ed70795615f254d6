//! Built-in setting defaults and the environment-variable mapping.

use crate::config::SettingValue;
use std::collections::BTreeMap;
use std::time::Duration;

/// Prefix for environment variables that map one-to-one onto setting names.
///
/// `KEEL_SITE_NAME=Acme` sets `SITE_NAME`.
pub const ENV_PREFIX: &str = "KEEL_";

/// Value used by the cache when no default timeout is configured.
///
/// Any timeout at or above this is stored without expiry.
pub const NO_EXPIRY_TIMEOUT_SECS: u64 = 9_999_999_999_999_999;

/// Environment variables read at startup and the settings they populate.
///
/// One variable may feed several settings (`REDIS_URL` is the cache, the
/// broker, and the result backend).
pub const ENV_MAPPING: &[(&str, &[&str])] = &[
    ("PRODUCTION", &["PRODUCTION"]),
    ("DEBUG", &["DEBUG"]),
    ("LOG_LEVEL", &["LOG_LEVEL"]),
    ("SERVER_NAME", &["SERVER_NAME"]),
    ("SITE_NAME", &["SITE_NAME"]),
    ("REMEMBER_COOKIE_DOMAIN", &["REMEMBER_COOKIE_DOMAIN"]),
    ("SECRET_KEY", &["SECRET_KEY"]),
    ("CRYPTO_KEY", &["CRYPTO_KEY"]),
    ("DATABASE_URL", &["SQLALCHEMY_DATABASE_URI"]),
    ("REDIS_HOST", &["CACHE_REDIS_HOST", "CELERY_REDIS_HOST"]),
    ("REDIS_PORT", &["CACHE_REDIS_PORT", "CELERY_REDIS_PORT"]),
    ("REDIS_PASSWORD", &["CACHE_REDIS_PASSWORD"]),
    ("DEFAULT_TIMEOUT", &["CACHE_DEFAULT_TIMEOUT"]),
    (
        "REDIS_URL",
        &[
            "CACHE_REDIS_URL",
            "CELERY_BROKER_URL",
            "CELERY_RESULT_BACKEND",
        ],
    ),
    ("MAIL_SERVER", &["MAIL_SERVER"]),
    ("MAIL_PORT", &["MAIL_PORT"]),
    ("MAIL_USERNAME", &["MAIL_USERNAME"]),
    ("MAIL_PASSWORD", &["MAIL_PASSWORD"]),
    ("WORKER_CONCURRENCY", &["WORKER_CONCURRENCY"]),
    ("WORKER_POLL_TIMEOUT", &["WORKER_POLL_TIMEOUT"]),
    ("METRICS_ADDR", &["METRICS_ADDR"]),
];

/// Settings populated by an environment variable.
#[must_use]
pub fn keys_for_env(var: &str) -> Vec<String> {
    if let Some(setting) = var.strip_prefix(ENV_PREFIX) {
        if !setting.is_empty() {
            return vec![setting.to_string()];
        }
    }

    ENV_MAPPING
        .iter()
        .find(|(name, _)| *name == var)
        .map(|(_, keys)| keys.iter().map(|k| (*k).to_string()).collect())
        .unwrap_or_default()
}

/// Built-in defaults, the lowest configuration layer.
#[must_use]
pub fn defaults() -> BTreeMap<String, SettingValue> {
    let mut d = BTreeMap::new();
    let mut set = |key: &str, value: SettingValue| {
        d.insert(key.to_string(), value);
    };

    set("DEBUG", SettingValue::Bool(true));
    set("LOG_LEVEL", "debug".into());

    // Cache
    set("CACHE_TYPE", "redis".into());
    set("CACHE_REDIS_PORT", SettingValue::Integer(6379));
    set("CACHE_KEY_PREFIX", "keel:".into());

    // Task runner
    set("CELERY_RESULT_EXPIRES", Duration::from_secs(300).into());
    set("CELERY_REDIS_MAX_CONNECTIONS", SettingValue::Integer(20));
    set("WORKER_POLL_TIMEOUT", Duration::from_secs(2).into());
    set("CELERYBEAT_SCHEDULE", SettingValue::Map(BTreeMap::new()));
    set("WORKER_CONCURRENCY", SettingValue::Integer(4));

    // Persistence; keeps pooled connections from going stale across reloads
    set("SQLALCHEMY_POOL_RECYCLE", SettingValue::Integer(499));
    set("SQLALCHEMY_POOL_TIMEOUT", SettingValue::Integer(120));

    // Sessions
    set(
        "REMEMBER_COOKIE_DURATION",
        Duration::from_secs(90 * 24 * 60 * 60).into(),
    );
    set("SESSION_COOKIE_NAME", "session".into());
    set("SESSION_COOKIE_SECURE", SettingValue::Bool(false));

    // Request surface
    set("CORS_HEADERS", "Content-Type".into());
    set("WTF_CSRF_ENABLED", SettingValue::Bool(true));
    set("PROXY_FIX_NUM_PROXIES", SettingValue::Integer(1));

    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_feeds_cache_and_broker() {
        let keys = keys_for_env("REDIS_URL");
        assert!(keys.contains(&"CACHE_REDIS_URL".to_string()));
        assert!(keys.contains(&"CELERY_BROKER_URL".to_string()));
    }

    #[test]
    fn test_prefix_alone_maps_to_nothing() {
        assert!(keys_for_env("KEEL_").is_empty());
    }

    #[test]
    fn test_defaults_include_empty_schedule() {
        let d = defaults();
        assert_eq!(
            d.get("CELERYBEAT_SCHEDULE"),
            Some(&SettingValue::Map(BTreeMap::new()))
        );
    }
}

//! Layered, immutable configuration.
//!
//! A [`ConfigSource`] collects the layers; [`ConfigSource::load`] resolves them
//! into a [`Configuration`] exactly once. Layers, lowest precedence first:
//!
//! 1. built-in defaults ([`crate::settings::defaults`])
//! 2. the instance settings file (TOML, silently skipped when absent)
//! 3. the process environment, mapped through [`crate::settings::ENV_MAPPING`]
//! 4. the override map passed to the application factory
//!
//! Values are opaque to this layer; typed accessors only parse what callers ask for.

use crate::error::ConfigError;
use crate::settings;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the instance settings file.
pub const INSTANCE_SETTINGS_PATH: &str = "instance/settings.toml";

/// A single configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    /// Text value.
    String(String),
    /// Integer value.
    Integer(i64),
    /// Floating point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
    /// Duration value.
    Duration(Duration),
    /// Ordered list of values.
    List(Vec<SettingValue>),
    /// Nested mapping.
    Map(BTreeMap<String, SettingValue>),
}

impl SettingValue {
    /// Borrow the value as text, if it is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the value as a nested mapping, if it is one.
    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    fn from_toml(value: toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Self::String(s),
            toml::Value::Integer(i) => Self::Integer(i),
            toml::Value::Float(f) => Self::Float(f),
            toml::Value::Boolean(b) => Self::Bool(b),
            toml::Value::Datetime(dt) => Self::String(dt.to_string()),
            toml::Value::Array(items) => Self::List(items.into_iter().map(Self::from_toml).collect()),
            toml::Value::Table(table) => Self::Map(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_toml(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON, e.g. for task arguments taken from the schedule.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Duration(d) => serde_json::Value::from(d.as_secs()),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Duration> for SettingValue {
    fn from(value: Duration) -> Self {
        Self::Duration(value)
    }
}

impl From<BTreeMap<String, SettingValue>> for SettingValue {
    fn from(value: BTreeMap<String, SettingValue>) -> Self {
        Self::Map(value)
    }
}

/// Override map applied on top of every other layer.
pub type Overrides = BTreeMap<String, SettingValue>;

/// Resolved, immutable configuration.
///
/// Shared by reference (`Arc<Configuration>`) once the application factory completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    values: BTreeMap<String, SettingValue>,
}

impl Configuration {
    /// Build a configuration directly from a map, bypassing layering.
    #[must_use]
    pub const fn from_map(values: BTreeMap<String, SettingValue>) -> Self {
        Self { values }
    }

    /// Raw value lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    /// Whether the key is set.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Text lookup. Empty strings count as unset.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(SettingValue::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Text lookup that also renders numbers and booleans.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            SettingValue::String(s) if s.is_empty() => None,
            SettingValue::String(s) => Some(s.clone()),
            SettingValue::Integer(i) => Some(i.to_string()),
            SettingValue::Float(f) => Some(f.to_string()),
            SettingValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Required text lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when the key is unset or empty.
    pub fn require_str(&self, key: &str) -> Result<&str, ConfigError> {
        self.get_str(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Unsigned integer lookup; text values are parsed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the value is not a non-negative integer.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            key: key.to_string(),
            reason,
        };
        match self.get(key) {
            None => Ok(None),
            Some(SettingValue::Integer(i)) => u64::try_from(*i)
                .map(Some)
                .map_err(|_| invalid(format!("{i} is negative"))),
            Some(SettingValue::String(s)) if s.trim().is_empty() => Ok(None),
            Some(SettingValue::String(s)) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| invalid(format!("{s:?}: {e}"))),
            Some(SettingValue::Duration(d)) => Ok(Some(d.as_secs())),
            Some(other) => Err(invalid(format!("expected an integer, found {other:?}"))),
        }
    }

    /// Boolean lookup; accepts `1/0`, `true/false`, `yes/no`, `on/off`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unrecognised text.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(SettingValue::Bool(b)) => Ok(Some(*b)),
            Some(SettingValue::Integer(i)) => Ok(Some(*i != 0)),
            Some(SettingValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "" => Ok(None),
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                other => Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: format!("{other:?} is not a boolean"),
                }),
            },
            Some(other) => Err(ConfigError::Invalid {
                key: key.to_string(),
                reason: format!("expected a boolean, found {other:?}"),
            }),
        }
    }

    /// Duration lookup; integers and numeric text are seconds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the value is not a duration.
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        match self.get(key) {
            Some(SettingValue::Duration(d)) => Ok(Some(*d)),
            _ => Ok(self.get_u64(key)?.map(Duration::from_secs)),
        }
    }

    /// Nested mapping lookup.
    #[must_use]
    pub fn get_map(&self, key: &str) -> Option<&BTreeMap<String, SettingValue>> {
        self.get(key).and_then(SettingValue::as_map)
    }

    /// Comma-separated list lookup. Lists are returned element-wise.
    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(SettingValue::List(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            Some(SettingValue::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Iterate over all settings in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of settings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no settings are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Collects configuration layers and resolves them into a [`Configuration`].
#[derive(Debug, Clone)]
pub struct ConfigSource {
    defaults: BTreeMap<String, SettingValue>,
    instance_file: Option<PathBuf>,
    environment: Vec<(String, String)>,
    overrides: Overrides,
}

impl Default for ConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource {
    /// Built-in defaults and the default instance file; no environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            defaults: settings::defaults(),
            instance_file: Some(PathBuf::from(INSTANCE_SETTINGS_PATH)),
            environment: Vec::new(),
            overrides: Overrides::new(),
        }
    }

    /// Like [`ConfigSource::new`], with a snapshot of the process environment.
    ///
    /// The snapshot is taken here so repeated loads stay deterministic.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new().with_environment(std::env::vars())
    }

    /// Replace the built-in defaults.
    #[must_use]
    pub fn with_defaults(mut self, defaults: BTreeMap<String, SettingValue>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Use a different instance settings file.
    #[must_use]
    pub fn with_instance_file(mut self, path: impl AsRef<Path>) -> Self {
        self.instance_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip the instance settings file.
    #[must_use]
    pub fn without_instance_file(mut self) -> Self {
        self.instance_file = None;
        self
    }

    /// Replace the environment snapshot.
    #[must_use]
    pub fn with_environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Merge an override map; later overrides win.
    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Resolve all layers.
    ///
    /// # Errors
    ///
    /// Returns an error when the instance file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Configuration, ConfigError> {
        let mut values = self.defaults.clone();

        if let Some(path) = &self.instance_file {
            values.extend(load_instance_file(path)?);
        }

        for (var, value) in &self.environment {
            for key in settings::keys_for_env(var) {
                values.insert(key, SettingValue::String(value.clone()));
            }
        }

        values.extend(self.overrides.clone());

        tracing::debug!(settings = values.len(), "Configuration resolved");
        Ok(Configuration { values })
    }
}

fn load_instance_file(path: &Path) -> Result<BTreeMap<String, SettingValue>, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No instance settings file");
            return Ok(BTreeMap::new());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let table: toml::Table = text.parse().map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(table
        .into_iter()
        .map(|(k, v)| (k, SettingValue::from_toml(v)))
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bare() -> ConfigSource {
        ConfigSource::new().without_instance_file()
    }

    #[test]
    fn test_defaults_are_loaded() {
        let config = bare().load().unwrap();
        assert_eq!(config.get_u64("SQLALCHEMY_POOL_RECYCLE").unwrap(), Some(499));
        assert_eq!(
            config.get_duration("REMEMBER_COOKIE_DURATION").unwrap(),
            Some(Duration::from_secs(90 * 24 * 60 * 60))
        );
    }

    #[test]
    fn test_environment_beats_defaults_and_overrides_beat_environment() {
        let mut overrides = Overrides::new();
        overrides.insert("SITE_NAME".into(), "Override".into());

        let config = bare()
            .with_environment([("SITE_NAME", "FromEnv"), ("REDIS_URL", "redis://cache:6379")])
            .with_overrides(overrides)
            .load()
            .unwrap();

        assert_eq!(config.get_str("SITE_NAME"), Some("Override"));
        assert_eq!(config.get_str("CACHE_REDIS_URL"), Some("redis://cache:6379"));
        assert_eq!(config.get_str("CELERY_BROKER_URL"), Some("redis://cache:6379"));
    }

    #[test]
    fn test_prefixed_environment_variables_map_to_settings() {
        let config = bare()
            .with_environment([("KEEL_WORKER_CONCURRENCY", "8")])
            .load()
            .unwrap();
        assert_eq!(config.get_u64("WORKER_CONCURRENCY").unwrap(), Some(8));
    }

    #[test]
    fn test_unrelated_environment_is_ignored() {
        let config = bare().with_environment([("PATH", "/usr/bin")]).load().unwrap();
        assert!(!config.contains("PATH"));
    }

    #[test]
    fn test_missing_instance_file_is_silent() {
        let config = ConfigSource::new()
            .with_instance_file("/definitely/not/here/settings.toml")
            .load();
        assert!(config.is_ok());
    }

    #[test]
    fn test_load_is_deterministic() {
        let source = bare().with_environment([("SECRET_KEY", "abc")]);
        assert_eq!(source.load().unwrap(), source.load().unwrap());
    }

    #[test]
    fn test_typed_accessors() {
        let mut values = BTreeMap::new();
        values.insert("A".to_string(), SettingValue::from("42"));
        values.insert("B".to_string(), SettingValue::from("yes"));
        values.insert("C".to_string(), SettingValue::from("nope"));
        values.insert("D".to_string(), SettingValue::from("a, b ,c"));
        values.insert("E".to_string(), SettingValue::from(""));
        let config = Configuration::from_map(values);

        assert_eq!(config.get_u64("A").unwrap(), Some(42));
        assert_eq!(config.get_bool("B").unwrap(), Some(true));
        assert!(config.get_bool("C").is_err());
        assert_eq!(config.get_list("D"), vec!["a", "b", "c"]);
        assert_eq!(config.get_str("E"), None);
        assert!(matches!(config.require_str("E"), Err(ConfigError::Missing(_))));
    }
}

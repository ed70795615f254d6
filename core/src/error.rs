//! Error types shared across Keel crates.

use crate::extension::InstanceId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent from every layer.
    #[error("missing required setting `{0}`")]
    Missing(String),

    /// A setting exists but cannot be interpreted as the requested type.
    #[error("setting `{key}` has an invalid value: {reason}")]
    Invalid {
        /// Setting name
        key: String,
        /// Why the value was rejected
        reason: String,
    },

    /// The instance settings file exists but could not be read.
    #[error("failed to read instance settings {}: {source}", path.display())]
    Io {
        /// File that failed to load
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The instance settings file is not valid TOML.
    #[error("failed to parse instance settings {}: {source}", path.display())]
    Parse {
        /// File that failed to parse
        path: PathBuf,
        /// Underlying parse error
        #[source]
        source: toml::de::Error,
    },
}

/// Programmer errors raised while binding extensions to an instance.
///
/// These are fatal at startup: a process that hits one must not start serving.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtensionBindingFault {
    /// The extension is already bound to this instance.
    #[error("extension `{extension}` is already bound to this instance")]
    AlreadyBound {
        /// Extension name
        extension: &'static str,
    },

    /// The extension object is bound to a different instance.
    #[error("extension `{extension}` is already bound to instance {owner}")]
    BoundElsewhere {
        /// Extension name
        extension: &'static str,
        /// Instance that owns the extension
        owner: InstanceId,
    },

    /// A setting the extension needs is missing.
    #[error("extension `{extension}` requires setting `{key}`")]
    MissingConfig {
        /// Extension name
        extension: &'static str,
        /// Missing setting
        key: String,
    },

    /// The extension could not be constructed from its settings.
    #[error("extension `{extension}` could not be initialised: {reason}")]
    Init {
        /// Extension name
        extension: &'static str,
        /// Failure description
        reason: String,
    },

    /// A dependency the extension relies on has not been bound yet.
    #[error("extension `{extension}` requires `{dependency}` to be bound first")]
    MissingDependency {
        /// Extension name
        extension: &'static str,
        /// Required extension
        dependency: &'static str,
    },
}

/// Errors raised when code needs an application context that is not active.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// Called outside of a request or task context.
    #[error("no application context is active")]
    NoActiveContext,

    /// The active context has no extension of the requested type.
    #[error("extension `{0}` is not bound in the active context")]
    MissingExtension(&'static str),
}

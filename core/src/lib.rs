//! # Keel Core
//!
//! Types shared by every Keel process role (request serving, task serving,
//! periodic scheduling).
//!
//! ## Core Concepts
//!
//! - **Configuration**: immutable key→value settings resolved once per process
//! - **Extensions**: stateful integrations bound to exactly one application instance
//! - **AppContext**: configuration plus extension bindings, re-entered by requests and tasks
//! - **Faults**: normalized error records and the fault event stream observed by notifiers
//!
//! ## Example
//!
//! ```ignore
//! use keel_core::config::ConfigSource;
//! use keel_core::context::{self, AppContext};
//!
//! let config = ConfigSource::from_env().load()?;
//! let ctx = AppContext::new(InstanceId::new(), Arc::new(config), ExtensionMap::new());
//!
//! context::scope(ctx, async {
//!     let site = context::current().and_then(|c| c.config().get_string("SITE_NAME"));
//! })
//! .await;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod config;
pub mod context;
pub mod error;
pub mod extension;
pub mod fault;
pub mod mail;
pub mod settings;

pub use config::{ConfigSource, Configuration, Overrides, SettingValue};
pub use context::AppContext;
pub use error::{ConfigError, ContextError, ExtensionBindingFault};
pub use extension::{Binding, Extension, ExtensionMap, InstanceId};
pub use fault::{ErrorRecord, FaultBus, FaultCaptureLayer, FaultEvent, FaultOrigin, Severity};
pub use mail::{MailError, MailMessage, MailTransport};

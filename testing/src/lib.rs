//! # Keel Testing
//!
//! Test doubles and helpers for Keel applications.
//!
//! This crate provides:
//! - Mail transports that record or fail ([`RecordingMailTransport`], [`FailingMailTransport`])
//! - An in-memory session store and identity lookup
//! - An in-memory task broker
//! - [`test_settings`], an override map that satisfies every extension
//!
//! ## Example
//!
//! ```ignore
//! use keel_testing::{RecordingMailTransport, StaticIdentityLookup, test_settings};
//!
//! #[tokio::test]
//! async fn test_500_notifies() {
//!     let mail = RecordingMailTransport::new();
//!     let app = AppFactory::new()
//!         .mail_transport(Arc::new(mail.clone()))
//!         .build(test_settings())?;
//!
//!     // ... request a failing route ...
//!     assert!(mail.wait_for(1, Duration::from_secs(1)).await);
//! }
//! ```

pub mod auth;
pub mod broker;
pub mod mail;
pub mod settings;

pub use auth::{InMemorySessionStore, StaticIdentityLookup};
pub use broker::InMemoryBroker;
pub use mail::{FailingMailTransport, RecordingMailTransport};
pub use settings::{test_config, test_settings, test_source};

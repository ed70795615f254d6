//! # Keel Authentication
//!
//! Session-backed login management for Keel applications.
//!
//! This crate does not check credentials. It records who a request belongs
//! to (a session cookie pointing at a stored [`Session`]) and resolves that
//! identifier to a user record through an [`IdentityLookup`] supplied by the
//! user-model collaborator.
//!
//! ## Pieces
//!
//! - [`LoginManager`]: the extension bound to an application instance; creates
//!   and destroys sessions and turns request headers into an [`Identity`]
//! - [`AuthenticationBinder`]: attaches the identity lookup to the login
//!   manager and fixes the login route (`api.login`)
//! - [`SessionStore`]: where sessions live ([`RedisSessionStore`] in production)
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_auth::{AuthenticationBinder, LoginManager, RedisSessionStore};
//!
//! let store = Arc::new(RedisSessionStore::new("redis://127.0.0.1:6379")?);
//! let manager = LoginManager::from_config(&config, store)?;
//! AuthenticationBinder::new(lookup).attach(&manager, |name| routes.url_for(name))?;
//!
//! let (session, cookie) = manager.login("42").await?;
//! let identity = manager.identity(&request_headers).await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod binder;
pub mod cookie;
pub mod error;
pub mod identity;
pub mod login;
pub mod session;
pub mod stores;

pub use binder::{AuthenticationBinder, LOGIN_ENDPOINT};
pub use cookie::{SameSite, SetCookie};
pub use error::{AuthError, Result};
pub use identity::{Identity, IdentityLookup, IdentityRecord};
pub use login::{CookieSettings, LoginManager};
pub use session::{Session, SessionId, SessionStore};
pub use stores::RedisSessionStore;

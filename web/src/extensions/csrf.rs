//! Double-submit cookie CSRF protection.
//!
//! Safe requests receive a signed token in the `csrf_token` cookie (readable
//! by page scripts). Unsafe requests must echo that token in the
//! `X-CSRFToken` header; the cookie must carry a valid signature and the
//! header must match it exactly.
//!
//! Tokens are `{nonce}.{signature}` where the signature is an HMAC-SHA256 of
//! the nonce keyed with `SECRET_KEY`.

use axum::{
    async_trait,
    extract::{FromRequestParts, Request},
    http::{HeaderMap, Method, header, request::Parts},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use keel_auth::{SameSite, SetCookie, cookie};
use keel_core::config::Configuration;
use keel_core::error::ExtensionBindingFault;
use keel_core::extension::{Binding, Extension};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::error::AppError;

/// Cookie carrying the token.
pub const CSRF_COOKIE: &str = "csrf_token";

/// Header unsafe requests must echo the token in.
pub const CSRF_HEADER: &str = "x-csrftoken";

/// The CSRF guard extension.
pub struct CsrfGuard {
    binding: Binding,
    secret: Vec<u8>,
    enabled: bool,
    secure_cookie: bool,
}

impl Extension for CsrfGuard {
    const NAME: &'static str = "csrf";

    fn binding(&self) -> &Binding {
        &self.binding
    }
}

impl std::fmt::Debug for CsrfGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfGuard")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl CsrfGuard {
    /// Guard keyed with `SECRET_KEY`; `WTF_CSRF_ENABLED = false` turns checks off.
    ///
    /// # Errors
    ///
    /// - [`ExtensionBindingFault::MissingConfig`] without a secret key
    /// - [`ExtensionBindingFault::Init`] for malformed boolean settings
    pub fn from_config(config: &Configuration) -> Result<Self, ExtensionBindingFault> {
        let secret = config
            .get_str("SECRET_KEY")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ExtensionBindingFault::MissingConfig {
                extension: Self::NAME,
                key: "SECRET_KEY".to_string(),
            })?;
        let flag = |key: &str, default: bool| {
            config
                .get_bool(key)
                .map(|v| v.unwrap_or(default))
                .map_err(|e| ExtensionBindingFault::Init {
                    extension: Self::NAME,
                    reason: e.to_string(),
                })
        };

        Ok(Self {
            binding: Binding::new(),
            secret: secret.as_bytes().to_vec(),
            enabled: flag("WTF_CSRF_ENABLED", true)?,
            secure_cookie: flag("SESSION_COOKIE_SECURE", false)?,
        })
    }

    /// Whether requests are checked.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A fresh signed token.
    #[must_use]
    pub fn generate_token(&self) -> String {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce = URL_SAFE_NO_PAD.encode(nonce);
        let signature = self.sign(&nonce);
        format!("{nonce}.{signature}")
    }

    /// Whether `token` was signed with this guard's key.
    #[must_use]
    pub fn verify_token(&self, token: &str) -> bool {
        token.split_once('.').is_some_and(|(nonce, signature)| {
            !nonce.is_empty()
                && constant_time_eq::constant_time_eq(
                    signature.as_bytes(),
                    self.sign(nonce).as_bytes(),
                )
        })
    }

    /// Check an unsafe request's headers.
    ///
    /// # Errors
    ///
    /// Returns a 400 [`AppError`] when the cookie token is missing or forged,
    /// or the header does not echo it.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let cookie_token = cookie::get(headers, CSRF_COOKIE)
            .filter(|token| self.verify_token(token))
            .ok_or_else(|| AppError::bad_request("The CSRF token is missing."))?;
        let header_token = headers
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::bad_request("The CSRF token is missing."))?;

        if constant_time_eq::constant_time_eq(cookie_token.as_bytes(), header_token.as_bytes()) {
            Ok(())
        } else {
            Err(AppError::bad_request("The CSRF tokens do not match."))
        }
    }

    fn sign(&self, nonce: &str) -> String {
        URL_SAFE_NO_PAD.encode(hmac_sha256(&self.secret, nonce.as_bytes()))
    }

    fn token_cookie(&self, token: &str) -> SetCookie {
        SetCookie::new(CSRF_COOKIE, token)
            .secure(self.secure_cookie)
            .same_site(SameSite::Lax)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 64;
    const IPAD: u8 = 0x36;
    const OPAD: u8 = 0x5C;

    let mut block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    inner.update(block.map(|b| b ^ IPAD));
    inner.update(data);
    let inner = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(block.map(|b| b ^ OPAD));
    outer.update(inner);
    outer.finalize().into()
}

fn is_safe(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// The token for the current request, for embedding in pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CsrfToken
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or_else(|| AppError::internal("CSRF protection is not installed"))
    }
}

/// Layer enforcing a [`CsrfGuard`].
#[derive(Clone, Debug)]
pub struct CsrfLayer {
    guard: Arc<CsrfGuard>,
}

impl CsrfLayer {
    /// Enforce `guard`.
    #[must_use]
    pub const fn new(guard: Arc<CsrfGuard>) -> Self {
        Self { guard }
    }
}

impl<S> Layer<S> for CsrfLayer {
    type Service = CsrfMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CsrfMiddleware {
            inner,
            guard: Arc::clone(&self.guard),
        }
    }
}

/// Service produced by [`CsrfLayer`].
#[derive(Clone, Debug)]
pub struct CsrfMiddleware<S> {
    inner: S,
    guard: Arc<CsrfGuard>,
}

impl<S> Service<Request> for CsrfMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        if !self.guard.is_enabled() {
            return Box::pin(self.inner.call(req));
        }

        if !is_safe(req.method()) {
            if let Err(rejection) = self.guard.check(req.headers()) {
                tracing::debug!(method = %req.method(), uri = %req.uri(), "CSRF check failed");
                return Box::pin(async move { Ok(rejection.into_response()) });
            }
        }

        let existing = cookie::get(req.headers(), CSRF_COOKIE).filter(|t| self.guard.verify_token(t));
        let issued = existing.is_none().then(|| self.guard.generate_token());
        let token = existing.or_else(|| issued.clone()).unwrap_or_default();
        req.extensions_mut().insert(CsrfToken(token));

        let set_cookie = issued.and_then(|t| self.guard.token_cookie(&t).to_header_value().ok());
        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut response = fut.await?;
            if let Some(value) = set_cookie {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Ok(response)
        })
    }
}

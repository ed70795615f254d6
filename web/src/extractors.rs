//! Custom Axum extractors.
//!
//! - `AppCtx`: the application context the request runs in
//! - `ClientIp`: client address after proxy normalization
//! - `CurrentIdentity`: the (possibly anonymous) identity of the caller
//! - `LoginRequired`: an authenticated identity, or a redirect to the login route
//!
//! # Examples
//!
//! ```ignore
//! use keel_web::extractors::{ClientIp, LoginRequired};
//!
//! async fn dashboard(
//!     LoginRequired(identity): LoginRequired,
//!     client_ip: ClientIp,
//! ) -> Result<Html<String>, AppError> {
//!     tracing::info!(client_ip = %client_ip.0, user = ?identity.identifier(), "Dashboard");
//!     Ok(Html(render_dashboard(&identity).await?))
//! }
//! ```

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
    response::{IntoResponse, Redirect, Response},
};
use keel_auth::{Identity, LoginManager};
use keel_core::context::{self, AppContext};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::error::AppError;
use crate::middleware::Forwarded;

/// The application context of the current request.
#[derive(Debug, Clone)]
pub struct AppCtx(pub Arc<AppContext>);

#[async_trait]
impl<S> FromRequestParts<S> for AppCtx
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(_parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        context::require_current()
            .map(Self)
            .map_err(|e| AppError::internal("no application context").with_source(e))
    }
}

/// Client IP address.
///
/// # Priority
///
/// 1. Address recovered by the proxy fix layer
/// 2. Connection address (when served with `ConnectInfo`)
/// 3. `127.0.0.1`
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub IpAddr);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts
            .extensions
            .get::<Forwarded>()
            .and_then(|forwarded| forwarded.client_ip)
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip())
            })
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        Ok(Self(ip))
    }
}

fn login_manager() -> Result<Arc<LoginManager>, AppError> {
    let ctx = context::require_current()
        .map_err(|e| AppError::internal("no application context").with_source(e))?;
    ctx.require::<LoginManager>()
        .map_err(|e| AppError::internal("login manager is not bound").with_source(e))
}

/// The caller's identity; anonymous without a valid session.
///
/// The identity record is fetched lazily on first use.
#[derive(Debug)]
pub struct CurrentIdentity(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let manager = login_manager()?;
        let identity = manager
            .identity(&parts.headers)
            .await
            .map_err(|e| AppError::internal("session lookup failed").with_source(e))?;
        Ok(Self(identity))
    }
}

/// An authenticated identity.
///
/// Unauthenticated requests are redirected (303) to the login route with the
/// original path in `next`.
#[derive(Debug)]
pub struct LoginRequired(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for LoginRequired
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CurrentIdentity(identity) = CurrentIdentity::from_request_parts(parts, state)
            .await
            .map_err(IntoResponse::into_response)?;

        let authenticated = identity
            .is_authenticated()
            .await
            .map_err(|e| AppError::internal("identity lookup failed").with_source(e).into_response())?;
        if authenticated {
            return Ok(Self(identity));
        }

        let next = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
        match login_manager().map_err(IntoResponse::into_response)?.login_redirect(&next) {
            Some(url) => Err(Redirect::to(&url).into_response()),
            None => Err(AppError::unauthorized("login required").into_response()),
        }
    }
}

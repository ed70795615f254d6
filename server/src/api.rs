//! The `api` route namespace and the SQL-backed user model.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use keel_auth::{AuthError, IdentityLookup, IdentityRecord, LoginManager};
use keel_core::context;
use keel_web::extractors::{AppCtx, LoginRequired};
use keel_web::{AppError, Persistence, RouteNamespace, WebResult};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;

/// Resolves session identifiers against the `users` table.
///
/// The pool is taken from the current application context, so the lookup can
/// be handed to the factory before the persistence extension exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlIdentityLookup;

impl IdentityLookup for SqlIdentityLookup {
    fn lookup<'a>(
        &'a self,
        identifier: &'a str,
    ) -> Pin<Box<dyn Future<Output = keel_auth::Result<Option<IdentityRecord>>> + Send + 'a>> {
        Box::pin(async move {
            let persistence = context::require_current()
                .and_then(|ctx| ctx.require::<Persistence>())
                .map_err(|e| AuthError::Lookup(e.to_string()))?;

            let row: Option<(String, String, String)> = sqlx::query_as(
                "SELECT id::text, email, username FROM users WHERE id::text = $1 AND active",
            )
            .bind(identifier)
            .fetch_optional(persistence.pool())
            .await
            .map_err(|e| AuthError::Lookup(e.to_string()))?;

            Ok(row.map(|(id, email, username)| {
                IdentityRecord::new(id).with_attributes(json!({
                    "email": email,
                    "username": username,
                }))
            }))
        })
    }
}

/// The `api` namespace: `api.login`, `api.logout`, `api.me`, `api.health`.
#[must_use]
pub fn namespace() -> RouteNamespace {
    RouteNamespace::new("api", "/api")
        .route("login", "/login", post(login))
        .route("logout", "/logout", post(logout))
        .route("me", "/me", get(me))
        .route("health", "/health", get(health))
}

/// Body of `POST /api/login`.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

fn login_manager(ctx: &keel_core::AppContext) -> WebResult<std::sync::Arc<LoginManager>> {
    ctx.require::<LoginManager>()
        .map_err(|e| AppError::internal("login manager is not bound").with_source(e))
}

async fn login(AppCtx(ctx): AppCtx, Json(request): Json<LoginRequest>) -> WebResult<Response> {
    let persistence = ctx
        .require::<Persistence>()
        .map_err(|e| AppError::internal("persistence is not bound").with_source(e))?;

    // Passwords are hashed with pgcrypto; the comparison happens in Postgres.
    let user_id: Option<String> = sqlx::query_scalar(
        "SELECT id::text FROM users WHERE email = $1 AND password = crypt($2, password) AND active",
    )
    .bind(&request.email)
    .bind(&request.password)
    .fetch_optional(persistence.pool())
    .await
    .map_err(|e| AppError::internal("credential check failed").with_source(e))?;

    let Some(user_id) = user_id else {
        tracing::info!(email = %request.email, "Rejected login");
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid email or password" })),
        )
            .into_response());
    };

    let (_session, cookie) = login_manager(&ctx)?
        .login(&user_id)
        .await
        .map_err(|e| AppError::internal("session could not be created").with_source(e))?;
    let cookie = cookie
        .to_header_value()
        .map_err(|e| AppError::internal("invalid session cookie").with_source(e))?;

    Ok(([(header::SET_COOKIE, cookie)], Json(json!({ "id": user_id }))).into_response())
}

async fn logout(AppCtx(ctx): AppCtx, headers: axum::http::HeaderMap) -> WebResult<Response> {
    let cookie = login_manager(&ctx)?
        .logout(&headers)
        .await
        .map_err(|e| AppError::internal("session could not be ended").with_source(e))?;
    let cookie = cookie
        .to_header_value()
        .map_err(|e| AppError::internal("invalid session cookie").with_source(e))?;

    Ok(([(header::SET_COOKIE, cookie)], StatusCode::NO_CONTENT).into_response())
}

async fn me(LoginRequired(identity): LoginRequired) -> WebResult<Json<IdentityRecord>> {
    let record = identity
        .record()
        .await
        .map_err(|e| AppError::internal("identity lookup failed").with_source(e))?
        .cloned()
        .ok_or_else(|| AppError::unauthorized("session expired"))?;
    Ok(Json(record))
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_endpoints() {
        let api = namespace();
        assert_eq!(api.name(), "api");
        assert_eq!(api.url_for("login"), Some("/api/login"));
        assert_eq!(api.url_for("me"), Some("/api/me"));
    }

    #[tokio::test]
    async fn test_lookup_outside_a_context_fails() {
        let err = SqlIdentityLookup.lookup("1").await.unwrap_err();
        assert!(matches!(err, AuthError::Lookup(_)));
    }
}

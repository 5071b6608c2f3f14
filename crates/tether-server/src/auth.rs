// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Authentication.
//!
//! Three ways in, checked in order:
//! 1. `X-Bridge-Secret` / `X-API-Key` header equal to the configured shared
//!    secret (hooks; compared in constant time via [`subtle`]).
//! 2. `Authorization: Bearer <jwt>` — HS256, claims `sub`/`iat`/`exp`.
//! 3. `?token=<jwt>` query parameter, accepted for the socket upgrade only
//!    (browsers cannot set headers on WebSocket connects).
//!
//! Public routes bypass auth entirely via a literal prefix list — no
//! decorator magic, the list is right here.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// Routes reachable without credentials. `/ws` validates its token inside
/// the upgrade handler; `/uploads` serves image assets referenced from chat.
const PUBLIC_PREFIXES: &[&str] = &["/health", "/auth/login", "/ws", "/uploads"];

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issue a bearer token for `username`. Returns `(token, expires_at)`.
pub fn create_token(
    username: &str,
    secret: &str,
    expiry_hours: i64,
) -> Result<(String, i64), jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let exp = now + expiry_hours * 3600;
    let claims = Claims {
        sub: username.to_string(),
        iat: now,
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, exp))
}

/// Verify a bearer token; `None` for anything expired or malformed.
pub fn verify_token(token: &str, secret: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}

/// Constant-time shared-secret comparison.
pub fn secret_matches(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn header_secret(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-bridge-secret")
        .or_else(|| headers.get("x-api-key"))
        .and_then(|v| v.to_str().ok())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn is_public(path: &str) -> bool {
    path == "/" || PUBLIC_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Who a request authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Shared-secret caller (a hook script or trusted automation).
    Secret,
    /// Bearer-token user.
    User(String),
}

/// Resolve credentials on a request. `None` means unauthenticated.
pub fn authenticate(headers: &HeaderMap, state: &AppState) -> Option<Principal> {
    if let Some(provided) = header_secret(headers) {
        if secret_matches(provided, &state.config.bridge_secret) {
            return Some(Principal::Secret);
        }
    }
    if let Some(token) = bearer_token(headers) {
        if let Some(claims) = verify_token(token, &state.config.jwt_secret) {
            return Some(Principal::User(claims.sub));
        }
    }
    None
}

/// UI-group middleware: bearer token or shared secret, public prefixes
/// bypassed.
pub async fn require_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if is_public(req.uri().path()) {
        return next.run(req).await;
    }
    match authenticate(req.headers(), &state) {
        Some(_) => next.run(req).await,
        None => {
            warn!(path = %req.uri().path(), "unauthenticated request");
            ApiError::unauthorized("Not authenticated").into_response()
        }
    }
}

/// Hook-group middleware: shared secret only, always.
pub async fn require_secret(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let ok = header_secret(req.headers())
        .is_some_and(|provided| secret_matches(provided, &state.config.bridge_secret));
    if ok {
        next.run(req).await
    } else {
        warn!(path = %req.uri().path(), "hook request with bad secret");
        ApiError::unauthorized("Invalid bridge secret").into_response()
    }
}

// ── Auth endpoints ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: i64,
}

pub async fn login(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<LoginRequest>,
) -> Result<axum::Json<TokenResponse>, ApiError> {
    let user_ok = secret_matches(&body.username, &state.config.auth_username);
    let pass_ok = secret_matches(&body.password, &state.config.auth_password);
    if !(user_ok && pass_ok) {
        warn!(username = %body.username, "login failed");
        return Err(ApiError::unauthorized("Invalid credentials"));
    }
    let (token, expires_at) = create_token(
        &body.username,
        &state.config.jwt_secret,
        state.config.jwt_expiry_hours,
    )
    .map_err(|e| ApiError::internal(format!("token issue failed: {e}")))?;
    Ok(axum::Json(TokenResponse { token, expires_at }))
}

pub async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    match authenticate(&headers, &state) {
        Some(Principal::User(username)) => Ok(axum::Json(serde_json::json!({
            "valid": true,
            "username": username,
        }))),
        Some(Principal::Secret) => Ok(axum::Json(serde_json::json!({
            "valid": true,
            "username": "api_key",
        }))),
        None => Err(ApiError::unauthorized("Not authenticated")),
    }
}

pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::Json<TokenResponse>, ApiError> {
    let username = match authenticate(&headers, &state) {
        Some(Principal::User(username)) => username,
        Some(Principal::Secret) => "api_key".to_string(),
        None => return Err(ApiError::unauthorized("Not authenticated")),
    };
    let (token, expires_at) = create_token(
        &username,
        &state.config.jwt_secret,
        state.config.jwt_expiry_hours,
    )
    .map_err(|e| ApiError::internal(format!("token issue failed: {e}")))?;
    Ok(axum::Json(TokenResponse { token, expires_at }))
}

// ── Unit tests ────────────────────────────────────────────────────────────────

//! Identity endpoints: login, refresh, logout, and the protected claim
//! echoes. A thin layer over the token authority; the gateway core never
//! sees raw credentials beyond this module.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::auth::{extract_bearer, Claims, TokenVerifier};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::snapshot::ConfigSnapshot;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

/// Verify the bearer credential in `headers` against the snapshot's
/// authority.
pub fn authenticate(snapshot: &ConfigSnapshot, headers: &HeaderMap) -> GatewayResult<Claims> {
    let token = extract_bearer(headers.get("authorization").and_then(|v| v.to_str().ok()))?;
    Ok(snapshot.authority.verify(token)?)
}

/// `POST /auth/login`
// TODO: replace the static demo credential with a pluggable identity
// backend lookup.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> GatewayResult<Json<Value>> {
    let snapshot = state.snapshots.current();

    if request.username != "admin" || request.password != "password" {
        return Err(GatewayError::credential("unknown username or password"));
    }

    let token = snapshot.authority.issue(
        &request.username,
        &request.username,
        vec!["admin".to_string(), "user".to_string()],
        HashMap::new(),
    )?;

    Ok(Json(json!({
        "token": token,
        "type": "Bearer",
        "expires_in": snapshot.authority.token_ttl().as_secs(),
    })))
}

/// `POST /auth/refresh`
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let snapshot = state.snapshots.current();
    let token = extract_bearer(headers.get("authorization").and_then(|v| v.to_str().ok()))?;
    let refreshed = snapshot.authority.refresh(token)?;

    Ok(Json(json!({
        "token": refreshed,
        "type": "Bearer",
        "expires_in": snapshot.authority.token_ttl().as_secs(),
    })))
}

/// `POST /auth/logout`
///
/// Tokens are stateless; logout acknowledges and lets the credential age
/// out.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> GatewayResult<Json<Value>> {
    let snapshot = state.snapshots.current();
    let claims = authenticate(&snapshot, &headers)?;
    Ok(Json(json!({
        "message": "logged out",
        "subject": claims.subject,
    })))
}

/// `GET /api/profile`
pub async fn profile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let snapshot = state.snapshots.current();
    let claims = authenticate(&snapshot, &headers)?;

    Ok(Json(json!({
        "subject": claims.subject,
        "name": claims.name,
        "roles": claims.roles,
        "attributes": claims.attributes,
    })))
}

/// `GET /api/validate`
pub async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let snapshot = state.snapshots.current();
    let claims = authenticate(&snapshot, &headers)?;

    Ok(Json(json!({
        "valid": true,
        "subject": claims.subject,
        "expires_at": claims.expires_at.to_rfc3339(),
    })))
}

// Used by the admin module for its role gate.
pub(super) fn snapshot_of(state: &AppState) -> Arc<ConfigSnapshot> {
    state.snapshots.current()
}

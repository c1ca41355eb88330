//! Admin surface: configuration, service, breaker, and rate-limit
//! management. Every operation requires an identity holding one of the
//! configured admin roles.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use super::{identity, AppState};
use crate::auth::{Claims, RoleRequirement};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::snapshot::{self, ConfigSnapshot};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/config", get(get_config))
        .route("/config/reload", post(reload_config))
        .route("/services", get(list_services))
        .route("/circuit-breakers", get(list_breakers))
        .route("/circuit-breakers/:name/reset", post(reset_breaker))
        .route("/rate-limits", get(rate_limit_stats))
        .route("/rate-limits/:key/reset", post(reset_rate_limit))
}

/// Authenticate and require an admin role (any-of).
fn require_admin(snapshot: &ConfigSnapshot, headers: &HeaderMap) -> GatewayResult<Claims> {
    let claims = identity::authenticate(snapshot, headers)?;
    let requirement = RoleRequirement::AnyOf(snapshot.config().auth.admin_roles.clone());
    if !requirement.satisfied_by(&claims) {
        return Err(GatewayError::forbidden(format!(
            "admin role required, '{}' has none",
            claims.subject
        )));
    }
    Ok(claims)
}

/// `GET /admin/config`: the active configuration with secrets masked.
async fn get_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let snapshot = identity::snapshot_of(&state);
    require_admin(&snapshot, &headers)?;

    let mut config = snapshot.config().clone();
    if !config.auth.secret.is_empty() {
        config.auth.secret = "<redacted>".to_string();
    }
    Ok(Json(serde_json::to_value(&config)?))
}

/// `POST /admin/config/reload`: reload from disk and publish atomically.
async fn reload_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let snapshot = identity::snapshot_of(&state);
    let claims = require_admin(&snapshot, &headers)?;

    let services = snapshot::reload(&state.config_path, &state.snapshots, &state.events).await?;
    info!(subject = %claims.subject, services, "configuration reloaded via admin");
    Ok(Json(json!({
        "message": "configuration reloaded",
        "services": services,
    })))
}

/// `GET /admin/services`
async fn list_services(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let snapshot = identity::snapshot_of(&state);
    require_admin(&snapshot, &headers)?;

    let services: Vec<Value> = snapshot
        .services()
        .values()
        .map(|handle| {
            let endpoints: Vec<Value> = handle
                .balancer
                .endpoints()
                .iter()
                .map(|e| {
                    json!({
                        "url": e.url().to_string(),
                        "healthy": e.is_healthy(),
                        "active_connections": e.active_connections(),
                        "weight": e.weight(),
                    })
                })
                .collect();
            json!({
                "name": handle.name,
                "policy": handle.spec.load_balancer,
                "timeout_secs": handle.spec.timeout.as_secs(),
                "retries": handle.spec.retries,
                "breaker": handle.breaker.as_ref().map(|b| b.snapshot()),
                "endpoints": endpoints,
            })
        })
        .collect();

    Ok(Json(json!({ "services": services })))
}

/// `GET /admin/circuit-breakers`
async fn list_breakers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let snapshot = identity::snapshot_of(&state);
    require_admin(&snapshot, &headers)?;

    let breakers: Vec<Value> = snapshot
        .services()
        .values()
        .filter_map(|handle| handle.breaker.as_ref())
        .map(|breaker| serde_json::to_value(breaker.snapshot()).unwrap_or(Value::Null))
        .collect();

    Ok(Json(json!({ "circuit_breakers": breakers })))
}

/// `POST /admin/circuit-breakers/{name}/reset`: a true reset. State goes
/// to Closed and every counter is zeroed.
async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let snapshot = identity::snapshot_of(&state);
    let claims = require_admin(&snapshot, &headers)?;

    let handle = snapshot
        .service(&name)
        .ok_or_else(|| GatewayError::UnknownService {
            service: name.clone(),
        })?;
    let breaker = handle
        .breaker
        .as_ref()
        .ok_or_else(|| GatewayError::UnknownService {
            service: format!("{} (no circuit breaker configured)", name),
        })?;

    breaker.reset();
    info!(subject = %claims.subject, service = %name, "circuit breaker reset via admin");
    Ok(Json(json!({ "message": "circuit breaker reset", "service": name })))
}

/// `GET /admin/rate-limits`
async fn rate_limit_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let snapshot = identity::snapshot_of(&state);
    require_admin(&snapshot, &headers)?;
    Ok(Json(snapshot.limiter.stats()))
}

/// `POST /admin/rate-limits/{key}/reset`
async fn reset_rate_limit(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let snapshot = identity::snapshot_of(&state);
    let claims = require_admin(&snapshot, &headers)?;

    snapshot.limiter.reset(&key).await;
    info!(subject = %claims.subject, key = %key, "rate limit reset via admin");
    Ok(Json(json!({ "message": "rate limit reset", "key": key })))
}

//! Identity endpoints and the admin surface: login/refresh/logout, role
//! gating, breaker reset, rate-limit reset, and config reload.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{Response, StatusCode};
use tokio::sync::broadcast;
use tower::ServiceExt;

use edge_gateway::balance::spawn_health_applier;
use edge_gateway::core::snapshot::{ConfigSnapshot, SnapshotHandle};
use edge_gateway::gateway::server::build_router;
use edge_gateway::gateway::AppState;
use edge_gateway::pipeline::Pipeline;
use edge_gateway::proxy::Forwarder;
use edge_gateway::GatewayConfig;

fn test_config() -> GatewayConfig {
    let yaml = r#"
auth:
  secret: "admin-api-test-secret"
rate_limit:
  default:
    requests: 1000
    window: 1s
    burst: 1000
services:
  orders:
    urls: ["http://127.0.0.1:9"]
    circuit_breaker:
      enabled: true
      failure_threshold: 1
      open_duration: 60s
      half_open_probes: 1
"#;
    serde_yaml::from_str(yaml).unwrap()
}

async fn make_state(config: GatewayConfig) -> AppState {
    let (events, _) = broadcast::channel(64);
    let snapshot = ConfigSnapshot::build(config, Some(events.clone()))
        .await
        .unwrap();
    let snapshots = Arc::new(SnapshotHandle::new(snapshot));
    let (health_tx, _task) = spawn_health_applier(Arc::clone(&snapshots), events.clone());
    let forwarder = Arc::new(Forwarder::new(health_tx));
    let pipeline = Arc::new(Pipeline::new(forwarder, events.clone()));

    AppState {
        snapshots,
        pipeline,
        events,
        metrics: None,
        config_path: PathBuf::from("unused.yaml"),
    }
}

async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(path: &str, body: serde_json::Value) -> Request {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_with_token(path: &str, token: Option<&str>) -> Request {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn post_with_token(path: &str, token: &str) -> Request {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

/// Log in with the demo admin credential and return the token.
async fn admin_token(router: &axum::Router) -> String {
    let response = router
        .clone()
        .oneshot(post_json(
            "/auth/login",
            serde_json::json!({"username": "admin", "password": "password"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_login_rejects_bad_credentials() {
    let router = build_router(make_state(test_config()).await);

    let response = router
        .oneshot(post_json(
            "/auth/login",
            serde_json::json!({"username": "admin", "password": "wrong"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_then_profile_round_trip() {
    let router = build_router(make_state(test_config()).await);
    let token = admin_token(&router).await;

    let response = router
        .clone()
        .oneshot(get_with_token("/api/profile", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["subject"], "admin");
    assert!(body["roles"]
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r == "admin"));

    let response = router
        .oneshot(get_with_token("/api/validate", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["valid"], true);
}

#[tokio::test]
async fn test_logout_requires_credential() {
    let router = build_router(make_state(test_config()).await);
    let token = admin_token(&router).await;

    let response = router
        .clone()
        .oneshot(post_with_token("/auth/logout", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(Request::builder()
            .method("POST")
            .uri("/auth/logout")
            .body(Body::empty())
            .unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_surface_requires_admin_role() {
    let state = make_state(test_config()).await;
    let router = build_router(state.clone());

    // No credential.
    let response = router
        .clone()
        .oneshot(get_with_token("/admin/services", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Authenticated, wrong role.
    let user_token = state
        .snapshots
        .current()
        .authority
        .issue("user-9", "Plain User", vec!["user".into()], Default::default())
        .unwrap();
    let response = router
        .clone()
        .oneshot(get_with_token("/admin/services", Some(&user_token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Admin role passes.
    let token = admin_token(&router).await;
    let response = router
        .oneshot(get_with_token("/admin/services", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_config_masks_secret() {
    let router = build_router(make_state(test_config()).await);
    let token = admin_token(&router).await;

    let response = router
        .oneshot(get_with_token("/admin/config", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["auth"]["secret"], "<redacted>");
}

#[tokio::test]
async fn test_admin_breaker_reset_closes_breaker() {
    let state = make_state(test_config()).await;
    let router = build_router(state.clone());
    let token = admin_token(&router).await;

    // Trip the breaker directly (threshold 1).
    let snapshot = state.snapshots.current();
    let breaker = snapshot.service("orders").unwrap().breaker.clone().unwrap();
    breaker.try_acquire().unwrap();
    breaker.record_failure();
    assert!(breaker.is_open());

    let response = router
        .clone()
        .oneshot(post_with_token(
            "/admin/circuit-breakers/orders/reset",
            &token,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!breaker.is_open());

    // Unknown service is a 404.
    let response = router
        .oneshot(post_with_token("/admin/circuit-breakers/ghost/reset", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_rate_limit_stats_and_reset() {
    let state = make_state(test_config()).await;
    let router = build_router(state.clone());
    let token = admin_token(&router).await;

    let response = router
        .clone()
        .oneshot(get_with_token("/admin/rate-limits", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["enabled"], true);
    assert_eq!(body["algorithm"], "token_bucket");

    let response = router
        .oneshot(post_with_token("/admin/rate-limits/ip:1.2.3.4/reset", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_reload_applies_new_config_file() {
    let dir = std::env::temp_dir().join(format!("edge-gateway-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("gateway.yaml");

    std::fs::write(
        &path,
        r#"
auth:
  secret: "admin-api-test-secret"
services:
  orders:
    urls: ["http://127.0.0.1:9"]
  users:
    urls: ["http://127.0.0.1:9"]
"#,
    )
    .unwrap();

    let mut state = make_state(test_config()).await;
    state.config_path = path.clone();
    let router = build_router(state.clone());
    let token = admin_token(&router).await;

    assert!(state.snapshots.current().service("users").is_none());

    let response = router
        .clone()
        .oneshot(post_with_token("/admin/config/reload", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["services"], 2);
    assert!(state.snapshots.current().service("users").is_some());

    // An invalid file is rejected and the active snapshot survives.
    std::fs::write(&path, "services:\n  broken:\n    urls: []\n").unwrap();
    let response = router
        .oneshot(post_with_token("/admin/config/reload", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(state.snapshots.current().service("users").is_some());

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_refresh_rejects_token_far_from_expiry() {
    // Default refresh window (15m) is far smaller than the default TTL
    // (1h), so a freshly issued token cannot refresh.
    let router = build_router(make_state(test_config()).await);
    let token = admin_token(&router).await;

    let response = router
        .oneshot(post_with_token("/auth/refresh", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_info_endpoint() {
    let router = build_router(make_state(test_config()).await);
    let response = router
        .oneshot(get_with_token("/info", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["name"], "edge-gateway");
    assert_eq!(body["services"], 1);
}

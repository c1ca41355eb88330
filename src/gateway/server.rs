//! HTTP server wiring.
//!
//! Reserved paths are regular axum routes; everything else falls through to
//! the pipeline, which captures the current configuration snapshot at entry
//! and keeps it for the request's lifetime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{admin, identity, AppState};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestContext;

/// Build the gateway router over the shared state.
pub fn build_router(state: AppState) -> Router {
    let cors_enabled = state.snapshots.current().config().server.cors.enabled;

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_exposition))
        .route("/info", get(gateway_info))
        .route("/auth/login", post(identity::login))
        .route("/auth/refresh", post(identity::refresh))
        .route("/auth/logout", post(identity::logout))
        .route("/api/profile", get(identity::profile))
        .route("/api/validate", get(identity::validate))
        .nest("/admin", admin::router())
        .fallback(proxy_fallback)
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    if cors_enabled {
        // Preflight requests short-circuit here, before the pipeline.
        router = router.layer(CorsLayer::permissive());
    }

    router
}

/// The running server.
pub struct GatewayServer {
    addr: SocketAddr,
    shutdown_grace: std::time::Duration,
    router: Router,
}

impl GatewayServer {
    pub fn new(state: AppState) -> GatewayResult<Self> {
        let config = state.snapshots.current().config().server.clone();
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| GatewayError::config(format!("invalid bind address: {}", e)))?;

        Ok(Self {
            addr,
            shutdown_grace: config.shutdown_grace,
            router: build_router(state),
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until a shutdown signal arrives, then drain in-flight requests
    /// for at most the configured grace period.
    pub async fn start(self) -> GatewayResult<()> {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            GatewayError::internal(format!("failed to bind {}: {}", self.addr, e))
        })?;
        info!(addr = %self.addr, "gateway listening");

        let shutdown = Arc::new(tokio::sync::Notify::new());

        let signal_notify = Arc::clone(&shutdown);
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_notify.notify_waiters();
        });

        let drain_notify = Arc::clone(&shutdown);
        let serve = axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            drain_notify.notified().await;
        });
        let serve = async move { serve.await };

        let grace = self.shutdown_grace;
        let grace_expired = async move {
            shutdown.notified().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = serve => {
                result.map_err(|e| GatewayError::internal(format!("server error: {}", e)))?;
            }
            _ = grace_expired => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "shutdown grace expired with requests still in flight"
                );
            }
        }

        info!("gateway shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received interrupt, shutting down"),
        _ = terminate => info!("received terminate, shutting down"),
    }
}

/// Catch-all: run the pipeline against the captured snapshot.
async fn proxy_fallback(State(state): State<AppState>, request: Request) -> Response {
    let snapshot = state.snapshots.current();
    let (parts, body) = request.into_parts();

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));

    let ctx = RequestContext::new(
        parts.method,
        parts.uri,
        parts.headers,
        remote_addr,
        body,
        snapshot.config().server.request_timeout,
    );

    state.pipeline.execute(&snapshot, ctx).await
}

/// Liveness: 200 always, with per-service health detail.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.snapshots.current();
    let services: HashMap<String, &'static str> = snapshot
        .service_health()
        .into_iter()
        .map(|(name, healthy)| (name, if healthy { "healthy" } else { "unhealthy" }))
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
            "services": services,
        })),
    )
}

/// Prometheus text exposition.
async fn metrics_exposition(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => {
            let mut response = Response::new(Body::from(handle.render()));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn gateway_info(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.snapshots.current();
    Json(json!({
        "name": "edge-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "services": snapshot.services().len(),
        "features": [
            "rate_limiting",
            "load_balancing",
            "circuit_breaker",
            "streaming_proxy",
            "hot_reload",
        ],
    }))
}

//! # Request Pipeline Module
//!
//! The pipeline is an ordered sequence of stages executed per request. Each
//! stage either continues the chain or writes a terminal response; a stage
//! that responds never invokes its successors. Stage order is fixed:
//!
//! 1. request identifier
//! 2. rate limit
//! 3. identity (protected prefixes only)
//! 4. role check (services with role requirements only)
//! 5. proxy dispatch
//!
//! The executor owns the concerns that need the final outcome: the access
//! log, the latency histogram, the `X-Request-Id` response header, and the
//! panic barrier that converts any unrecovered stage fault into a 500.
//! CORS preflight short-circuiting sits in front of the pipeline as a tower
//! layer.

pub mod stages;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{error, info};

use crate::core::error::GatewayResult;
use crate::core::snapshot::ConfigSnapshot;
use crate::core::types::{EventPublisher, RequestContext};
use crate::proxy::Forwarder;
use self::stages::{IdentityStage, ProxyStage, RateLimitStage, RequestIdStage, RoleCheckStage};

/// What a stage decided.
pub enum StageFlow {
    /// Invoke the continuation (the next stage).
    Continue,
    /// Terminal response; downstream stages do not execute.
    Respond(Response),
}

/// One pipeline stage.
///
/// Stages receive the request context and the configuration snapshot the
/// request captured at entry; they must not retain either beyond the call.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        snapshot: &ConfigSnapshot,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow>;
}

/// Fixed-order pipeline executor.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new(forwarder: Arc<Forwarder>, events: EventPublisher) -> Self {
        Self {
            stages: vec![
                Arc::new(RequestIdStage),
                Arc::new(RateLimitStage::new(events)),
                Arc::new(IdentityStage),
                Arc::new(RoleCheckStage),
                Arc::new(ProxyStage::new(forwarder)),
            ],
        }
    }

    /// Custom stage set, used by tests.
    pub fn with_stages(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Run the request through the pipeline and produce the final response.
    pub async fn execute(&self, snapshot: &ConfigSnapshot, mut ctx: RequestContext) -> Response {
        let method = ctx.method.clone();
        let path = ctx.path().to_string();
        let remote = ctx.remote_addr;
        let request_id = ctx.request_id.clone();

        let chain = async {
            for stage in &self.stages {
                match stage.handle(snapshot, &mut ctx).await {
                    Ok(StageFlow::Continue) => continue,
                    Ok(StageFlow::Respond(response)) => return response,
                    Err(err) => return err.into_response(),
                }
            }
            // The proxy dispatch stage always responds; reaching the end of
            // the chain means the pipeline was misassembled.
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        };

        let started = std::time::Instant::now();
        let mut response = match AssertUnwindSafe(chain).catch_unwind().await {
            Ok(response) => response,
            Err(_panic) => {
                error!(request_id = %request_id, method = %method, path = %path,
                    "panic crossed a pipeline stage");
                counter!("gateway_panics_total").increment(1);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(json!({
                        "error": {
                            "code": 500,
                            "type": "internal_error",
                            "message": "internal server error",
                        }
                    })),
                )
                    .into_response()
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response.headers_mut().insert(
            "x-gateway",
            HeaderValue::from_static(crate::proxy::headers::GATEWAY_NAME),
        );

        let elapsed = started.elapsed();
        let status = response.status();
        counter!("gateway_requests_total",
            "method" => method.to_string(), "status" => status.as_u16().to_string())
        .increment(1);
        histogram!("gateway_request_duration_seconds", "method" => method.to_string())
            .record(elapsed.as_secs_f64());

        info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms = elapsed.as_millis() as u64,
            remote = %remote,
            "request completed"
        );

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Method};
    use std::time::Duration;

    struct PanickingStage;

    #[async_trait]
    impl Stage for PanickingStage {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn handle(
            &self,
            _snapshot: &ConfigSnapshot,
            _ctx: &mut RequestContext,
        ) -> GatewayResult<StageFlow> {
            panic!("stage fault");
        }
    }

    struct RespondingStage(StatusCode);

    #[async_trait]
    impl Stage for RespondingStage {
        fn name(&self) -> &'static str {
            "responding"
        }

        async fn handle(
            &self,
            _snapshot: &ConfigSnapshot,
            _ctx: &mut RequestContext,
        ) -> GatewayResult<StageFlow> {
            Ok(StageFlow::Respond(self.0.into_response()))
        }
    }

    async fn empty_snapshot() -> Arc<ConfigSnapshot> {
        let mut config = crate::core::config::GatewayConfig::default();
        config.auth.secret = "pipeline-test-secret".into();
        ConfigSnapshot::build(config, None).await.unwrap()
    }

    fn test_context() -> RequestContext {
        RequestContext::new(
            Method::GET,
            "/users/1".parse().unwrap(),
            HeaderMap::new(),
            "127.0.0.1:9000".parse().unwrap(),
            Body::empty(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_panic_barrier_yields_500() {
        let pipeline = Pipeline::with_stages(vec![Arc::new(PanickingStage)]);
        let snapshot = empty_snapshot().await;

        let response = pipeline.execute(&snapshot, test_context()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get("x-request-id").is_some());
    }

    #[tokio::test]
    async fn test_terminal_stage_short_circuits() {
        let pipeline = Pipeline::with_stages(vec![
            Arc::new(RespondingStage(StatusCode::IM_A_TEAPOT)),
            Arc::new(PanickingStage),
        ]);
        let snapshot = empty_snapshot().await;

        // The panicking stage never runs.
        let response = pipeline.execute(&snapshot, test_context()).await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn test_response_carries_request_id() {
        let pipeline = Pipeline::with_stages(vec![Arc::new(RespondingStage(StatusCode::OK))]);
        let snapshot = empty_snapshot().await;

        let ctx = test_context();
        let expected = ctx.request_id.clone();
        let response = pipeline.execute(&snapshot, ctx).await;
        assert_eq!(
            response.headers().get("x-request-id").unwrap().to_str().unwrap(),
            expected
        );
    }
}

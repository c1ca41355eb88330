//! # Reverse Proxy Forwarder
//!
//! Bridges the rate limiter, load balancer, and circuit breaker with actual
//! upstream I/O. One operation: [`Forwarder::forward`].
//!
//! Per request: resolve the service from the first path segment, pick an
//! endpoint, enter the breaker, rewrite headers, stream the body upstream
//! under the request deadline, and stream the response back. Retries live
//! here and nowhere else: only the forwarder knows whether any request-body
//! bytes have been sent. The breaker sees the final outcome, not each
//! attempt.

pub mod headers;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use futures::StreamExt;
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::balance::{HealthEvent, HealthSender, UpstreamEndpoint};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::snapshot::{ConfigSnapshot, ServiceHandle};
use crate::core::types::RequestContext;

/// Methods eligible for transport-error retries.
fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET
        || *method == Method::HEAD
        || *method == Method::PUT
        || *method == Method::DELETE
        || *method == Method::OPTIONS
}

/// Releases the endpoint's active-connection slot when the response body
/// finishes streaming (or is dropped mid-flight).
struct ReleaseGuard {
    handle: Arc<ServiceHandle>,
    endpoint: Arc<UpstreamEndpoint>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.handle.balancer.release(&self.endpoint);
    }
}

enum AttemptError {
    Transport(reqwest::Error),
    Timeout(Duration),
}

/// The streaming reverse-proxy forwarder.
pub struct Forwarder {
    client: reqwest::Client,
    health_tx: HealthSender,
}

impl Forwarder {
    pub fn new(health_tx: HealthSender) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client, health_tx }
    }

    /// Forward the request to a healthy upstream of its service.
    pub async fn forward(
        &self,
        snapshot: &ConfigSnapshot,
        ctx: &mut RequestContext,
    ) -> GatewayResult<Response> {
        let service_name = ctx
            .first_path_segment()
            .ok_or_else(|| GatewayError::UnknownService {
                service: "/".to_string(),
            })?
            .to_string();
        let handle = snapshot
            .service(&service_name)
            .ok_or_else(|| GatewayError::UnknownService {
                service: service_name.clone(),
            })?;
        ctx.service = Some(service_name.clone());

        let first_target =
            handle
                .balancer
                .next_target()
                .ok_or_else(|| GatewayError::NoHealthyUpstream {
                    service: service_name.clone(),
                })?;

        if let Some(breaker) = &handle.breaker {
            if let Err(open) = breaker.try_acquire() {
                handle.balancer.release(&first_target);
                return Err(GatewayError::BreakerOpen {
                    service: service_name,
                    retry_after: open.retry_after,
                });
            }
        }

        let started = std::time::Instant::now();
        let result = self.run_attempts(&handle, first_target, ctx).await;

        // The breaker records the final outcome only; 4xx responses are not
        // failures.
        if let Some(breaker) = &handle.breaker {
            match &result {
                Ok(response) if response.status().as_u16() >= 500 => breaker.record_failure(),
                Ok(_) => breaker.record_success(),
                Err(_) => breaker.record_failure(),
            }
        }

        histogram!("gateway_upstream_duration_seconds", "service" => service_name.clone())
            .record(started.elapsed().as_secs_f64());
        match &result {
            Ok(response) => {
                counter!("gateway_upstream_requests_total",
                    "service" => service_name.clone(),
                    "status" => response.status().as_u16().to_string())
                .increment(1);
            }
            Err(err) => {
                counter!("gateway_upstream_errors_total",
                    "service" => service_name.clone(),
                    "kind" => err.error_type())
                .increment(1);
            }
        }

        result
    }

    /// Attempt loop: the first target is already selected (and its active
    /// slot held); transport-error retries re-enter the balancer.
    async fn run_attempts(
        &self,
        handle: &Arc<ServiceHandle>,
        first_target: Arc<UpstreamEndpoint>,
        ctx: &mut RequestContext,
    ) -> GatewayResult<Response> {
        let service = handle.name.clone();
        let mut body = ctx.take_body();

        // A retry can only replay a body that was never sent. Idempotent
        // methods with no request body qualify; everything else gets exactly
        // one attempt.
        let has_body = ctx
            .headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .map(|v| v != "0")
            .unwrap_or_else(|| ctx.headers.contains_key("transfer-encoding"));
        let replayable = is_idempotent(&ctx.method) && !has_body;
        let max_attempts = if replayable {
            handle.spec.retries.saturating_add(1)
        } else {
            1
        };

        let mut target = first_target;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let attempt_body = if replayable {
                reqwest::Body::default()
            } else {
                match body.take() {
                    Some(b) => reqwest::Body::wrap_stream(b.into_data_stream()),
                    None => reqwest::Body::default(),
                }
            };

            match self.attempt(handle, &target, ctx, attempt_body).await {
                Ok(response) => {
                    return Ok(self.client_response(handle, target, ctx, response));
                }
                Err(AttemptError::Timeout(timeout)) => {
                    // Deadline expiry is terminal: the time budget is spent.
                    handle.balancer.release(&target);
                    return Err(GatewayError::UpstreamTimeout {
                        service,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                Err(AttemptError::Transport(source)) => {
                    handle.balancer.release(&target);
                    self.report_unhealthy(&service, &target);
                    warn!(
                        service = %service,
                        endpoint = %target.url(),
                        attempt,
                        error = %source,
                        "upstream transport error"
                    );

                    if attempt >= max_attempts {
                        return Err(GatewayError::UpstreamTransport { service, source });
                    }
                    match handle.balancer.next_target() {
                        Some(next) => target = next,
                        None => {
                            return Err(GatewayError::UpstreamTransport { service, source })
                        }
                    }
                }
            }
        }
    }

    /// One upstream exchange under the request deadline.
    async fn attempt(
        &self,
        handle: &Arc<ServiceHandle>,
        target: &Arc<UpstreamEndpoint>,
        ctx: &RequestContext,
        body: reqwest::Body,
    ) -> Result<reqwest::Response, AttemptError> {
        // Deadline: min(service timeout, remaining context deadline).
        let deadline = handle.spec.timeout.min(ctx.remaining_deadline());
        if deadline.is_zero() {
            return Err(AttemptError::Timeout(handle.spec.timeout));
        }

        let mut url = target.url().clone();
        url.set_path(ctx.uri.path());
        url.set_query(ctx.uri.query());

        let outbound = headers::outbound_headers(ctx);
        debug!(
            endpoint = %target.url(),
            path = %ctx.uri.path(),
            deadline_ms = deadline.as_millis() as u64,
            "forwarding to upstream"
        );

        let request = self
            .client
            .request(ctx.method.clone(), url)
            .headers(outbound)
            .body(body);

        match tokio::time::timeout(deadline, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(AttemptError::Transport(source)),
            Err(_elapsed) => Err(AttemptError::Timeout(deadline)),
        }
    }

    /// Convert the upstream response into the client response, streaming the
    /// body and releasing the endpoint when the stream completes.
    fn client_response(
        &self,
        handle: &Arc<ServiceHandle>,
        target: Arc<UpstreamEndpoint>,
        ctx: &RequestContext,
        upstream: reqwest::Response,
    ) -> Response {
        let status = upstream.status();
        let mut response_headers: HeaderMap = upstream.headers().clone();
        headers::scrub_response(&mut response_headers, &ctx.request_id);

        let guard = ReleaseGuard {
            handle: Arc::clone(handle),
            endpoint: target,
        };
        let stream = upstream.bytes_stream().map(move |chunk| {
            // Guard lives as long as the stream; dropping the stream (client
            // gone or body finished) releases the endpoint.
            let _held = &guard;
            chunk
        });

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }

    fn report_unhealthy(&self, service: &str, target: &Arc<UpstreamEndpoint>) {
        let _ = self.health_tx.send(HealthEvent {
            service: service.to_string(),
            endpoint: target.url().clone(),
            healthy: false,
        });
    }
}

//! # Core Types Module
//!
//! Foundational types shared across the request-processing engine: the
//! per-request context that flows through the pipeline, and the gateway
//! event bus used as a fire-and-forget sink for state changes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, Method, Uri};
use uuid::Uuid;

use crate::auth::Claims;

/// Per-request record carried through every pipeline stage.
///
/// The context is created when a request is accepted and destroyed once the
/// response writer is flushed. Stages mutate it in place; none of them
/// retains a reference beyond their call.
pub struct RequestContext {
    /// Unique identifier assigned at the edge, echoed as `X-Request-Id`.
    pub request_id: String,

    /// When the request was accepted.
    pub received_at: Instant,

    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,

    /// Client remote address, used for `ip:` rate-limit keys and
    /// `X-Forwarded-For`.
    pub remote_addr: SocketAddr,

    /// Whether the inbound transport was TLS (drives `X-Forwarded-Proto`).
    pub tls: bool,

    /// Identity claims, present once the identity stage has run.
    pub claims: Option<Arc<Claims>>,

    /// Service name resolved from the first path segment.
    pub service: Option<String>,

    /// Absolute deadline for the whole request.
    pub deadline: Instant,

    /// Request body, taken exactly once by the proxy dispatch stage.
    body: Option<Body>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        remote_addr: SocketAddr,
        body: Body,
        request_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            request_id: Uuid::new_v4().to_string(),
            received_at: now,
            method,
            uri,
            headers,
            remote_addr,
            tls: false,
            claims: None,
            service: None,
            deadline: now + request_timeout,
            body: Some(body),
        }
    }

    /// Elapsed time since the request was accepted.
    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// Time remaining until the request deadline, zero if already past.
    pub fn remaining_deadline(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// First path segment, which selects the target service.
    pub fn first_path_segment(&self) -> Option<&str> {
        self.uri
            .path()
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// A header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_claims(&mut self, claims: Claims) {
        self.claims = Some(Arc::new(claims));
    }

    /// Take the request body. Returns `None` on second call; only the proxy
    /// dispatch stage consumes it.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }
}

/// Events published on the gateway's broadcast bus.
///
/// Subscribers are fire-and-forget: a lagging or absent receiver never
/// blocks the hot path.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A circuit breaker moved between states.
    BreakerStateChanged {
        service: String,
        from: &'static str,
        to: &'static str,
    },

    /// An upstream endpoint was marked healthy or unhealthy.
    EndpointHealthChanged {
        service: String,
        endpoint: String,
        healthy: bool,
    },

    /// The rate limiter denied a request.
    RateLimitExceeded { key: String, limit: u32 },

    /// A new configuration snapshot was published.
    ConfigReloaded { services: usize },
}

/// Sender half of the gateway event bus.
pub type EventPublisher = tokio::sync::broadcast::Sender<GatewayEvent>;

/// Receiver half of the gateway event bus.
pub type EventSubscriber = tokio::sync::broadcast::Receiver<GatewayEvent>;

/// Publish an event, ignoring the error when nobody is subscribed.
pub fn publish(publisher: &EventPublisher, event: GatewayEvent) {
    let _ = publisher.send(event);
}

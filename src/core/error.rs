//! # Error Handling Module
//!
//! This module provides comprehensive error handling for the gateway using the
//! `thiserror` crate. It defines every error kind the request-processing engine
//! can produce and maps each one to the HTTP status code returned to clients.
//!
//! Errors are surfaced at the nearest stage that can map them to a client
//! response; transport errors below the proxy are wrapped with the service
//! name so metrics can attribute them.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// All error kinds produced by the request-processing engine.
///
/// Each variant corresponds to one row of the gateway's error table and
/// carries enough context to build the client response (including
/// `Retry-After` hints where the protocol calls for them).
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or malformed bearer credential.
    #[error("invalid credential: {reason}")]
    InvalidCredential { reason: String },

    /// Authenticated but lacking a required role.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// Rate limiter denied the request.
    #[error("rate limit exceeded: {limit} requests per window")]
    RateLimited {
        limit: u32,
        remaining: u32,
        retry_after: Duration,
    },

    /// No route for the first path segment.
    #[error("unknown service: {service}")]
    UnknownService { service: String },

    /// Every endpoint of the service is unhealthy.
    #[error("no healthy upstream for service: {service}")]
    NoHealthyUpstream { service: String },

    /// Circuit breaker short-circuited the call.
    #[error("circuit breaker open for service: {service}")]
    BreakerOpen {
        service: String,
        retry_after: Duration,
    },

    /// Transport-level failure talking to the upstream.
    #[error("upstream transport error for {service}: {source}")]
    UpstreamTransport {
        service: String,
        #[source]
        source: reqwest::Error,
    },

    /// The per-request deadline expired before response headers arrived.
    #[error("upstream timeout for {service} after {timeout_ms}ms")]
    UpstreamTimeout { service: String, timeout_ms: u64 },

    /// Configuration load or validation failure.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Panic-barrier fallback and other unexpected failures.
    #[error("internal server error: {message}")]
    Internal { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GatewayError {
    /// Create a configuration error with a custom message.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an authentication error with a custom reason.
    pub fn credential<S: Into<String>>(reason: S) -> Self {
        Self::InvalidCredential {
            reason: reason.into(),
        }
    }

    /// Create an authorization error with a custom reason.
    pub fn forbidden<S: Into<String>>(reason: S) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    /// The HTTP status code returned to the client for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredential { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UnknownService { .. } => StatusCode::NOT_FOUND,
            Self::NoHealthyUpstream { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTransport { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Yaml(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client may usefully retry the request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::NoHealthyUpstream { .. } => true,
            Self::BreakerOpen { .. } => true,
            Self::UpstreamTimeout { .. } => true,
            Self::UpstreamTransport { source, .. } => source.is_timeout() || source.is_connect(),
            _ => false,
        }
    }

    /// Stable machine-readable error type for API responses.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidCredential { .. } => "invalid_credential",
            Self::Forbidden { .. } => "forbidden",
            Self::RateLimited { .. } => "rate_limited",
            Self::UnknownService { .. } => "unknown_service",
            Self::NoHealthyUpstream { .. } => "no_healthy_upstream",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::UpstreamTransport { .. } => "upstream_transport",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
        }
    }

    /// The `Retry-After` hint in whole seconds, where one applies.
    ///
    /// Durations are rounded up so a client never retries before the
    /// limiter or breaker would actually admit the request.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let d = match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            Self::BreakerOpen { retry_after, .. } => *retry_after,
            _ => return None,
        };
        Some(d.as_secs_f64().ceil().max(1.0) as u64)
    }
}

/// Convert gateway errors into HTTP responses.
///
/// Rate-limit denials carry the `X-RateLimit-*` family and `Retry-After`;
/// breaker short-circuits carry `Retry-After` with the remaining open
/// duration.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = json!({
            "error": {
                "code": status.as_u16(),
                "type": self.error_type(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            }
        });

        let mut response = (status, Json(body)).into_response();

        if let Some(secs) = self.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if let Self::RateLimited {
            limit, remaining, ..
        } = &self
        {
            response.headers_mut().insert(
                "x-ratelimit-limit",
                HeaderValue::from_str(&limit.to_string()).unwrap_or(HeaderValue::from_static("0")),
            );
            response.headers_mut().insert(
                "x-ratelimit-remaining",
                HeaderValue::from_str(&remaining.to_string())
                    .unwrap_or(HeaderValue::from_static("0")),
            );
        }

        response
    }
}

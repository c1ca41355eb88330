//! Header rewriting for proxied requests and responses.
//!
//! Hop-by-hop headers apply to a single transport connection and are
//! stripped in both directions per HTTP/1.1 semantics, including any tokens
//! named by the `Connection` header itself.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use chrono::Utc;

use crate::core::types::RequestContext;

/// Gateway identification value for `X-Gateway`.
pub const GATEWAY_NAME: &str = "edge-gateway";

/// Headers defined by HTTP/1.1 as connection-scoped.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including those nominated by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| token.trim().parse::<HeaderName>().ok())
        .collect();
    for name in nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Build the outbound header set for an upstream call.
///
/// Starts from the inbound headers, strips hop-by-hop and `Host` (the
/// client sets the host from the endpoint authority), then adds the
/// forwarding family.
pub fn outbound_headers(ctx: &RequestContext) -> HeaderMap {
    let mut headers = ctx.headers.clone();
    strip_hop_by_hop(&mut headers);

    let original_host = headers
        .remove("host")
        .unwrap_or_else(|| HeaderValue::from_static(""));

    // X-Forwarded-For: append the immediate client to any existing chain.
    let client_ip = ctx.remote_addr.ip().to_string();
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    if !original_host.is_empty() {
        headers.insert("x-forwarded-host", original_host);
    }
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if ctx.tls { "https" } else { "http" }),
    );

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert("x-request-id", value);
    }
    headers.insert("x-gateway", HeaderValue::from_static(GATEWAY_NAME));
    if let Ok(value) = HeaderValue::from_str(&Utc::now().to_rfc3339()) {
        headers.insert("x-gateway-time", value);
    }

    headers
}

/// Scrub an upstream response before it reaches the client: hop-by-hop
/// headers and sensitive upstream identification go, gateway headers come.
pub fn scrub_response(headers: &mut HeaderMap, request_id: &str) {
    strip_hop_by_hop(headers);
    headers.remove("server");

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
    headers.insert("x-gateway", HeaderValue::from_static(GATEWAY_NAME));
}

//! Built-in pipeline stages, in their fixed execution order.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn, Span};

use super::{Stage, StageFlow};
use crate::auth::{extract_bearer, TokenVerifier};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::snapshot::ConfigSnapshot;
use crate::core::types::{publish, EventPublisher, GatewayEvent, RequestContext};
use crate::proxy::Forwarder;

/// Records the request identifier on the active tracing span.
///
/// The identifier itself is minted with the context at the edge; inbound
/// `X-Request-Id` headers are never trusted.
pub struct RequestIdStage;

#[async_trait]
impl Stage for RequestIdStage {
    fn name(&self) -> &'static str {
        "request_id"
    }

    async fn handle(
        &self,
        _snapshot: &ConfigSnapshot,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        Span::current().record("request_id", ctx.request_id.as_str());
        debug!(request_id = %ctx.request_id, "request accepted");
        Ok(StageFlow::Continue)
    }
}

/// Consults the rate limiter with the request fingerprint.
///
/// Runs before the identity stage, so claims are peeked opportunistically
/// here: a verifiable bearer token upgrades the key from `ip:` to
/// `identity:` and unlocks identity-scoped rules. A token that fails to
/// verify is simply ignored at this point; the identity stage will reject
/// it properly on protected routes.
pub struct RateLimitStage {
    events: EventPublisher,
}

impl RateLimitStage {
    pub fn new(events: EventPublisher) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(
        &self,
        snapshot: &ConfigSnapshot,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        if ctx.claims.is_none() {
            if let Ok(token) = extract_bearer(ctx.header("authorization")) {
                if let Ok(claims) = snapshot.authority.verify(token) {
                    ctx.set_claims(claims);
                }
            }
        }

        let api_key_header = snapshot.config().auth.api_key_header.clone();
        let identity = ctx.claims.as_ref().map(|c| c.subject.clone());
        let api_key = ctx.header(&api_key_header).map(str::to_string);
        let service = ctx.first_path_segment().map(str::to_string);

        let outcome = snapshot
            .limiter
            .check(
                identity.as_deref(),
                api_key.as_deref(),
                ctx.remote_addr.ip(),
                service.as_deref(),
            )
            .await;

        if outcome.decision.allowed {
            return Ok(StageFlow::Continue);
        }

        warn!(key = %outcome.key, limit = outcome.limit, "rate limit exceeded");
        publish(
            &self.events,
            GatewayEvent::RateLimitExceeded {
                key: outcome.key,
                limit: outcome.limit,
            },
        );
        Err(GatewayError::RateLimited {
            limit: outcome.limit,
            remaining: outcome.decision.remaining,
            retry_after: outcome.decision.reset_after,
        })
    }
}

/// Requires a verified identity on protected route prefixes.
pub struct IdentityStage;

#[async_trait]
impl Stage for IdentityStage {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn handle(
        &self,
        snapshot: &ConfigSnapshot,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        let protected = snapshot
            .config()
            .auth
            .protected_prefixes
            .iter()
            .any(|prefix| ctx.path().starts_with(prefix.as_str()));
        if !protected {
            return Ok(StageFlow::Continue);
        }

        if ctx.claims.is_some() {
            // Already verified during the rate-limit peek.
            return Ok(StageFlow::Continue);
        }

        let token = extract_bearer(ctx.header("authorization"))?;
        let claims = snapshot.authority.verify(token)?;
        debug!(subject = %claims.subject, "identity verified");
        ctx.set_claims(claims);
        Ok(StageFlow::Continue)
    }
}

/// Enforces per-service role requirements.
pub struct RoleCheckStage;

#[async_trait]
impl Stage for RoleCheckStage {
    fn name(&self) -> &'static str {
        "role_check"
    }

    async fn handle(
        &self,
        snapshot: &ConfigSnapshot,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        let Some(service) = ctx.first_path_segment() else {
            return Ok(StageFlow::Continue);
        };
        let Some(handle) = snapshot.service(service) else {
            return Ok(StageFlow::Continue);
        };
        let Some(requirement) = &handle.spec.required_roles else {
            return Ok(StageFlow::Continue);
        };

        let claims = match &ctx.claims {
            Some(claims) => Arc::clone(claims),
            None => {
                let token = extract_bearer(ctx.header("authorization"))?;
                let verified = Arc::new(snapshot.authority.verify(token)?);
                ctx.claims = Some(Arc::clone(&verified));
                verified
            }
        };

        if !requirement.satisfied_by(&claims) {
            return Err(GatewayError::forbidden(format!(
                "service '{}' requires roles not granted to '{}'",
                handle.name, claims.subject
            )));
        }
        Ok(StageFlow::Continue)
    }
}

/// Final stage: hand the request to the forwarder.
pub struct ProxyStage {
    forwarder: Arc<Forwarder>,
}

impl ProxyStage {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self { forwarder }
    }
}

#[async_trait]
impl Stage for ProxyStage {
    fn name(&self) -> &'static str {
        "proxy_dispatch"
    }

    async fn handle(
        &self,
        snapshot: &ConfigSnapshot,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        let response = self.forwarder.forward(snapshot, ctx).await?;
        Ok(StageFlow::Respond(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, HeaderValue, Method};
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::core::config::{GatewayConfig, RateLimitRule};

    async fn snapshot_with(mut mutate: impl FnMut(&mut GatewayConfig)) -> Arc<ConfigSnapshot> {
        let mut config = GatewayConfig::default();
        config.auth.secret = "stage-test-secret".into();
        mutate(&mut config);
        ConfigSnapshot::build(config, None).await.unwrap()
    }

    fn context(method: Method, path: &str, headers: HeaderMap) -> RequestContext {
        RequestContext::new(
            method,
            path.parse().unwrap(),
            headers,
            "9.9.9.9:1234".parse().unwrap(),
            Body::empty(),
            Duration::from_secs(5),
        )
    }

    fn bearer(snapshot: &ConfigSnapshot, subject: &str, roles: &[&str]) -> HeaderMap {
        let token = snapshot
            .authority
            .issue(
                subject,
                subject,
                roles.iter().map(|r| r.to_string()).collect(),
                HashMap::new(),
            )
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_identity_stage_passes_unprotected_paths() {
        let snapshot = snapshot_with(|_| {}).await;
        let mut ctx = context(Method::GET, "/public/thing", HeaderMap::new());

        let flow = IdentityStage.handle(&snapshot, &mut ctx).await.unwrap();
        assert!(matches!(flow, StageFlow::Continue));
        assert!(ctx.claims.is_none());
    }

    #[tokio::test]
    async fn test_identity_stage_rejects_missing_credential() {
        let snapshot = snapshot_with(|_| {}).await;
        let mut ctx = context(Method::GET, "/api/profile", HeaderMap::new());

        let err = IdentityStage.handle(&snapshot, &mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_identity_stage_accepts_valid_token() {
        let snapshot = snapshot_with(|_| {}).await;
        let headers = bearer(&snapshot, "user-1", &["user"]);
        let mut ctx = context(Method::GET, "/api/profile", headers);

        let flow = IdentityStage.handle(&snapshot, &mut ctx).await.unwrap();
        assert!(matches!(flow, StageFlow::Continue));
        assert_eq!(ctx.claims.as_ref().unwrap().subject, "user-1");
    }

    #[tokio::test]
    async fn test_rate_limit_stage_denies_over_limit() {
        let snapshot = snapshot_with(|config| {
            config.rate_limit.default = RateLimitRule {
                requests: 2,
                window: Duration::from_secs(60),
                burst: Some(2),
            };
        })
        .await;
        let stage = RateLimitStage::new(tokio::sync::broadcast::channel(8).0);

        for _ in 0..2 {
            let mut ctx = context(Method::GET, "/users/1", HeaderMap::new());
            let flow = stage.handle(&snapshot, &mut ctx).await.unwrap();
            assert!(matches!(flow, StageFlow::Continue));
        }

        let mut ctx = context(Method::GET, "/users/1", HeaderMap::new());
        let err = stage.handle(&snapshot, &mut ctx).await.unwrap_err();
        match err {
            GatewayError::RateLimited { limit, .. } => assert_eq!(limit, 2),
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_stage_uses_identity_key_when_token_present() {
        let snapshot = snapshot_with(|config| {
            config.rate_limit.per_identity.insert(
                "vip".into(),
                RateLimitRule {
                    requests: 1,
                    window: Duration::from_secs(60),
                    burst: Some(1),
                },
            );
        })
        .await;
        let stage = RateLimitStage::new(tokio::sync::broadcast::channel(8).0);

        let headers = bearer(&snapshot, "vip", &[]);
        let mut ctx = context(Method::GET, "/users/1", headers.clone());
        assert!(matches!(
            stage.handle(&snapshot, &mut ctx).await.unwrap(),
            StageFlow::Continue
        ));

        // Second request under the same identity hits the 1-request rule,
        // even from a different IP.
        let mut ctx = RequestContext::new(
            Method::GET,
            "/users/1".parse().unwrap(),
            headers,
            "8.8.8.8:999".parse().unwrap(),
            Body::empty(),
            Duration::from_secs(5),
        );
        assert!(stage.handle(&snapshot, &mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_role_stage_enforces_service_requirement() {
        use crate::auth::RoleRequirement;
        use crate::core::config::ServiceSpec;

        let snapshot = snapshot_with(|config| {
            config.services.insert(
                "billing".into(),
                ServiceSpec {
                    urls: vec!["http://127.0.0.1:9700".into()],
                    load_balancer: crate::core::config::PolicyKind::RoundRobin,
                    weights: None,
                    timeout: Duration::from_secs(5),
                    retries: 0,
                    required_roles: Some(RoleRequirement::AllOf(vec![
                        "billing".into(),
                        "user".into(),
                    ])),
                    circuit_breaker: Default::default(),
                },
            );
        })
        .await;

        // No credential at all: 401.
        let mut ctx = context(Method::GET, "/billing/invoices", HeaderMap::new());
        let err = RoleCheckStage.handle(&snapshot, &mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);

        // Authenticated but missing one required role: 403.
        let headers = bearer(&snapshot, "user-1", &["user"]);
        let mut ctx = context(Method::GET, "/billing/invoices", headers);
        let err = RoleCheckStage.handle(&snapshot, &mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);

        // All-of satisfied: continue.
        let headers = bearer(&snapshot, "user-2", &["user", "billing"]);
        let mut ctx = context(Method::GET, "/billing/invoices", headers);
        assert!(matches!(
            RoleCheckStage.handle(&snapshot, &mut ctx).await.unwrap(),
            StageFlow::Continue
        ));
    }
}

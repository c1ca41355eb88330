//! # Rate Limiting Module
//!
//! The limiter decides allow/deny per request fingerprint. Rules compose
//! across three scopes with an explicit resolution order: an identity-scoped
//! rule overrides a service-scoped rule overrides the default. Key
//! namespaces are kept distinct so an identity can never collide with an IP:
//!
//! - `identity:<subject>` when claims are known
//! - `apikey:<fingerprint>` when an API key header is present
//! - `ip:<remote-address>` otherwise
//! - `service:<name>:<client-key>` for service-scoped rules
//!
//! Each rule gets its own algorithm instance, chosen once at construction;
//! adding an algorithm means adding a variant and an implementation, not
//! touching the pipeline.

pub mod algorithms;

pub use self::algorithms::{Decision, RateLimitAlgorithm};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::config::{AlgorithmKind, RateLimitConfig, RateLimitRule};
use crate::core::error::GatewayResult;
use self::algorithms::{DistributedRateLimit, FixedWindow, SlidingWindowLog, TokenBucket};

/// A rule bound to its algorithm instance.
struct ScopedLimiter {
    rule: RateLimitRule,
    limiter: Arc<dyn RateLimitAlgorithm>,
}

/// Result of a manager check: the decision plus the limit and key that
/// produced it, for response headers and logging.
#[derive(Debug)]
pub struct CheckOutcome {
    pub decision: Decision,
    pub limit: u32,
    pub key: String,
}

/// Dispatches each request to the limiter for its resolved rule scope.
pub struct RateLimitManager {
    enabled: bool,
    algorithm: AlgorithmKind,
    default_rule: RateLimitRule,
    default_limiter: Arc<dyn RateLimitAlgorithm>,
    per_identity: HashMap<String, ScopedLimiter>,
    per_service: HashMap<String, ScopedLimiter>,
}

impl RateLimitManager {
    /// Build the limiter set for a configuration snapshot.
    ///
    /// With `algorithm: distributed` and no reachable store connection the
    /// manager degrades to local token buckets, matching the fail-open
    /// posture of the distributed variant itself.
    pub fn build(
        config: &RateLimitConfig,
        redis: Option<ConnectionManager>,
    ) -> GatewayResult<Self> {
        let make = |rule: &RateLimitRule| -> Arc<dyn RateLimitAlgorithm> {
            match config.algorithm {
                AlgorithmKind::TokenBucket => Arc::new(TokenBucket::new(
                    rule.requests,
                    rule.window,
                    rule.burst_size(),
                )),
                AlgorithmKind::SlidingWindow => {
                    Arc::new(SlidingWindowLog::new(rule.requests, rule.window))
                }
                AlgorithmKind::FixedWindow => {
                    Arc::new(FixedWindow::new(rule.requests, rule.window))
                }
                AlgorithmKind::Distributed => match redis.clone() {
                    Some(conn) => Arc::new(DistributedRateLimit::new(
                        conn,
                        rule.requests,
                        rule.window,
                        config.fail_policy,
                    )),
                    None => {
                        warn!("distributed rate limiting without a store connection, using local token bucket");
                        Arc::new(TokenBucket::new(
                            rule.requests,
                            rule.window,
                            rule.burst_size(),
                        ))
                    }
                },
            }
        };

        let per_identity = config
            .per_identity
            .iter()
            .map(|(subject, rule)| {
                (
                    subject.clone(),
                    ScopedLimiter {
                        rule: *rule,
                        limiter: make(rule),
                    },
                )
            })
            .collect();
        let per_service = config
            .per_service
            .iter()
            .map(|(service, rule)| {
                (
                    service.clone(),
                    ScopedLimiter {
                        rule: *rule,
                        limiter: make(rule),
                    },
                )
            })
            .collect();

        let manager = Self {
            enabled: config.enabled,
            algorithm: config.algorithm,
            default_rule: config.default,
            default_limiter: make(&config.default),
            per_identity,
            per_service,
        };
        info!(
            algorithm = manager.default_limiter.name(),
            identity_rules = manager.per_identity.len(),
            service_rules = manager.per_service.len(),
            "rate limiter initialized"
        );
        Ok(manager)
    }

    /// Check a request against the highest-priority applicable rule.
    pub async fn check(
        &self,
        identity: Option<&str>,
        api_key: Option<&str>,
        remote_ip: IpAddr,
        service: Option<&str>,
    ) -> CheckOutcome {
        let client = client_key(identity, api_key, remote_ip);

        if !self.enabled {
            return CheckOutcome {
                decision: Decision {
                    allowed: true,
                    remaining: u32::MAX,
                    reset_after: Duration::ZERO,
                },
                limit: u32::MAX,
                key: client,
            };
        }

        let (limit, limiter, key) = self.resolve(identity, service, client);
        let decision = limiter.allow(&key).await;

        let outcome = if decision.allowed { "allowed" } else { "denied" };
        counter!("gateway_rate_limit_decisions_total", "outcome" => outcome).increment(1);

        CheckOutcome {
            decision,
            limit,
            key,
        }
    }

    /// Scope resolution: identity > service > default.
    fn resolve(
        &self,
        identity: Option<&str>,
        service: Option<&str>,
        client: String,
    ) -> (u32, Arc<dyn RateLimitAlgorithm>, String) {
        if let Some(subject) = identity {
            if let Some(scoped) = self.per_identity.get(subject) {
                return (
                    scoped.rule.requests,
                    Arc::clone(&scoped.limiter),
                    format!("identity:{}", subject),
                );
            }
        }
        if let Some(name) = service {
            if let Some(scoped) = self.per_service.get(name) {
                return (
                    scoped.rule.requests,
                    Arc::clone(&scoped.limiter),
                    service_key(name, &client),
                );
            }
        }
        (
            self.default_rule.requests,
            Arc::clone(&self.default_limiter),
            client,
        )
    }

    /// Drop limiter state for a key, resolving the owning scope from the
    /// key's namespace.
    pub async fn reset(&self, key: &str) {
        if let Some(subject) = key.strip_prefix("identity:") {
            if let Some(scoped) = self.per_identity.get(subject) {
                scoped.limiter.reset(key).await;
                return;
            }
        }
        if let Some(rest) = key.strip_prefix("service:") {
            if let Some((name, _)) = rest.split_once(':') {
                if let Some(scoped) = self.per_service.get(name) {
                    scoped.limiter.reset(key).await;
                    return;
                }
            }
        }
        self.default_limiter.reset(key).await;
    }

    /// Sweep idle keys in every limiter.
    pub fn sweep(&self) {
        self.default_limiter.sweep();
        for scoped in self.per_identity.values() {
            scoped.limiter.sweep();
        }
        for scoped in self.per_service.values() {
            scoped.limiter.sweep();
        }
    }

    /// Summary for the admin surface.
    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": self.enabled,
            "algorithm": self.default_limiter.name(),
            "default_limit": self.default_rule.requests,
            "default_window_secs": self.default_rule.window.as_secs(),
            "identity_rules": self.per_identity.len(),
            "service_rules": self.per_service.len(),
        })
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm
    }
}

/// Spawn the background sweeper for bounded memory.
///
/// The task resolves the limiter through the snapshot handle on every tick,
/// so it keeps sweeping the active limiter set across hot reloads instead
/// of pinning a stale one alive.
pub fn spawn_sweeper(
    handle: Arc<crate::core::snapshot::SnapshotHandle>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            handle.current().limiter.sweep();
        }
    })
}

/// Derive the client fingerprint by scope priority: identity, API key, IP.
pub fn client_key(identity: Option<&str>, api_key: Option<&str>, remote_ip: IpAddr) -> String {
    if let Some(subject) = identity {
        return format!("identity:{}", subject);
    }
    if let Some(key) = api_key {
        return format!("apikey:{}", api_key_fingerprint(key));
    }
    format!("ip:{}", remote_ip)
}

/// Compose a service-scoped key with the client fingerprint.
pub fn service_key(service: &str, client: &str) -> String {
    format!("service:{}:{}", service, client)
}

/// Short stable fingerprint of an API key; raw keys never become map keys
/// or label values.
fn api_key_fingerprint(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    format!("{:016x}", u64::from_be_bytes(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))
    }

    fn manager_with(config: RateLimitConfig) -> RateLimitManager {
        RateLimitManager::build(&config, None).unwrap()
    }

    fn rule(requests: u32, window_secs: u64) -> RateLimitRule {
        RateLimitRule {
            requests,
            window: Duration::from_secs(window_secs),
            burst: Some(requests),
        }
    }

    #[test]
    fn test_client_key_priority() {
        assert_eq!(
            client_key(Some("user-1"), Some("key"), ip()),
            "identity:user-1"
        );
        let apikey = client_key(None, Some("secret-key"), ip());
        assert!(apikey.starts_with("apikey:"));
        // Hashed, never the raw key.
        assert!(!apikey.contains("secret-key"));
        assert_eq!(client_key(None, None, ip()), "ip:1.2.3.4");
    }

    #[test]
    fn test_api_key_fingerprint_is_stable() {
        assert_eq!(api_key_fingerprint("abc"), api_key_fingerprint("abc"));
        assert_ne!(api_key_fingerprint("abc"), api_key_fingerprint("abd"));
    }

    #[test]
    fn test_service_key_composition() {
        assert_eq!(
            service_key("users", "identity:user-1"),
            "service:users:identity:user-1"
        );
    }

    #[tokio::test]
    async fn test_identity_rule_overrides_service_rule() {
        let mut config = RateLimitConfig::default();
        config.default = rule(100, 60);
        config.per_identity.insert("vip".into(), rule(2, 60));
        config.per_service.insert("users".into(), rule(50, 60));
        let manager = manager_with(config);

        // Identity rule wins: limit 2.
        let outcome = manager
            .check(Some("vip"), None, ip(), Some("users"))
            .await;
        assert_eq!(outcome.limit, 2);
        assert_eq!(outcome.key, "identity:vip");

        // Unknown identity falls to the service scope: limit 50.
        let outcome = manager
            .check(Some("nobody"), None, ip(), Some("users"))
            .await;
        assert_eq!(outcome.limit, 50);
        assert_eq!(outcome.key, "service:users:identity:nobody");

        // No matching scopes: default.
        let outcome = manager.check(None, None, ip(), Some("orders")).await;
        assert_eq!(outcome.limit, 100);
        assert_eq!(outcome.key, "ip:1.2.3.4");
    }

    #[tokio::test]
    async fn test_identity_rule_enforced() {
        let mut config = RateLimitConfig::default();
        config.per_identity.insert("vip".into(), rule(2, 60));
        let manager = manager_with(config);

        assert!(manager.check(Some("vip"), None, ip(), None).await.decision.allowed);
        assert!(manager.check(Some("vip"), None, ip(), None).await.decision.allowed);
        let outcome = manager.check(Some("vip"), None, ip(), None).await;
        assert!(!outcome.decision.allowed);
    }

    #[tokio::test]
    async fn test_disabled_limiter_always_allows() {
        let config = RateLimitConfig {
            enabled: false,
            default: rule(1, 60),
            ..Default::default()
        };
        let manager = manager_with(config);

        for _ in 0..10 {
            assert!(manager.check(None, None, ip(), None).await.decision.allowed);
        }
    }

    #[tokio::test]
    async fn test_reset_restores_capacity() {
        let mut config = RateLimitConfig::default();
        config.default = rule(1, 60);
        let manager = manager_with(config);

        assert!(manager.check(None, None, ip(), None).await.decision.allowed);
        let denied = manager.check(None, None, ip(), None).await;
        assert!(!denied.decision.allowed);

        manager.reset(&denied.key).await;
        assert!(manager.check(None, None, ip(), None).await.decision.allowed);
    }

    #[tokio::test]
    async fn test_scoped_reset_resolves_namespace() {
        let mut config = RateLimitConfig::default();
        config.per_identity.insert("vip".into(), rule(1, 60));
        let manager = manager_with(config);

        assert!(manager.check(Some("vip"), None, ip(), None).await.decision.allowed);
        assert!(!manager.check(Some("vip"), None, ip(), None).await.decision.allowed);

        manager.reset("identity:vip").await;
        assert!(manager.check(Some("vip"), None, ip(), None).await.decision.allowed);
    }
}

//! # Configuration Module
//!
//! File-backed configuration for the gateway: the serde model, defaults,
//! and total validation. Durations are written in human form (`30s`, `1m`)
//! via `humantime-serde`.
//!
//! Loading is strict: an invalid file is rejected as a whole and, on reload,
//! the previously published snapshot stays active.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::auth::RoleRequirement;
use crate::breaker::CircuitBreakerSpec;
use crate::core::error::{GatewayError, GatewayResult};

/// Environment variable overriding the configuration path.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Default configuration path relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Top-level configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Service name -> upstream spec. The first path segment of a request
    /// selects the service.
    #[serde(default)]
    pub services: HashMap<String, ServiceSpec>,

    #[serde(default)]
    pub redis: Option<RedisConfig>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Whole-request deadline applied at the edge; the per-service timeout
    /// can only shorten it.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Grace period for in-flight requests on shutdown.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    #[serde(default)]
    pub cors: CorsConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            shutdown_grace: default_shutdown_grace(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// HMAC signing secret for the bundled token authority.
    #[serde(default)]
    pub secret: String,

    #[serde(default = "default_token_ttl", with = "humantime_serde")]
    pub token_ttl: Duration,

    #[serde(default = "default_refresh_window", with = "humantime_serde")]
    pub refresh_window: Duration,

    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Header carrying an API key for `apikey:` rate-limit fingerprints.
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Path prefixes requiring a verified identity.
    #[serde(default = "default_protected_prefixes")]
    pub protected_prefixes: Vec<String>,

    /// Roles accepted for the `/admin/*` surface (any-of).
    #[serde(default = "default_admin_roles")]
    pub admin_roles: Vec<String>,
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_refresh_window() -> Duration {
    Duration::from_secs(900)
}

fn default_issuer() -> String {
    "edge-gateway".to_string()
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_protected_prefixes() -> Vec<String> {
    vec!["/api".to_string()]
}

fn default_admin_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_ttl: default_token_ttl(),
            refresh_window: default_refresh_window(),
            issuer: default_issuer(),
            api_key_header: default_api_key_header(),
            protected_prefixes: default_protected_prefixes(),
            admin_roles: default_admin_roles(),
        }
    }
}

/// Rate limiting algorithm selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    Distributed,
}

/// What to do when the shared store behind the distributed limiter fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Fall through to a local emergency limiter at 10x the nominal limit.
    FailOpen,
    /// Treat store failures as denials.
    FailClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_algorithm")]
    pub algorithm: AlgorithmKind,

    #[serde(default = "default_fail_policy")]
    pub fail_policy: FailPolicy,

    #[serde(default = "RateLimitRule::default")]
    pub default: RateLimitRule,

    /// Identity subject -> rule; overrides the service scope.
    #[serde(default)]
    pub per_identity: HashMap<String, RateLimitRule>,

    /// Service name -> rule; overrides the default.
    #[serde(default)]
    pub per_service: HashMap<String, RateLimitRule>,
}

fn default_algorithm() -> AlgorithmKind {
    AlgorithmKind::TokenBucket
}

fn default_fail_policy() -> FailPolicy {
    FailPolicy::FailOpen
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: default_algorithm(),
            fail_policy: default_fail_policy(),
            default: RateLimitRule::default(),
            per_identity: HashMap::new(),
            per_service: HashMap::new(),
        }
    }
}

/// Requests permitted per window, with a burst allowance for token buckets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitRule {
    pub requests: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,

    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimitRule {
    /// Burst allowance; defaults to the request limit itself.
    pub fn burst_size(&self) -> u32 {
        self.burst.unwrap_or(self.requests)
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            requests: 100,
            window: Duration::from_secs(60),
            burst: Some(10),
        }
    }
}

/// Load balancing policy selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
}

/// Per-service upstream specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Ordered upstream endpoint URLs.
    pub urls: Vec<String>,

    #[serde(default = "default_policy")]
    pub load_balancer: PolicyKind,

    /// Static weights for weighted round robin, one per URL.
    #[serde(default)]
    pub weights: Option<Vec<u32>>,

    #[serde(default = "default_service_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Transport-error retries for idempotent requests.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Roles required to reach this service, if any.
    #[serde(default)]
    pub required_roles: Option<RoleRequirement>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSpec,
}

fn default_policy() -> PolicyKind {
    PolicyKind::RoundRobin
}

fn default_service_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_probe_path")]
    pub path: String,
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_probe_path() -> String {
    "/health".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_probe_interval(),
            path: default_probe_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `json` or `pretty`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: GatewayConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        info!(path = %path.display(), services = config.services.len(), "configuration loaded");
        Ok(config)
    }

    /// Resolve the configuration path: `CONFIG_PATH` env var, else default.
    pub fn resolve_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Total validation: any violation rejects the whole configuration.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.server.port == 0 {
            return Err(GatewayError::config("server port must be in [1, 65535]"));
        }

        if !self.auth.protected_prefixes.is_empty() && self.auth.secret.is_empty() {
            return Err(GatewayError::config(
                "auth secret must be set when protected routes exist",
            ));
        }

        let mut rules: Vec<(&str, &RateLimitRule)> = vec![("default", &self.rate_limit.default)];
        rules.extend(
            self.rate_limit
                .per_identity
                .iter()
                .map(|(k, v)| (k.as_str(), v)),
        );
        rules.extend(
            self.rate_limit
                .per_service
                .iter()
                .map(|(k, v)| (k.as_str(), v)),
        );
        for (scope, rule) in rules {
            if rule.requests == 0 {
                return Err(GatewayError::config(format!(
                    "rate limit rule '{}' must allow at least one request",
                    scope
                )));
            }
            if rule.window.is_zero() {
                return Err(GatewayError::config(format!(
                    "rate limit rule '{}' must have a positive window",
                    scope
                )));
            }
        }

        if self.rate_limit.algorithm == AlgorithmKind::Distributed && self.redis.is_none() {
            return Err(GatewayError::config(
                "distributed rate limiting requires a redis section",
            ));
        }

        for (name, service) in &self.services {
            if service.urls.is_empty() {
                return Err(GatewayError::config(format!(
                    "service '{}' must have at least one endpoint URL",
                    name
                )));
            }
            for url in &service.urls {
                Url::parse(url).map_err(|e| {
                    GatewayError::config(format!(
                        "service '{}' has invalid endpoint URL '{}': {}",
                        name, url, e
                    ))
                })?;
            }
            if let Some(weights) = &service.weights {
                if weights.len() != service.urls.len() {
                    return Err(GatewayError::config(format!(
                        "service '{}' has {} weights for {} endpoints",
                        name,
                        weights.len(),
                        service.urls.len()
                    )));
                }
                if weights.iter().all(|w| *w == 0) {
                    return Err(GatewayError::config(format!(
                        "service '{}' weights must not all be zero",
                        name
                    )));
                }
            }
            if service.timeout.is_zero() {
                return Err(GatewayError::config(format!(
                    "service '{}' must have a positive timeout",
                    name
                )));
            }
            let cb = &service.circuit_breaker;
            if cb.enabled {
                if cb.failure_threshold == 0 {
                    return Err(GatewayError::config(format!(
                        "service '{}' breaker needs a positive failure threshold",
                        name
                    )));
                }
                if cb.open_duration.is_zero() {
                    return Err(GatewayError::config(format!(
                        "service '{}' breaker needs a positive open duration",
                        name
                    )));
                }
                if cb.half_open_probes == 0 {
                    return Err(GatewayError::config(format!(
                        "service '{}' breaker needs a positive probe budget",
                        name
                    )));
                }
            }
        }

        Ok(())
    }
}

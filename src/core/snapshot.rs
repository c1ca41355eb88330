//! # Configuration Snapshot Module
//!
//! Runtime view of one validated configuration: compiled route table,
//! per-service balancers and breakers, limiter set, and token authority.
//! Snapshots are immutable once built. Publication is an atomic pointer
//! swap behind [`SnapshotHandle`]: readers capture the current `Arc` at
//! request entry and keep it for the request's lifetime, so a reload never
//! disturbs an in-flight request.
//!
//! Rebuilds happen entirely off-line: validation, route compilation, and
//! limiter instantiation all complete before the swap. An invalid file is
//! rejected and the previous snapshot stays active.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::auth::{TokenAuthority, TokenAuthorityConfig};
use crate::balance::{ServiceBalancer, UpstreamEndpoint};
use crate::breaker::CircuitBreaker;
use crate::core::config::{AlgorithmKind, GatewayConfig, ServiceSpec};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{publish, EventPublisher, GatewayEvent};
use crate::ratelimit::RateLimitManager;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// One service's compiled runtime state.
pub struct ServiceHandle {
    pub name: String,
    pub spec: ServiceSpec,
    pub balancer: ServiceBalancer,
    /// Absent when the breaker is disabled for this service.
    pub breaker: Option<Arc<CircuitBreaker>>,
}

/// Immutable bundle published to the request path.
pub struct ConfigSnapshot {
    version: u64,
    config: GatewayConfig,
    services: HashMap<String, Arc<ServiceHandle>>,
    pub limiter: Arc<RateLimitManager>,
    pub authority: Arc<TokenAuthority>,
}

impl ConfigSnapshot {
    /// Build a snapshot from a validated configuration.
    ///
    /// The only suspension point is the shared-store connection for the
    /// distributed limiter; everything else is bounded CPU.
    pub async fn build(
        config: GatewayConfig,
        events: Option<EventPublisher>,
    ) -> GatewayResult<Arc<Self>> {
        config.validate()?;

        let redis = Self::connect_store(&config).await?;
        let limiter = Arc::new(RateLimitManager::build(&config.rate_limit, redis)?);

        let authority = Arc::new(TokenAuthority::new(TokenAuthorityConfig {
            secret: config.auth.secret.clone(),
            token_ttl: config.auth.token_ttl,
            refresh_window: config.auth.refresh_window,
            issuer: config.auth.issuer.clone(),
        }));

        let mut services = HashMap::with_capacity(config.services.len());
        for (name, spec) in &config.services {
            services.insert(name.clone(), Arc::new(Self::build_service(name, spec, &events)?));
        }

        Ok(Arc::new(Self {
            version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed),
            config,
            services,
            limiter,
            authority,
        }))
    }

    fn build_service(
        name: &str,
        spec: &ServiceSpec,
        events: &Option<EventPublisher>,
    ) -> GatewayResult<ServiceHandle> {
        let mut endpoints = Vec::with_capacity(spec.urls.len());
        for (index, url) in spec.urls.iter().enumerate() {
            let url = url
                .parse()
                .map_err(|e| GatewayError::config(format!("service '{}': {}", name, e)))?;
            let weight = spec
                .weights
                .as_ref()
                .and_then(|w| w.get(index).copied())
                .unwrap_or(1);
            endpoints.push(Arc::new(UpstreamEndpoint::new(url, weight)));
        }

        let balancer = ServiceBalancer::new(name, spec.load_balancer, endpoints);
        let breaker = spec.circuit_breaker.enabled.then(|| {
            Arc::new(CircuitBreaker::with_events(
                name,
                spec.circuit_breaker.clone(),
                events.clone(),
            ))
        });

        Ok(ServiceHandle {
            name: name.to_string(),
            spec: spec.clone(),
            balancer,
            breaker,
        })
    }

    async fn connect_store(config: &GatewayConfig) -> GatewayResult<Option<ConnectionManager>> {
        if config.rate_limit.algorithm != AlgorithmKind::Distributed {
            return Ok(None);
        }
        let Some(redis) = &config.redis else {
            return Ok(None);
        };
        let client = redis::Client::open(redis.url.as_str())
            .map_err(|e| GatewayError::config(format!("invalid redis url: {}", e)))?;
        match ConnectionManager::new(client).await {
            Ok(conn) => Ok(Some(conn)),
            Err(err) => {
                // The distributed limiter degrades to its local fallback;
                // startup proceeds.
                warn!(error = %err, "shared store unreachable at snapshot build");
                Ok(None)
            }
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn service(&self, name: &str) -> Option<Arc<ServiceHandle>> {
        self.services.get(name).cloned()
    }

    pub fn services(&self) -> &HashMap<String, Arc<ServiceHandle>> {
        &self.services
    }

    /// Per-service health view for the liveness endpoint: a service is
    /// unhealthy while its breaker is open or no endpoint is healthy.
    pub fn service_health(&self) -> HashMap<String, bool> {
        self.services
            .iter()
            .map(|(name, handle)| {
                let breaker_open = handle
                    .breaker
                    .as_ref()
                    .map(|b| b.is_open())
                    .unwrap_or(false);
                let healthy = !breaker_open && handle.balancer.healthy_count() > 0;
                (name.clone(), healthy)
            })
            .collect()
    }
}

/// The atomically swapped pointer to the current snapshot.
///
/// `current` is capture-then-dereference: the read lock is held only long
/// enough to clone the `Arc`.
pub struct SnapshotHandle {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl SnapshotHandle {
    pub fn new(initial: Arc<ConfigSnapshot>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn publish(&self, next: Arc<ConfigSnapshot>) {
        let version = next.version();
        let services = next.services().len();
        *self.current.write() = next;
        info!(version, services, "configuration snapshot published");
    }
}

/// Reload the configuration file and publish the new snapshot.
///
/// Returns the number of services in the published snapshot. Any failure
/// leaves the previous snapshot active.
pub async fn reload(
    path: &std::path::Path,
    handle: &SnapshotHandle,
    events: &EventPublisher,
) -> GatewayResult<usize> {
    let config = GatewayConfig::load(path)?;
    let snapshot = ConfigSnapshot::build(config, Some(events.clone())).await?;
    let services = snapshot.services().len();
    handle.publish(snapshot);
    publish(events, GatewayEvent::ConfigReloaded { services });
    Ok(services)
}

/// Watch the configuration file and hot-reload on change.
pub fn spawn_config_watcher(
    path: PathBuf,
    handle: Arc<SnapshotHandle>,
    events: EventPublisher,
) -> GatewayResult<JoinHandle<()>> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(
        move |result: Result<notify::Event, notify::Error>| {
            if let Ok(event) = result {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.send(());
                }
            }
        },
    )
    .map_err(|e| GatewayError::config(format!("failed to create config watcher: {}", e)))?;

    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .map_err(|e| GatewayError::config(format!("failed to watch {}: {}", path.display(), e)))?;

    let task = tokio::spawn(async move {
        // The watcher must outlive the task or events stop arriving.
        let _watcher = watcher;
        while rx.recv().await.is_some() {
            // Editors produce bursts of write events; settle, then drain.
            tokio::time::sleep(Duration::from_millis(200)).await;
            while rx.try_recv().is_ok() {}

            match reload(&path, &handle, &events).await {
                Ok(services) => info!(services, "configuration hot reload applied"),
                Err(err) => error!(error = %err, "configuration reload rejected, keeping previous snapshot"),
            }
        }
    });

    Ok(task)
}

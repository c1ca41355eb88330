//! # Load Balancing Module
//!
//! Upstream endpoint selection for one service. Four policies share a single
//! [`ServiceBalancer`] facade:
//!
//! 1. **Round robin**: atomic cursor over the endpoint list.
//! 2. **Weighted round robin**: classical smooth weighted selection under a
//!    per-service lock, yielding well-interleaved distributions.
//! 3. **Least connections**: O(N) scan of atomic active counters, ties
//!    broken by insertion order.
//! 4. **Random**: uniform choice with an independent PRNG per service.
//!
//! Health is a soft hint owned by the balancer: an unhealthy endpoint is
//! excluded from selection until re-marked healthy. Updates arrive through a
//! non-blocking channel fed by forwarder outcomes and the optional active
//! prober.

pub mod prober;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::config::PolicyKind;
use crate::core::snapshot::SnapshotHandle;
use crate::core::types::{publish, EventPublisher, GatewayEvent};

/// One upstream endpoint with its live state. Owned exclusively by the
/// load-balancer instance for its service.
pub struct UpstreamEndpoint {
    url: Url,
    weight: u32,
    healthy: AtomicBool,
    active: AtomicUsize,
    /// Smooth-WRR scratch; mutated only under the policy lock.
    current_weight: AtomicI64,
}

impl UpstreamEndpoint {
    pub fn new(url: Url, weight: u32) -> Self {
        Self {
            url,
            weight: weight.max(1),
            healthy: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            current_weight: AtomicI64::new(0),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

enum PolicyState {
    RoundRobin { cursor: AtomicUsize },
    WeightedRoundRobin { lock: Mutex<()> },
    LeastConnections,
    Random { rng: Mutex<SmallRng> },
}

/// Per-service balancer owning the endpoint list and selection state.
pub struct ServiceBalancer {
    service: String,
    policy: PolicyKind,
    endpoints: Vec<Arc<UpstreamEndpoint>>,
    state: PolicyState,
}

impl ServiceBalancer {
    pub fn new(
        service: impl Into<String>,
        policy: PolicyKind,
        endpoints: Vec<Arc<UpstreamEndpoint>>,
    ) -> Self {
        let state = match policy {
            PolicyKind::RoundRobin => PolicyState::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
            PolicyKind::WeightedRoundRobin => PolicyState::WeightedRoundRobin {
                lock: Mutex::new(()),
            },
            PolicyKind::LeastConnections => PolicyState::LeastConnections,
            PolicyKind::Random => PolicyState::Random {
                rng: Mutex::new(SmallRng::from_entropy()),
            },
        };
        Self {
            service: service.into(),
            policy,
            endpoints,
            state,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn policy(&self) -> PolicyKind {
        self.policy
    }

    pub fn endpoints(&self) -> &[Arc<UpstreamEndpoint>] {
        &self.endpoints
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_healthy()).count()
    }

    /// Select the next healthy endpoint, or `None` when every endpoint is
    /// unhealthy. The active-connection counter is incremented on selection
    /// and released by [`ServiceBalancer::release`].
    pub fn next_target(&self) -> Option<Arc<UpstreamEndpoint>> {
        let selected = match &self.state {
            PolicyState::RoundRobin { cursor } => self.next_round_robin(cursor),
            PolicyState::WeightedRoundRobin { lock } => self.next_weighted(lock),
            PolicyState::LeastConnections => self.next_least_connections(),
            PolicyState::Random { rng } => self.next_random(rng),
        };

        match selected {
            Some(endpoint) => {
                endpoint.active.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_balancer_selections_total",
                    "service" => self.service.clone())
                .increment(1);
                debug!(
                    service = %self.service,
                    endpoint = %endpoint.url,
                    policy = ?self.policy,
                    "selected upstream endpoint"
                );
                Some(endpoint)
            }
            None => {
                counter!("gateway_balancer_failed_selections_total",
                    "service" => self.service.clone())
                .increment(1);
                warn!(service = %self.service, "no healthy upstream endpoint");
                None
            }
        }
    }

    /// Release a previously selected endpoint (decrements the active count).
    pub fn release(&self, endpoint: &UpstreamEndpoint) {
        let _ = endpoint
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn mark_healthy(&self, url: &Url) {
        self.mark(url, true);
    }

    pub fn mark_unhealthy(&self, url: &Url) {
        self.mark(url, false);
    }

    fn mark(&self, url: &Url, healthy: bool) {
        for endpoint in &self.endpoints {
            if endpoint.url == *url {
                endpoint.set_healthy(healthy);
                return;
            }
        }
    }

    fn next_round_robin(&self, cursor: &AtomicUsize) -> Option<Arc<UpstreamEndpoint>> {
        let n = self.endpoints.len();
        if n == 0 {
            return None;
        }
        // Advance the cursor once per call; probe forward past unhealthy
        // endpoints without consuming extra turns.
        let start = cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..n {
            let endpoint = &self.endpoints[(start + offset) % n];
            if endpoint.is_healthy() {
                return Some(Arc::clone(endpoint));
            }
        }
        None
    }

    fn next_weighted(&self, lock: &Mutex<()>) -> Option<Arc<UpstreamEndpoint>> {
        let _guard = lock.lock();

        let mut total: i64 = 0;
        let mut best: Option<&Arc<UpstreamEndpoint>> = None;
        for endpoint in &self.endpoints {
            if !endpoint.is_healthy() {
                continue;
            }
            let weight = i64::from(endpoint.weight);
            total += weight;
            let cw = endpoint.current_weight.load(Ordering::Relaxed) + weight;
            endpoint.current_weight.store(cw, Ordering::Relaxed);

            let best_cw = best
                .map(|b| b.current_weight.load(Ordering::Relaxed))
                .unwrap_or(i64::MIN);
            if cw > best_cw {
                best = Some(endpoint);
            }
        }

        let selected = best?;
        selected
            .current_weight
            .fetch_sub(total, Ordering::Relaxed);
        Some(Arc::clone(selected))
    }

    fn next_least_connections(&self) -> Option<Arc<UpstreamEndpoint>> {
        let mut min = usize::MAX;
        let mut selected: Option<&Arc<UpstreamEndpoint>> = None;
        for endpoint in &self.endpoints {
            if !endpoint.is_healthy() {
                continue;
            }
            let active = endpoint.active_connections();
            // Strict < keeps the tie-break on insertion order.
            if active < min {
                min = active;
                selected = Some(endpoint);
            }
        }
        selected.cloned()
    }

    fn next_random(&self, rng: &Mutex<SmallRng>) -> Option<Arc<UpstreamEndpoint>> {
        let healthy: Vec<&Arc<UpstreamEndpoint>> =
            self.endpoints.iter().filter(|e| e.is_healthy()).collect();
        if healthy.is_empty() {
            return None;
        }
        let index = rng.lock().gen_range(0..healthy.len());
        Some(Arc::clone(healthy[index]))
    }
}

/// A health state change for one endpoint of one service.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub service: String,
    pub endpoint: Url,
    pub healthy: bool,
}

/// Sender half of the health channel. Senders never block.
pub type HealthSender = mpsc::UnboundedSender<HealthEvent>;

/// Create the health channel and spawn its applier task.
///
/// Events are applied to the *current* snapshot's balancer for the service;
/// in-flight requests keep routing against the snapshot they captured.
pub fn spawn_health_applier(
    handle: Arc<SnapshotHandle>,
    events: EventPublisher,
) -> (HealthSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<HealthEvent>();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let snapshot = handle.current();
            let Some(service) = snapshot.service(&event.service) else {
                continue;
            };
            let previously =
                service.balancer.endpoints().iter().any(|e| {
                    e.url() == &event.endpoint && e.is_healthy() == event.healthy
                });
            if event.healthy {
                service.balancer.mark_healthy(&event.endpoint);
            } else {
                service.balancer.mark_unhealthy(&event.endpoint);
            }
            if !previously {
                info!(
                    service = %event.service,
                    endpoint = %event.endpoint,
                    healthy = event.healthy,
                    "endpoint health changed"
                );
                publish(
                    &events,
                    GatewayEvent::EndpointHealthChanged {
                        service: event.service.clone(),
                        endpoint: event.endpoint.to_string(),
                        healthy: event.healthy,
                    },
                );
            }
        }
    });
    (tx, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(urls: &[&str]) -> Vec<Arc<UpstreamEndpoint>> {
        urls.iter()
            .map(|u| Arc::new(UpstreamEndpoint::new(u.parse().unwrap(), 1)))
            .collect()
    }

    fn weighted_endpoints(spec: &[(&str, u32)]) -> Vec<Arc<UpstreamEndpoint>> {
        spec.iter()
            .map(|(u, w)| Arc::new(UpstreamEndpoint::new(u.parse().unwrap(), *w)))
            .collect()
    }

    #[test]
    fn test_round_robin_fairness() {
        let eps = endpoints(&["http://a:1", "http://b:1", "http://c:1"]);
        let balancer = ServiceBalancer::new("svc", PolicyKind::RoundRobin, eps);

        let mut counts = std::collections::HashMap::new();
        for _ in 0..30 {
            let target = balancer.next_target().unwrap();
            *counts.entry(target.url().to_string()).or_insert(0u32) += 1;
            balancer.release(&target);
        }
        assert!(counts.values().all(|c| *c == 10), "counts: {:?}", counts);
    }

    #[test]
    fn test_round_robin_sequence_is_ordered() {
        let eps = endpoints(&["http://a:1", "http://b:1"]);
        let balancer = ServiceBalancer::new("svc", PolicyKind::RoundRobin, eps);

        let first = balancer.next_target().unwrap().url().to_string();
        let second = balancer.next_target().unwrap().url().to_string();
        let third = balancer.next_target().unwrap().url().to_string();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_weighted_round_robin_distribution() {
        let eps = weighted_endpoints(&[("http://a:1", 5), ("http://b:1", 1), ("http://c:1", 1)]);
        let balancer = ServiceBalancer::new("svc", PolicyKind::WeightedRoundRobin, eps);

        // Any sum-of-weights consecutive selections contain endpoint i
        // exactly w_i times.
        let mut counts = std::collections::HashMap::new();
        for _ in 0..7 {
            let target = balancer.next_target().unwrap();
            *counts.entry(target.url().to_string()).or_insert(0u32) += 1;
            balancer.release(&target);
        }
        assert_eq!(counts["http://a:1/"], 5);
        assert_eq!(counts["http://b:1/"], 1);
        assert_eq!(counts["http://c:1/"], 1);
    }

    #[test]
    fn test_weighted_round_robin_interleaves() {
        let eps = weighted_endpoints(&[("http://a:1", 2), ("http://b:1", 1)]);
        let balancer = ServiceBalancer::new("svc", PolicyKind::WeightedRoundRobin, eps);

        // Smooth WRR never sends a weight-2 endpoint three times in a row
        // within one cycle: a a b, repeating.
        let seq: Vec<String> = (0..6)
            .map(|_| {
                let t = balancer.next_target().unwrap();
                balancer.release(&t);
                t.url().to_string()
            })
            .collect();
        assert_eq!(seq.iter().filter(|u| u.contains("//a")).count(), 4);
        assert!(!seq
            .windows(3)
            .any(|w| w.iter().all(|u| u.contains("//a"))));
    }

    #[test]
    fn test_least_connections_prefers_idle_endpoint() {
        let eps = endpoints(&["http://a:1", "http://b:1"]);
        let balancer = ServiceBalancer::new("svc", PolicyKind::LeastConnections, eps);

        // Hold the first selection open; the next two must go elsewhere
        // first, then balance.
        let first = balancer.next_target().unwrap();
        assert_eq!(first.url().as_str(), "http://a:1/");

        let second = balancer.next_target().unwrap();
        assert_eq!(second.url().as_str(), "http://b:1/");

        // Both have one active connection: insertion order breaks the tie.
        let third = balancer.next_target().unwrap();
        assert_eq!(third.url().as_str(), "http://a:1/");
    }

    #[test]
    fn test_release_decrements_active_count() {
        let eps = endpoints(&["http://a:1"]);
        let balancer = ServiceBalancer::new("svc", PolicyKind::LeastConnections, eps);

        let target = balancer.next_target().unwrap();
        assert_eq!(target.active_connections(), 1);
        balancer.release(&target);
        assert_eq!(target.active_connections(), 0);
        // Double release never underflows.
        balancer.release(&target);
        assert_eq!(target.active_connections(), 0);
    }

    #[test]
    fn test_unhealthy_endpoint_excluded_until_remarked() {
        let eps = endpoints(&["http://a:1", "http://b:1"]);
        let balancer = ServiceBalancer::new("svc", PolicyKind::RoundRobin, eps);
        let b_url: Url = "http://b:1".parse().unwrap();

        balancer.mark_unhealthy(&b_url);
        for _ in 0..20 {
            let target = balancer.next_target().unwrap();
            assert_eq!(target.url().as_str(), "http://a:1/");
            balancer.release(&target);
        }

        balancer.mark_healthy(&b_url);
        let selected: Vec<String> = (0..4)
            .map(|_| {
                let t = balancer.next_target().unwrap();
                balancer.release(&t);
                t.url().to_string()
            })
            .collect();
        assert!(selected.iter().any(|u| u.contains("//b")));
    }

    #[test]
    fn test_all_unhealthy_yields_none() {
        let eps = endpoints(&["http://a:1", "http://b:1"]);
        let balancer = ServiceBalancer::new("svc", PolicyKind::RoundRobin, eps);

        for endpoint in balancer.endpoints() {
            endpoint.set_healthy(false);
        }
        assert!(balancer.next_target().is_none());
    }

    #[test]
    fn test_least_connections_skips_unhealthy_with_zero_connections() {
        let eps = endpoints(&["http://a:1", "http://b:1"]);
        let balancer = ServiceBalancer::new("svc", PolicyKind::LeastConnections, eps);
        balancer.mark_unhealthy(&"http://b:1".parse().unwrap());

        for _ in 0..100 {
            let target = balancer.next_target().unwrap();
            assert_eq!(target.url().as_str(), "http://a:1/");
        }
        // The unhealthy endpoint's active counter never moved.
        assert_eq!(balancer.endpoints()[1].active_connections(), 0);
    }

    #[test]
    fn test_random_only_selects_healthy() {
        let eps = endpoints(&["http://a:1", "http://b:1", "http://c:1"]);
        let balancer = ServiceBalancer::new("svc", PolicyKind::Random, eps);
        balancer.mark_unhealthy(&"http://c:1".parse().unwrap());

        for _ in 0..50 {
            let target = balancer.next_target().unwrap();
            assert_ne!(target.url().as_str(), "http://c:1/");
            balancer.release(&target);
        }
    }

}

//! Background prober for active endpoint health checks.
//!
//! When enabled, a task periodically issues `GET <endpoint><path>` against
//! every endpoint of the current snapshot and reports state changes through
//! the balancer's health channel. Passive health (forwarder transport
//! errors) works without it; the prober is what brings endpoints back after
//! recovery when traffic alone would not.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use super::{HealthEvent, HealthSender};
use crate::core::config::HealthCheckConfig;
use crate::core::snapshot::SnapshotHandle;

/// Per-probe timeout; an endpoint slower than this counts as down.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawn the periodic prober task.
pub fn spawn_prober(
    handle: Arc<SnapshotHandle>,
    config: HealthCheckConfig,
    health_tx: HealthSender,
) -> JoinHandle<()> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .unwrap_or_default();

    tokio::spawn(async move {
        let mut interval = time::interval(config.interval);
        // Skip the immediate first tick so startup traffic settles first.
        interval.tick().await;

        loop {
            interval.tick().await;

            let snapshot = handle.current();
            for (name, service) in snapshot.services() {
                for endpoint in service.balancer.endpoints() {
                    let probe_url = match endpoint.url().join(config.path.trim_start_matches('/')) {
                        Ok(url) => url,
                        Err(_) => continue,
                    };

                    let healthy = match client.get(probe_url.clone()).send().await {
                        Ok(response) => response.status().is_success(),
                        Err(_) => false,
                    };

                    if healthy != endpoint.is_healthy() {
                        debug!(
                            service = %name,
                            endpoint = %endpoint.url(),
                            healthy,
                            "probe observed health change"
                        );
                        let _ = health_tx.send(HealthEvent {
                            service: name.clone(),
                            endpoint: endpoint.url().clone(),
                            healthy,
                        });
                    }
                }
            }
        }
    })
}

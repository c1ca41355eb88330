//! Gateway entry point.
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration load failure, 2 on
//! a fatal runtime error.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use edge_gateway::balance::{prober, spawn_health_applier};
use edge_gateway::core::snapshot::{spawn_config_watcher, ConfigSnapshot, SnapshotHandle};
use edge_gateway::gateway::server::GatewayServer;
use edge_gateway::gateway::AppState;
use edge_gateway::observability;
use edge_gateway::pipeline::Pipeline;
use edge_gateway::proxy::Forwarder;
use edge_gateway::ratelimit;
use edge_gateway::{GatewayConfig, GatewayResult};

/// Interval of the limiter-state eviction sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = GatewayConfig::resolve_path();

    let config = match GatewayConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "failed to load configuration from {}: {}",
                config_path.display(),
                err
            );
            return ExitCode::from(1);
        }
    };

    observability::init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "starting edge-gateway");

    match run(config).await {
        Ok(()) => {
            info!("edge-gateway shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "fatal runtime error");
            ExitCode::from(2)
        }
    }
}

async fn run(config: GatewayConfig) -> GatewayResult<()> {
    let config_path = GatewayConfig::resolve_path();

    let metrics = if config.monitoring.prometheus.enabled {
        Some(observability::install_metrics()?)
    } else {
        None
    };

    let (events, _) = broadcast::channel(256);
    spawn_event_logger(events.clone());

    let health_check = config.health_check.clone();
    let snapshot = ConfigSnapshot::build(config, Some(events.clone())).await?;
    let snapshots = Arc::new(SnapshotHandle::new(snapshot));

    // Background plumbing: health application, active probing, limiter
    // sweeping, configuration watching.
    let (health_tx, _health_task) = spawn_health_applier(Arc::clone(&snapshots), events.clone());
    if health_check.enabled {
        let _prober = prober::spawn_prober(Arc::clone(&snapshots), health_check, health_tx.clone());
    }
    let _sweeper = ratelimit::spawn_sweeper(Arc::clone(&snapshots), SWEEP_INTERVAL);
    if let Err(err) = spawn_config_watcher(config_path.clone(), Arc::clone(&snapshots), events.clone())
    {
        // Hot reload stays available through the admin endpoint.
        warn!(error = %err, "configuration file watching disabled");
    }

    let forwarder = Arc::new(Forwarder::new(health_tx));
    let pipeline = Arc::new(Pipeline::new(forwarder, events.clone()));

    let state = AppState {
        snapshots,
        pipeline,
        events,
        metrics,
        config_path,
    };

    let server = GatewayServer::new(state)?;
    info!(addr = %server.bind_addr(), "gateway configured");
    server.start().await
}

/// Drain the event bus into the debug log; keeps the channel from lagging
/// when no external sink is attached.
fn spawn_event_logger(events: broadcast::Sender<edge_gateway::core::types::GatewayEvent>) {
    let mut subscriber = events.subscribe();
    tokio::spawn(async move {
        loop {
            match subscriber.recv().await {
                Ok(event) => debug!(?event, "gateway event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

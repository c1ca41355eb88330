//! # Gateway Module
//!
//! Assembles the engine into a running HTTP server: reserved routes
//! (`/health`, `/metrics`, `/info`, `/auth/*`, `/api/*`, `/admin/*`) ahead
//! of the catch-all pipeline fallback that proxies everything else.

pub mod admin;
pub mod identity;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::core::snapshot::SnapshotHandle;
use crate::core::types::EventPublisher;
use crate::pipeline::Pipeline;

/// Shared server state, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub snapshots: Arc<SnapshotHandle>,
    pub pipeline: Arc<Pipeline>,
    pub events: EventPublisher,
    pub metrics: Option<PrometheusHandle>,
    pub config_path: PathBuf,
}

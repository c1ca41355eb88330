//! # edge-gateway
//!
//! The request-processing engine of an API gateway: per-fingerprint rate
//! limiting with four interchangeable algorithms, load balancing with four
//! selection policies and live health, per-service circuit breakers, and a
//! streaming reverse-proxy forwarder with idempotent-only retries, all fed
//! by an atomically swapped configuration snapshot that hot-reloads without
//! dropping in-flight requests.

pub mod auth;
pub mod balance;
pub mod breaker;
pub mod core;
pub mod gateway;
pub mod observability;
pub mod pipeline;
pub mod proxy;
pub mod ratelimit;

pub use crate::core::config::GatewayConfig;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::snapshot::{ConfigSnapshot, SnapshotHandle};

//! # Circuit Breaker Module
//!
//! Per-service circuit breaker protecting upstreams from cascade failures.
//! The breaker is a three-state machine:
//!
//! - **Closed**: requests flow; consecutive failures are counted and the
//!   breaker opens once they reach the configured threshold.
//! - **Open**: every call short-circuits for `open_duration`, after which the
//!   first caller moves the breaker to half-open.
//! - **HalfOpen**: at most `half_open_probes` concurrent probes are admitted;
//!   enough successes close the breaker, any failure reopens it with a fresh
//!   timer.
//!
//! Transitions happen under one short mutex; the forwarder reports only the
//! final outcome of a request, never individual retry attempts.

use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::types::{publish, EventPublisher, GatewayEvent};

/// Breaker settings embedded in a service spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerSpec {
    #[serde(default)]
    pub enabled: bool,

    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays open before probing.
    #[serde(default = "default_open_duration", with = "humantime_serde")]
    pub open_duration: Duration,

    /// Concurrent probe budget in half-open; also the number of successes
    /// required to close again.
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_probes() -> u32 {
    3
}

impl Default for CircuitBreakerSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            open_duration: default_open_duration(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

/// Breaker state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { in_flight: u32, successes: u32 },
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }

    /// Gauge encoding: Closed=0, HalfOpen=1, Open=2.
    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen { .. } => 1.0,
            CircuitState::Open { .. } => 2.0,
        }
    }
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerOpenError {
    /// Remaining open duration, surfaced to clients as `Retry-After`.
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    total_failures: u64,
}

/// One breaker per service. Counters are local to the breaker and mutated
/// only under its lock.
pub struct CircuitBreaker {
    service: String,
    spec: CircuitBreakerSpec,
    inner: Mutex<Inner>,
    events: Option<EventPublisher>,
}

/// Serializable view of a breaker for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub total_failures: u64,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, spec: CircuitBreakerSpec) -> Self {
        Self::with_events(service, spec, None)
    }

    pub fn with_events(
        service: impl Into<String>,
        spec: CircuitBreakerSpec,
        events: Option<EventPublisher>,
    ) -> Self {
        let service = service.into();
        gauge!("gateway_breaker_state", "service" => service.clone()).set(0.0);
        Self {
            service,
            spec,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                total_requests: 0,
                total_failures: 0,
            }),
            events,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn spec(&self) -> &CircuitBreakerSpec {
        &self.spec
    }

    /// Ask the breaker to admit a call.
    ///
    /// Open breakers whose timer has expired move to half-open and admit the
    /// caller as a probe; half-open breakers enforce the probe budget.
    pub fn try_acquire(&self) -> Result<(), BreakerOpenError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                inner.total_requests += 1;
                Ok(())
            }
            CircuitState::Open { opened_at } => {
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.spec.open_duration {
                    self.transition(
                        &mut inner,
                        CircuitState::HalfOpen {
                            in_flight: 1,
                            successes: 0,
                        },
                    );
                    inner.total_requests += 1;
                    Ok(())
                } else {
                    counter!("gateway_breaker_outcomes_total",
                        "service" => self.service.clone(), "outcome" => "short_circuit")
                    .increment(1);
                    Err(BreakerOpenError {
                        retry_after: self.spec.open_duration - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen {
                in_flight,
                successes,
            } => {
                if in_flight < self.spec.half_open_probes {
                    inner.state = CircuitState::HalfOpen {
                        in_flight: in_flight + 1,
                        successes,
                    };
                    inner.total_requests += 1;
                    Ok(())
                } else {
                    counter!("gateway_breaker_outcomes_total",
                        "service" => self.service.clone(), "outcome" => "short_circuit")
                    .increment(1);
                    Err(BreakerOpenError {
                        // Probe budget exhausted; recovery is imminent or the
                        // probes will reopen the breaker, so hint one open
                        // duration.
                        retry_after: self.spec.open_duration,
                    })
                }
            }
        }
    }

    /// Record a successful final outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;
        counter!("gateway_breaker_outcomes_total",
            "service" => self.service.clone(), "outcome" => "success")
        .increment(1);

        if let CircuitState::HalfOpen {
            in_flight,
            successes,
        } = inner.state
        {
            let successes = successes + 1;
            if successes >= self.spec.half_open_probes {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                self.transition(&mut inner, CircuitState::Closed);
            } else {
                inner.state = CircuitState::HalfOpen {
                    in_flight: in_flight.saturating_sub(1),
                    successes,
                };
            }
        }
    }

    /// Record a failed final outcome (status >= 500, transport error, or
    /// deadline expiry; never a 4xx).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        inner.total_failures += 1;
        counter!("gateway_breaker_outcomes_total",
            "service" => self.service.clone(), "outcome" => "failure")
        .increment(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.spec.failure_threshold {
                    self.transition(
                        &mut inner,
                        CircuitState::Open {
                            opened_at: Instant::now(),
                        },
                    );
                }
            }
            CircuitState::HalfOpen { .. } => {
                // Any probe failure restarts the full open duration.
                self.transition(
                    &mut inner,
                    CircuitState::Open {
                        opened_at: Instant::now(),
                    },
                );
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// True reset: state to Closed, all counters zeroed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.total_requests = 0;
        inner.total_failures = 0;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        info!(service = %self.service, "circuit breaker reset");
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state.clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, CircuitState::Open { .. })
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            service: self.service.clone(),
            state: inner.state.name(),
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state.name();
        let to_name = to.name();
        gauge!("gateway_breaker_state", "service" => self.service.clone())
            .set(to.gauge_value());
        counter!("gateway_breaker_transitions_total",
            "service" => self.service.clone(), "from" => from, "to" => to_name)
        .increment(1);
        info!(service = %self.service, from, to = to_name, "circuit breaker transition");
        if let Some(events) = &self.events {
            publish(
                events,
                GatewayEvent::BreakerStateChanged {
                    service: self.service.clone(),
                    from,
                    to: to_name,
                },
            );
        }
        inner.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spec(threshold: u32, open_ms: u64, probes: u32) -> CircuitBreakerSpec {
        CircuitBreakerSpec {
            enabled: true,
            failure_threshold: threshold,
            open_duration: Duration::from_millis(open_ms),
            half_open_probes: probes,
        }
    }

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::new("users", spec(3, 1000, 2));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new("users", spec(3, 60_000, 2));

        for _ in 0..2 {
            cb.try_acquire().unwrap();
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }

        cb.try_acquire().unwrap();
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));

        let err = cb.try_acquire().unwrap_err();
        assert!(err.retry_after <= Duration::from_secs(60));
        assert!(err.retry_after > Duration::from_secs(59));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("users", spec(3, 60_000, 2));

        cb.try_acquire().unwrap();
        cb.record_failure();
        cb.try_acquire().unwrap();
        cb.record_failure();
        cb.try_acquire().unwrap();
        cb.record_success();

        // Two more failures should not be enough to open again.
        cb.try_acquire().unwrap();
        cb.record_failure();
        cb.try_acquire().unwrap();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_transitions_to_half_open_after_open_duration() {
        let cb = CircuitBreaker::new("users", spec(1, 50, 2));

        cb.try_acquire().unwrap();
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        assert!(cb.try_acquire().is_err());

        thread::sleep(Duration::from_millis(80));
        assert!(cb.try_acquire().is_ok());
        assert!(matches!(cb.state(), CircuitState::HalfOpen { .. }));
    }

    #[test]
    fn test_closes_after_probe_successes() {
        let cb = CircuitBreaker::new("users", spec(1, 50, 2));

        cb.try_acquire().unwrap();
        cb.record_failure();
        thread::sleep(Duration::from_millis(80));

        cb.try_acquire().unwrap();
        cb.record_success();
        assert!(matches!(
            cb.state(),
            CircuitState::HalfOpen { successes: 1, .. }
        ));

        cb.try_acquire().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);

        // Counters were reset on close.
        let snap = cb.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.consecutive_successes, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_with_fresh_timer() {
        let cb = CircuitBreaker::new("users", spec(1, 50, 2));

        cb.try_acquire().unwrap();
        cb.record_failure();
        thread::sleep(Duration::from_millis(80));

        cb.try_acquire().unwrap();
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));

        // Timer restarted: still short-circuiting right away.
        let err = cb.try_acquire().unwrap_err();
        assert!(err.retry_after > Duration::from_millis(20));
    }

    #[test]
    fn test_half_open_probe_budget() {
        let cb = CircuitBreaker::new("users", spec(1, 50, 2));

        cb.try_acquire().unwrap();
        cb.record_failure();
        thread::sleep(Duration::from_millis(80));

        // Budget of two concurrent probes.
        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn test_reset_returns_to_closed_and_zeroes_counters() {
        let cb = CircuitBreaker::new("users", spec(1, 60_000, 2));

        cb.try_acquire().unwrap();
        cb.record_failure();
        assert!(cb.is_open());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        let snap = cb.snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.total_failures, 0);
        assert!(cb.try_acquire().is_ok());
    }

}

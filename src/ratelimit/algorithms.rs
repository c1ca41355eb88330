//! Rate limiting algorithms.
//!
//! Four interchangeable implementations behind [`RateLimitAlgorithm`]:
//! token bucket, sliding window log, fixed window, and a distributed variant
//! coordinated through Redis. The local algorithms keep per-key state in
//! sharded [`DashMap`]s so contention stays per-key; the map shard lock also
//! serializes each key's state mutation against the background sweeper.
//!
//! All timing of the local algorithms uses the monotonic [`Instant`] clock,
//! so wall-clock drift can never produce a negative refill.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, warn};

use crate::core::config::FailPolicy;

/// Outcome of a single rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Requests left in the current window (post-decision).
    pub remaining: u32,
    /// How long until capacity becomes available again.
    pub reset_after: Duration,
}

/// A rate limiting algorithm holding per-key state.
///
/// `allow` is total: the distributed variant resolves shared-store failures
/// internally according to its configured fail policy, so callers never see
/// a transport error on the hot path.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    async fn allow(&self, key: &str) -> Decision;

    /// Drop all state for a key.
    async fn reset(&self, key: &str);

    /// Evict keys not observed within the retention period (10x window).
    fn sweep(&self);

    fn name(&self) -> &'static str;
}

/// Idle retention before a key becomes sweepable.
fn retention(window: Duration) -> Duration {
    window.saturating_mul(10)
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Token bucket: capacity `burst`, refilled at `requests / window` tokens
/// per second, computed lazily on access.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    retention: Duration,
    buckets: DashMap<String, Bucket>,
}

impl TokenBucket {
    pub fn new(requests: u32, window: Duration, burst: u32) -> Self {
        Self {
            rate: f64::from(requests) / window.as_secs_f64(),
            capacity: f64::from(burst.max(1)),
            retention: retention(window),
            buckets: DashMap::new(),
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucket {
    async fn allow(&self, key: &str) -> Decision {
        let now = Instant::now();
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
            last_seen: now,
        });
        let bucket = entry.value_mut();

        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Decision {
                allowed: true,
                remaining: bucket.tokens as u32,
                reset_after: Duration::from_secs_f64(
                    (self.capacity - bucket.tokens) / self.rate,
                ),
            }
        } else {
            Decision {
                allowed: false,
                remaining: 0,
                reset_after: Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate),
            }
        }
    }

    async fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    fn sweep(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.retention) else {
            return;
        };
        self.buckets.retain(|_, bucket| bucket.last_seen > cutoff);
    }

    fn name(&self) -> &'static str {
        "token_bucket"
    }
}

// ---------------------------------------------------------------------------
// Sliding window log
// ---------------------------------------------------------------------------

struct WindowLog {
    stamps: VecDeque<Instant>,
    last_seen: Instant,
}

/// Sliding window log: exact accounting of request timestamps within the
/// trailing window, trimmed at the head on every access.
pub struct SlidingWindowLog {
    limit: u32,
    window: Duration,
    retention: Duration,
    windows: DashMap<String, WindowLog>,
}

impl SlidingWindowLog {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            retention: retention(window),
            windows: DashMap::new(),
        }
    }

    /// Number of live entries for a key, after trimming. Test hook for the
    /// exactness invariant.
    #[cfg(test)]
    fn live_count(&self, key: &str) -> usize {
        let now = Instant::now();
        self.windows
            .get(key)
            .map(|log| {
                log.stamps
                    .iter()
                    .filter(|s| **s + self.window > now)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowLog {
    async fn allow(&self, key: &str) -> Decision {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| WindowLog {
            stamps: VecDeque::new(),
            last_seen: now,
        });
        let log = entry.value_mut();
        log.last_seen = now;

        while let Some(front) = log.stamps.front() {
            if *front + self.window <= now {
                log.stamps.pop_front();
            } else {
                break;
            }
        }

        if (log.stamps.len() as u32) < self.limit {
            log.stamps.push_back(now);
            Decision {
                allowed: true,
                remaining: self.limit - log.stamps.len() as u32,
                reset_after: self.window,
            }
        } else {
            let oldest = log.stamps.front().copied().unwrap_or(now);
            Decision {
                allowed: false,
                remaining: 0,
                reset_after: (oldest + self.window).saturating_duration_since(now),
            }
        }
    }

    async fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    fn sweep(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.retention) else {
            return;
        };
        self.windows.retain(|_, log| log.last_seen > cutoff);
    }

    fn name(&self) -> &'static str {
        "sliding_window"
    }
}

// ---------------------------------------------------------------------------
// Fixed window
// ---------------------------------------------------------------------------

struct WindowCounter {
    count: u32,
    window_index: u64,
    last_seen: Instant,
}

/// Fixed window counter: cheapest of the local algorithms, with the known
/// boundary-burst trade-off of up to 2x the limit across adjacent windows.
pub struct FixedWindow {
    limit: u32,
    window_ms: u64,
    retention: Duration,
    counters: DashMap<String, WindowCounter>,
}

impl FixedWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window_ms: window.as_millis().max(1) as u64,
            retention: retention(window),
            counters: DashMap::new(),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindow {
    async fn allow(&self, key: &str) -> Decision {
        let now_ms = Self::now_ms();
        let index = now_ms / self.window_ms;
        let reset_after = Duration::from_millis((index + 1) * self.window_ms - now_ms);

        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter {
                count: 0,
                window_index: index,
                last_seen: Instant::now(),
            });
        let counter = entry.value_mut();
        counter.last_seen = Instant::now();

        if counter.window_index != index {
            counter.window_index = index;
            counter.count = 0;
        }

        if counter.count < self.limit {
            counter.count += 1;
            Decision {
                allowed: true,
                remaining: self.limit - counter.count,
                reset_after,
            }
        } else {
            Decision {
                allowed: false,
                remaining: 0,
                reset_after,
            }
        }
    }

    async fn reset(&self, key: &str) {
        self.counters.remove(key);
    }

    fn sweep(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.retention) else {
            return;
        };
        self.counters.retain(|_, counter| counter.last_seen > cutoff);
    }

    fn name(&self) -> &'static str {
        "fixed_window"
    }
}

// ---------------------------------------------------------------------------
// Distributed (Redis)
// ---------------------------------------------------------------------------

/// Atomic server-side window maintenance: trim entries older than the
/// window, read the cardinality, conditionally insert with score = now.
/// Stable contract: `(key, window_ms, limit, now_ms) -> (allowed, remaining)`.
const WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

redis.call('zremrangebyscore', key, '-inf', now - window)

local current = redis.call('zcard', key)

if current < limit then
    redis.call('zadd', key, now, now)
    redis.call('pexpire', key, window)
    return {1, limit - current - 1}
else
    return {0, 0}
end
"#;

/// Distributed rate limiting over a shared ordered set, one atomic script
/// call per decision. No local state beyond the emergency fallback limiter.
pub struct DistributedRateLimit {
    conn: ConnectionManager,
    script: Script,
    limit: u32,
    window: Duration,
    fail_policy: FailPolicy,
    /// Fail-open containment: local token bucket at 10x the nominal limit.
    emergency: TokenBucket,
}

impl DistributedRateLimit {
    pub fn new(
        conn: ConnectionManager,
        limit: u32,
        window: Duration,
        fail_policy: FailPolicy,
    ) -> Self {
        let emergency_limit = limit.saturating_mul(10);
        Self {
            conn,
            script: Script::new(WINDOW_SCRIPT),
            limit,
            window,
            fail_policy,
            emergency: TokenBucket::new(emergency_limit, window, emergency_limit),
        }
    }

    async fn degraded(&self, key: &str) -> Decision {
        match self.fail_policy {
            FailPolicy::FailOpen => {
                debug!(key, "shared store unavailable, using emergency limiter");
                self.emergency.allow(key).await
            }
            FailPolicy::FailClosed => Decision {
                allowed: false,
                remaining: 0,
                reset_after: self.window,
            },
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for DistributedRateLimit {
    async fn allow(&self, key: &str) -> Decision {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let window_ms = self.window.as_millis() as u64;

        let mut conn = self.conn.clone();
        let result: Result<(i64, i64), redis::RedisError> = self
            .script
            .key(key)
            .arg(window_ms)
            .arg(self.limit)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok((allowed, remaining)) => Decision {
                allowed: allowed == 1,
                remaining: remaining.max(0) as u32,
                reset_after: self.window,
            },
            Err(err) => {
                warn!(key, error = %err, "distributed rate limit store failure");
                counter!("gateway_rate_limit_store_errors_total").increment(1);
                self.degraded(key).await
            }
        }
    }

    async fn reset(&self, key: &str) {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            warn!(key, error = %err, "failed to reset distributed rate limit key");
        }
        self.emergency.reset(key).await;
    }

    fn sweep(&self) {
        // Shared-store entries expire server-side via PEXPIRE.
        self.emergency.sweep();
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}

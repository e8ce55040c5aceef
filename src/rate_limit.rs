//! Dual-window admission control: an hourly quota with a per-minute burst
//! cap layered under it.
//!
//! Both windows live in a shared [`CounterStore`] so every process sharing
//! the store sees the same counts. A store must apply each hit as a single
//! atomic operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::RateLimitError;

const HOUR_SECONDS: i64 = 60 * 60;
const MINUTE_SECONDS: i64 = 60;

/// Per-minute cap derived from an hourly quota.
pub fn burst_limit_for(hourly_limit: u64) -> u64 {
    if hourly_limit >= 10_000 {
        500
    } else {
        100
    }
}

/// One admission request against both windows.
#[derive(Debug, Clone)]
pub struct WindowHit {
    pub hour_key: String,
    pub hour_ttl_secs: i64,
    pub minute_key: String,
    pub now_ms: i64,
    pub member: String,
}

/// Counts observed right after a hit was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub hour_count: u64,
    pub hour_ttl_secs: i64,
    pub minute_count: u64,
    pub oldest_minute_ms: Option<i64>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically: increment the hourly counter (setting its TTL on first
    /// use), prune minute entries older than 60 s, add this hit, and return
    /// the resulting counts.
    async fn record_hit(&self, hit: &WindowHit) -> Result<WindowSnapshot, RateLimitError>;

    /// Atomically increment a fixed-window counter. Returns the count and
    /// the seconds left in the window.
    async fn increment_fixed(
        &self,
        key: &str,
        window_secs: i64,
        now_ms: i64,
    ) -> Result<(u64, i64), RateLimitError>;
}

/// `{allowed, limit, remaining, reset, retry_after_seconds}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,

    /// Unix seconds at which the limiting window resets.
    pub reset: i64,

    pub retry_after_seconds: Option<u64>,
}

impl RateLimitResult {
    /// Standard response headers for the API gateway.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ];
        if let Some(retry) = self.retry_after_seconds {
            headers.push(("Retry-After", retry.to_string()));
        }
        headers
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    prefix: String,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Record one request for `resource` and decide whether it is admitted.
    ///
    /// Denied requests still count against both windows.
    pub async fn enforce(
        &self,
        resource: &str,
        limit: u64,
        burst: u64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult, RateLimitError> {
        let now_ms = now.timestamp_millis();
        let now_secs = now.timestamp();
        let hour_bucket = now_secs.div_euclid(HOUR_SECONDS);
        let hour_ttl_secs = (hour_bucket + 1) * HOUR_SECONDS - now_secs;

        let hit = WindowHit {
            hour_key: format!("{}:{}:hour:{}", self.prefix, resource, hour_bucket),
            hour_ttl_secs,
            minute_key: format!("{}:{}:minute", self.prefix, resource),
            now_ms,
            member: format!("{}-{:016x}", now_ms, fastrand::u64(..)),
        };
        let snapshot = self.store.record_hit(&hit).await?;

        let minute_limit = burst.min(limit);
        let hour_exceeded = snapshot.hour_count > limit;
        let minute_exceeded = snapshot.minute_count > minute_limit;
        let allowed = !hour_exceeded && !minute_exceeded;

        let hour_reset = if snapshot.hour_ttl_secs > 0 {
            snapshot.hour_ttl_secs
        } else {
            hour_ttl_secs
        };
        let minute_reset = snapshot
            .oldest_minute_ms
            .map(|oldest| {
                let remaining_ms = oldest + MINUTE_SECONDS * 1000 - now_ms;
                ((remaining_ms + 999).div_euclid(1000)).max(1)
            })
            .unwrap_or(MINUTE_SECONDS);
        let limiting_reset = if hour_exceeded { hour_reset } else { minute_reset };
        let reset_secs = if allowed { hour_reset } else { limiting_reset };

        let result = RateLimitResult {
            allowed,
            limit,
            remaining: limit.saturating_sub(snapshot.hour_count),
            reset: now_secs + reset_secs,
            retry_after_seconds: (!allowed).then_some(limiting_reset.max(1) as u64),
        };

        if !allowed {
            tracing::warn!(
                resource,
                hour_count = snapshot.hour_count,
                minute_count = snapshot.minute_count,
                retry_after = limiting_reset,
                "rate_limit.denied"
            );
            crate::telemetry::metric_inc("rate_limit.denied");
        }
        Ok(result)
    }

    /// Plain fixed-window limit, used for internal job triggers.
    pub async fn enforce_fixed(
        &self,
        key: &str,
        limit: u64,
        window_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult, RateLimitError> {
        let (count, ttl) = self
            .store
            .increment_fixed(&format!("{}:{}", self.prefix, key), window_secs, now.timestamp_millis())
            .await?;
        let allowed = count <= limit;
        let reset_secs = if ttl > 0 { ttl } else { window_secs };
        Ok(RateLimitResult {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset: now.timestamp() + reset_secs,
            retry_after_seconds: (!allowed).then_some(reset_secs.max(1) as u64),
        })
    }
}

#[derive(Debug, Default)]
struct Counter {
    value: u64,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct SortedWindow {
    // score -> members
    entries: BTreeMap<i64, Vec<String>>,
    expires_at_ms: i64,
}

impl SortedWindow {
    fn len(&self) -> u64 {
        self.entries.values().map(|m| m.len() as u64).sum()
    }
}

#[derive(Debug, Default)]
struct CounterState {
    counters: HashMap<String, Counter>,
    windows: HashMap<String, SortedWindow>,
    next_sweep_ms: i64,
}

impl CounterState {
    /// Drop keys whose TTL has passed, at most once per second.
    fn evict_expired(&mut self, now_ms: i64) {
        if now_ms < self.next_sweep_ms {
            return;
        }
        self.counters.retain(|_, c| c.expires_at_ms > now_ms);
        self.windows.retain(|_, w| w.expires_at_ms > now_ms);
        self.next_sweep_ms = now_ms + 1_000;
    }
}

/// Process-local counter store. One mutex guards every key, so each hit is
/// applied atomically with respect to concurrent callers.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    state: Mutex<CounterState>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn bump(counters: &mut HashMap<String, Counter>, key: &str, ttl_secs: i64, now_ms: i64) -> (u64, i64) {
    let counter = counters.entry(key.to_string()).or_default();
    if counter.value > 0 && counter.expires_at_ms <= now_ms {
        *counter = Counter::default();
    }
    counter.value += 1;
    if counter.value == 1 {
        counter.expires_at_ms = now_ms + ttl_secs * 1000;
    }
    let ttl = (counter.expires_at_ms - now_ms).div_euclid(1000);
    (counter.value, ttl)
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn record_hit(&self, hit: &WindowHit) -> Result<WindowSnapshot, RateLimitError> {
        let mut state = self.state.lock().await;
        state.evict_expired(hit.now_ms);

        let (hour_count, hour_ttl_secs) =
            bump(&mut state.counters, &hit.hour_key, hit.hour_ttl_secs, hit.now_ms);

        let window = state.windows.entry(hit.minute_key.clone()).or_default();
        if window.expires_at_ms <= hit.now_ms {
            window.entries.clear();
        }
        let window_start = hit.now_ms - MINUTE_SECONDS * 1000;
        window.entries = window.entries.split_off(&(window_start + 1));
        window
            .entries
            .entry(hit.now_ms)
            .or_default()
            .push(hit.member.clone());
        window.expires_at_ms = hit.now_ms + MINUTE_SECONDS * 1000;

        Ok(WindowSnapshot {
            hour_count,
            hour_ttl_secs,
            minute_count: window.len(),
            oldest_minute_ms: window.entries.keys().next().copied(),
        })
    }

    async fn increment_fixed(
        &self,
        key: &str,
        window_secs: i64,
        now_ms: i64,
    ) -> Result<(u64, i64), RateLimitError> {
        let mut state = self.state.lock().await;
        state.evict_expired(now_ms);
        Ok(bump(&mut state.counters, key, window_secs, now_ms))
    }
}

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{RateLimitError, StoreError};
use crate::lease::{JobLease, LeaseToken};
use crate::rate_limit::{CounterStore, WindowHit, WindowSnapshot};

// KEYS: hour counter, minute sorted set.
// ARGV: hour ttl secs, now ms, member, minute window ms.
const RECORD_HIT: &str = r"
local hour = redis.call('INCR', KEYS[1])
if hour == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local hour_ttl = redis.call('TTL', KEYS[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', now - window)
redis.call('ZADD', KEYS[2], now, ARGV[3])
redis.call('PEXPIRE', KEYS[2], window)
local minute = redis.call('ZCARD', KEYS[2])
local oldest = redis.call('ZRANGE', KEYS[2], 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end
return {hour, hour_ttl, minute, oldest_score}
";

const INCREMENT_FIXED: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return {count, redis.call('TTL', KEYS[1])}
";

const RELEASE_LEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

const EXTEND_LEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// Shared counter store backed by Redis. Every hit runs as one Lua script,
/// so concurrent processes never interleave between increment and read.
pub struct RedisCounterStore {
    client: redis::Client,
}

impl RedisCounterStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn connection(&self) -> Result<redis::aio::Connection, RateLimitError> {
        self.client
            .get_tokio_connection()
            .await
            .map_err(|err| RateLimitError::Store(err.to_string()))
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn record_hit(&self, hit: &WindowHit) -> Result<WindowSnapshot, RateLimitError> {
        let mut conn = self.connection().await?;
        let (hour, hour_ttl, minute, oldest): (i64, i64, i64, i64) = redis::Script::new(RECORD_HIT)
            .key(&hit.hour_key)
            .key(&hit.minute_key)
            .arg(hit.hour_ttl_secs)
            .arg(hit.now_ms)
            .arg(&hit.member)
            .arg(60_000)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| RateLimitError::Store(err.to_string()))?;

        Ok(WindowSnapshot {
            hour_count: hour.max(0) as u64,
            hour_ttl_secs: hour_ttl,
            minute_count: minute.max(0) as u64,
            oldest_minute_ms: (oldest >= 0).then_some(oldest),
        })
    }

    async fn increment_fixed(
        &self,
        key: &str,
        window_secs: i64,
        _now_ms: i64,
    ) -> Result<(u64, i64), RateLimitError> {
        let mut conn = self.connection().await?;
        let (count, ttl): (i64, i64) = redis::Script::new(INCREMENT_FIXED)
            .key(key)
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| RateLimitError::Store(err.to_string()))?;
        Ok((count.max(0) as u64, ttl))
    }
}

/// Job lease held as a Redis key with a millisecond expiry.
pub struct RedisLease {
    client: redis::Client,
    prefix: String,
}

impl RedisLease {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn lease_key(&self, name: &str) -> String {
        format!("{}:lease:{}", self.prefix, name)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        self.client
            .get_tokio_connection()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

#[async_trait]
impl JobLease for RedisLease {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseToken>, StoreError> {
        let mut conn = self.connection().await?;
        let token = uuid::Uuid::new_v4().to_string();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let claimed: Option<String> = redis::cmd("SET")
            .arg(self.lease_key(name))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;

        Ok(claimed.map(|_| LeaseToken {
            name: name.to_string(),
            token,
        }))
    }

    async fn extend(&self, lease: &LeaseToken, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let extended: i64 = redis::Script::new(EXTEND_LEASE)
            .key(self.lease_key(&lease.name))
            .arg(&lease.token)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(extended == 1)
    }

    async fn release(&self, lease: &LeaseToken) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::Script::new(RELEASE_LEASE)
            .key(self.lease_key(&lease.name))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(())
    }
}

//! Redis backend shared by every replica.
//!
//! Bucket updates run inside one Lua script per call, so refill, compare and
//! debit land as a single atomic step on the server. Idempotency records use
//! `SET NX PX` for first-writer-wins and scripts for compare-and-swap.
//!
//! Layout:
//! - `{prefix}bucket:{subject}:{scope}`: hash `tokens` (float), `last_refill_at`
//!   (Unix nanoseconds), both written by the same `HSET`.
//! - `{prefix}idem:{key}`: serialized record, `PX` = record TTL.
//! - `{prefix}idem-lock:{key}`: in-flight claim token.

use crate::bucket::{BucketPolicy, BucketState, DebitOutcome};
use crate::error::{AdmissionError, Result};
use crate::store::{BucketStore, IdempotencyStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use std::time::Duration;

// Timestamps travel as decimal strings and are split into seconds and
// nanoseconds, because Lua numbers are doubles and cannot hold a Unix
// nanosecond timestamp exactly.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local function split(ts)
    local len = string.len(ts)
    if len <= 9 then
        return 0, tonumber(ts)
    end
    return tonumber(string.sub(ts, 1, len - 9)), tonumber(string.sub(ts, len - 8))
end

local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = ARGV[4]
local ttl_ms = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_refill_at')
local tokens = tonumber(state[1])
local last_refill_at = state[2]
if tokens == nil or last_refill_at == false or last_refill_at == nil then
    tokens = capacity
    last_refill_at = now
end

local now_s, now_ns = split(now)
local last_s, last_ns = split(last_refill_at)
local elapsed = (now_s - last_s) * 1000000000 + (now_ns - last_ns)
if elapsed > 0 then
    tokens = tokens + (elapsed / 1000000000) * refill_rate
    last_refill_at = now
end
if tokens > capacity then
    tokens = capacity
end
if tokens < 0 then
    tokens = 0
end

local admitted = 0
if cost > 0 and tokens >= cost then
    tokens = tokens - cost
    admitted = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill_at', last_refill_at)
if ttl_ms > 0 then
    redis.call('PEXPIRE', key, ttl_ms)
end

return {admitted, tostring(tokens), last_refill_at}
"#;

const REPLACE_IF_EQUALS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

const RELEASE_CLAIM_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    pub key_prefix: String,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            key_prefix: "gatekeeper:".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    config: RedisBackendConfig,
    bucket_script: Script,
    replace_script: Script,
    release_script: Script,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Self::connect_with_config(redis_url, RedisBackendConfig::default()).await
    }

    pub async fn connect_with_config(redis_url: &str, config: RedisBackendConfig) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| AdmissionError::Configuration(format!("Failed to create Redis client: {}", e)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| AdmissionError::BackendUnavailable(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self {
            connection,
            config,
            bucket_script: Script::new(TOKEN_BUCKET_SCRIPT),
            replace_script: Script::new(REPLACE_IF_EQUALS_SCRIPT),
            release_script: Script::new(RELEASE_CLAIM_SCRIPT),
        })
    }

    fn bucket_key(&self, key: &str) -> String {
        format!("{}bucket:{}", self.config.key_prefix, key)
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}idem:{}", self.config.key_prefix, key)
    }

    fn claim_key(&self, key: &str) -> String {
        format!("{}idem-lock:{}", self.config.key_prefix, key)
    }

    async fn run_bucket_script(
        &self,
        key: &str,
        policy: &BucketPolicy,
        cost: f64,
        now: i64,
    ) -> Result<(bool, BucketState)> {
        let mut conn = self.connection.clone();
        let expiry_ms = BucketState::full(policy, now)
            .idle_expiry()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let (admitted, tokens, last_refill_at): (i64, String, String) = self
            .bucket_script
            .key(self.bucket_key(key))
            .arg(policy.capacity)
            .arg(policy.refill_rate)
            .arg(cost)
            .arg(now.to_string())
            .arg(expiry_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AdmissionError::BackendUnavailable(format!("Token bucket script failed: {}", e)))?;

        let tokens: f64 = tokens
            .parse()
            .map_err(|_| AdmissionError::Internal(format!("Unexpected token count '{}' for {}", tokens, key)))?;
        let last_refill_at: i64 = last_refill_at.parse().map_err(|_| {
            AdmissionError::Internal(format!("Unexpected refill timestamp '{}' for {}", last_refill_at, key))
        })?;

        Ok((admitted == 1, BucketState::from_parts(policy, tokens, last_refill_at)))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl BucketStore for RedisBackend {
    async fn read_and_refill(&self, key: &str, policy: &BucketPolicy, now: i64) -> Result<BucketState> {
        let (_, state) = self.run_bucket_script(key, policy, 0.0, now).await?;
        Ok(state)
    }

    async fn try_debit(&self, key: &str, policy: &BucketPolicy, cost: f64, now: i64) -> Result<DebitOutcome> {
        let (admitted, state) = self.run_bucket_script(key, policy, cost, now).await?;
        Ok(DebitOutcome {
            admitted,
            remaining: state.tokens,
            retry_after: if admitted { None } else { state.time_until_available(cost) },
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| AdmissionError::BackendUnavailable(format!("Ping failed: {}", e)))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[async_trait]
impl IdempotencyStore for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.record_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| AdmissionError::BackendUnavailable(format!("GET failed: {}", e)))?;
        Ok(value)
    }

    async fn put_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.record_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| AdmissionError::BackendUnavailable(format!("SET NX failed: {}", e)))?;
        Ok(reply.is_some())
    }

    async fn replace_if_equals(&self, key: &str, expected: &[u8], value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let replaced: i64 = self
            .replace_script
            .key(self.record_key(key))
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AdmissionError::BackendUnavailable(format!("Replace script failed: {}", e)))?;
        Ok(replaced == 1)
    }

    async fn claim(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.claim_key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| AdmissionError::BackendUnavailable(format!("Claim failed: {}", e)))?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .release_script
            .key(self.claim_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AdmissionError::BackendUnavailable(format!("Release script failed: {}", e)))?;
        Ok(deleted > 0)
    }
}

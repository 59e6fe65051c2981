//! Redis window counter store for `quotagate`.
//!
//! Every application instance pointed at the same Redis shares one window per
//! `(client, route)`, so a quota holds for the whole deployment rather than per process.
//! The record-and-check step runs as a single Lua script, which Redis executes atomically.
//!
//! ```rust,no_run
//! use quotagate::{AdmissionEngine, DegradationPolicy, RuleRegistry};
//! use quotagate_redis::RedisCounterStore;
//! # async fn demo(rules: RuleRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisCounterStore::connect("redis://127.0.0.1:6379", "quotagate").await?;
//! let engine = AdmissionEngine::builder(rules)
//!     .store(store)
//!     .degradation(DegradationPolicy::FailOpen)
//!     .build()?;
//! # Ok(()) }
//! ```
//!
//! Window arithmetic uses the Redis server clock, not the caller's. Instances with skewed
//! clocks still agree on window boundaries. Idle windows expire through `PEXPIRE`, so
//! [`CounterStore::sweep`] is a no-op here.

use async_trait::async_trait;
use quotagate::{ClientKey, CounterStore, Decision, RouteRule, StoreError};
use redis::aio::ConnectionManager;
use redis::Script;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Idle multiple used when none is configured; matches the in-memory store.
pub const DEFAULT_IDLE_MULTIPLE: u32 = 10;

// ARGV: ttl, limit count, then (quota, window) per limit.
// Reply: {admitted, quota, remaining, reset_ms} of the deciding window.
const RECORD_SCRIPT: &str = r#"
redis.replicate_commands()
local ttl = tonumber(ARGV[1])
local n = tonumber(ARGV[2])
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local counts, starts, quotas, windows = {}, {}, {}, {}
local blocked_quota, retry = nil, -1
for i = 1, n do
  local quota = tonumber(ARGV[1 + 2 * i])
  local window = tonumber(ARGV[2 + 2 * i])
  local state = redis.call('HMGET', KEYS[1], 'c' .. i, 's' .. i)
  local count = tonumber(state[1]) or 0
  local start = tonumber(state[2]) or now
  if now - start >= window then
    start = now
    count = 0
  end
  counts[i], starts[i], quotas[i], windows[i] = count, start, quota, window
  if count >= quota then
    local wait = math.max(0, start + window - now)
    if wait > retry then
      retry = wait
      blocked_quota = quota
    end
  end
end
local reply
if blocked_quota then
  reply = {0, blocked_quota, 0, retry}
else
  for i = 1, n do
    counts[i] = counts[i] + 1
    local remaining = quotas[i] - counts[i]
    local reset = math.max(0, starts[i] + windows[i] - now)
    if not reply or remaining < reply[3] or (remaining == reply[3] and reset > reply[4]) then
      reply = {1, quotas[i], remaining, reset}
    end
  end
end
for i = 1, n do
  redis.call('HSET', KEYS[1], 'c' .. i, counts[i], 's' .. i, starts[i])
end
redis.call('PEXPIRE', KEYS[1], ttl)
return reply
"#;

/// [`CounterStore`] backed by a Redis hash per `(client, route)`, one field pair per limit.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    prefix: Arc<str>,
    idle_multiple: u32,
    script: Arc<Script>,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("prefix", &self.prefix)
            .field("idle_multiple", &self.idle_multiple)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to `url` and namespace every key under `prefix`.
    ///
    /// The connection manager reconnects on its own after failures; calls made while it is
    /// down surface as [`StoreError::Backend`] and go through the engine's degradation policy.
    pub async fn connect(
        url: &str,
        prefix: impl Into<Arc<str>>,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let prefix = prefix.into();
        info!(target: "quotagate::redis", prefix = %prefix, "connected to redis counter store");
        Ok(Self::from_connection(conn, prefix))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager, prefix: impl Into<Arc<str>>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            idle_multiple: DEFAULT_IDLE_MULTIPLE,
            script: Arc::new(Script::new(RECORD_SCRIPT)),
        }
    }

    /// Expire windows after `multiple` idle window lengths. Zero is treated as one.
    pub fn with_idle_multiple(mut self, multiple: u32) -> Self {
        self.idle_multiple = multiple.max(1);
        self
    }

    /// Key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Redis key of the window for `client` on `route`.
///
/// The route is length-prefixed so routes and client keys containing `:` cannot collide.
pub fn window_key(prefix: &str, client: &ClientKey, route: &str) -> String {
    format!("{}:{}:{}:{}", prefix, route.len(), route, client.as_str())
}

/// Expiry applied to a window key after each touch, from the rule's longest window.
pub fn idle_ttl_millis(window_millis: u64, idle_multiple: u32) -> u64 {
    window_millis.max(1).saturating_mul(u64::from(idle_multiple.max(1)))
}

fn decision_from_reply(
    (admitted, quota, remaining, reset_ms): (i64, i64, i64, i64),
) -> Decision {
    let reset = Duration::from_millis(reset_ms.max(0) as u64);
    let quota = u32::try_from(quota.max(0)).unwrap_or(u32::MAX);
    if admitted == 1 {
        let remaining = u32::try_from(remaining.max(0)).unwrap_or(quota).min(quota);
        Decision::admit(quota, remaining, reset)
    } else {
        Decision::reject(quota, reset)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn record_and_check(
        &self,
        key: &ClientKey,
        rule: &RouteRule,
        _now_millis: u64,
    ) -> Result<Decision, StoreError> {
        let redis_key = window_key(&self.prefix, key, rule.route());
        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(&redis_key);
        invocation
            .arg(idle_ttl_millis(rule.longest_window_millis(), self.idle_multiple))
            .arg(rule.limits().len());
        for limit in rule.limits() {
            invocation.arg(limit.quota()).arg(limit.window_millis());
        }
        let reply: (i64, i64, i64, i64) =
            invocation.invoke_async(&mut conn).await.map_err(|e| {
                debug!(target: "quotagate::redis", key = %redis_key, error = %e, "script failed");
                StoreError::Backend(e.to_string())
            })?;
        Ok(decision_from_reply(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_and_unambiguous() {
        let client = ClientKey::new("2001:db8::1").unwrap();
        assert_eq!(window_key("qg", &client, "/chat"), "qg:5:/chat:2001:db8::1");

        let a = window_key("qg", &ClientKey::new("b").unwrap(), "/a:");
        let b = window_key("qg", &ClientKey::new(":b").unwrap(), "/a");
        assert_ne!(a, b);
    }

    #[test]
    fn ttl_scales_with_window() {
        assert_eq!(idle_ttl_millis(60_000, 10), 600_000);
        assert_eq!(idle_ttl_millis(0, 0), 1);
        assert_eq!(idle_ttl_millis(u64::MAX, 2), u64::MAX);
    }

    #[test]
    fn replies_map_to_decisions() {
        let admitted = decision_from_reply((1, 5, 3, 30_000));
        assert!(admitted.is_admitted());
        assert_eq!((admitted.limit, admitted.remaining), (5, 3));
        assert_eq!(admitted.reset_after, Duration::from_secs(30));

        let rejected = decision_from_reply((0, 50, 0, 1_500));
        assert!(!rejected.is_admitted());
        assert_eq!((rejected.limit, rejected.remaining), (50, 0));
        assert_eq!(rejected.retry_after, Duration::from_millis(1_500));

        let garbled = decision_from_reply((1, 5, 9, -1));
        assert_eq!((garbled.remaining, garbled.reset_after), (5, Duration::ZERO));
    }
}

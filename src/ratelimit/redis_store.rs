//! Redis-backed counter store
//!
//! Each window is a sorted set scored by admission time. A single Lua script
//! prunes, counts and (when every window has room) inserts across all keys,
//! so admission stays linearizable across gateway instances.

use super::store::{AcquireResult, CounterStore, StoreError, WindowCheck, WindowState};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, info};

const ACQUIRE_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local member = ARGV[2]
local counts = {}
local oldest = {}
local failed = 0

for i = 1, #KEYS do
    local limit = tonumber(ARGV[1 + i * 2])
    local window = tonumber(ARGV[2 + i * 2])
    redis.call('ZREMRANGEBYSCORE', KEYS[i], '-inf', now - window)
    local count = redis.call('ZCARD', KEYS[i])
    counts[i] = count
    local first = redis.call('ZRANGE', KEYS[i], 0, 0, 'WITHSCORES')
    if first[2] then
        oldest[i] = tonumber(first[2])
    else
        oldest[i] = -1
    end
    if failed == 0 and count >= limit then
        failed = i
    end
end

if failed == 0 then
    for i = 1, #KEYS do
        local window = tonumber(ARGV[2 + i * 2])
        redis.call('ZADD', KEYS[i], now, member)
        redis.call('PEXPIRE', KEYS[i], window)
        counts[i] = counts[i] + 1
        if oldest[i] < 0 then
            oldest[i] = now
        end
    end
end

local result = {failed}
for i = 1, #KEYS do
    table.insert(result, counts[i])
    table.insert(result, oldest[i])
end
return result
";

/// Counter store shared through Redis sorted sets
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
    script: Script,
    key_prefix: String,
}

impl RedisCounterStore {
    /// Connect and verify the server answers
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        info!("Connecting to Redis counter store at: {}", url);
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        let store = Self {
            conn,
            script: Script::new(ACQUIRE_SCRIPT),
            key_prefix: key_prefix.to_string(),
        };
        store.ping().await?;
        info!("Successfully connected to Redis counter store");
        Ok(store)
    }

    /// All keys under the prefix, walked with SCAN
    async fn scan_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

fn parse_acquire_reply(reply: &[i64], windows: usize) -> Result<AcquireResult, StoreError> {
    if reply.len() != 1 + windows * 2 {
        return Err(StoreError::Protocol(format!(
            "expected {} values, got {}",
            1 + windows * 2,
            reply.len()
        )));
    }

    let failed = match reply[0] {
        0 => None,
        i => Some(i as usize - 1),
    };
    let states = reply[1..]
        .chunks_exact(2)
        .map(|pair| WindowState {
            count: pair[0].max(0) as u32,
            oldest_ms: (pair[1] >= 0).then_some(pair[1] as u64),
        })
        .collect();

    Ok(AcquireResult {
        admitted: failed.is_none(),
        failed,
        windows: states,
    })
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn acquire(&self, checks: &[WindowCheck], now_ms: u64) -> Result<AcquireResult, StoreError> {
        if checks.is_empty() {
            return Ok(AcquireResult {
                admitted: true,
                failed: None,
                windows: vec![],
            });
        }

        let mut conn = self.conn.clone();
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4().simple());

        let mut invocation = self.script.prepare_invoke();
        for check in checks {
            invocation.key(&check.key);
        }
        invocation.arg(now_ms).arg(member);
        for check in checks {
            invocation.arg(check.limit).arg(check.window_ms());
        }

        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        parse_acquire_reply(&reply, checks.len())
    }

    async fn usage(&self, key: &str, window: Duration, now_ms: u64) -> Result<u32, StoreError> {
        let mut conn = self.conn.clone();
        let min = format!("({}", now_ms.saturating_sub(window.as_millis() as u64));
        let count: u32 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(min)
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    /// Windows carry a PEXPIRE, so Redis drops idle keys on its own; this only
    /// removes keys left empty by an interrupted script.
    async fn prune(&self, _now_ms: u64) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let mut removed = 0;
        for key in self.scan_keys().await? {
            let count: u64 = redis::cmd("ZCARD").arg(&key).query_async(&mut conn).await?;
            if count == 0 {
                let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                removed += 1;
            }
        }
        debug!("Redis counter store prune removed {} keys", removed);
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let keys = self.scan_keys().await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
        info!("Deleted {} rate limit keys", deleted);
        Ok(())
    }

    async fn key_count(&self) -> Result<usize, StoreError> {
        Ok(self.scan_keys().await?.len())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

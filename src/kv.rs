//! The `Store` trait abstracts every raw command the system issues against
//! the KV store (lists, sorted sets, streams, strings, and the two scripted
//! atomic operations) behind a single seam. `RedisStore` is the production
//! implementation; `tests/common` provides an in-memory fake so the worker,
//! queue, context, and registry test suites have no network dependency,
//! mirroring the teacher crate's own pattern of mocking the HTTP layer
//! rather than hitting a live endpoint.
//!
//! `QueueService`, `ContextStore`, and `ToolRegistry`'s embedding cache each
//! hold an `Arc<dyn Store>` and touch only their own keyspace through it;
//! the distributed lock and rate limiter below are the "shared primitives"
//! every other component borrows.

use crate::error::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadOptions;
use uuid::Uuid;

/// One entry read back off a stream via [`Store::stream_read_group`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

/// Everything the system needs from the KV store, independent of backend.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_string(&self, key: &str) -> Result<Option<String>>;
    async fn set_string(&self, key: &str, value: &str, ttl_secs: Option<usize>) -> Result<()>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, ttl_secs: usize) -> Result<()>;

    /// Compare-and-set: sets `key` to `value` with a millisecond TTL only
    /// if it doesn't already exist. Returns whether the set happened.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: usize) -> Result<bool>;
    /// Compare-and-delete: removes `key` only if its value equals `value`.
    async fn delete_if_matches(&self, key: &str, value: &str) -> Result<bool>;

    async fn list_push_right(&self, key: &str, value: &str) -> Result<()>;
    async fn list_pop_left_blocking(&self, key: &str, timeout_secs: f64) -> Result<Option<String>>;
    async fn list_get_all(&self, key: &str) -> Result<Vec<String>>;
    /// Replaces the whole list atomically and refreshes its TTL.
    async fn list_replace(&self, key: &str, values: &[String], ttl_secs: usize) -> Result<()>;

    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<()>;
    /// Atomically pops the lowest-scored member with score `<= max_score`,
    /// or `None` if no member qualifies.
    async fn zset_pop_due(&self, key: &str, max_score: i64) -> Result<Option<String>>;

    async fn stream_ensure_group(&self, key: &str, group: &str) -> Result<()>;
    async fn stream_add(&self, key: &str, payload: &str) -> Result<String>;
    async fn stream_read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<StreamEntry>>;
    async fn stream_ack_del(&self, key: &str, group: &str, id: &str) -> Result<()>;
}

/// Compare-and-delete Lua script backing [`Store::delete_if_matches`].
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Pop-if-due Lua script backing [`Store::zset_pop_due`].
const POP_DUE_SCRIPT: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, 1)
if #due == 0 then
    return nil
end
redis.call("ZREM", KEYS[1], due[1])
return due[1]
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_string(&self, key: &str, value: &str, ttl_secs: Option<usize>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl_secs {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl as u64).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn expire(&self, key: &str, ttl_secs: usize) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl_secs as i64).await?;
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: usize) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_matches(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let deleted: i64 = script.key(key).arg(value).invoke_async(&mut conn).await?;
        Ok(deleted == 1)
    }

    async fn list_push_right(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn list_pop_left_blocking(&self, key: &str, timeout_secs: f64) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let reply: Option<(String, String)> = conn.blpop(key, timeout_secs).await?;
        Ok(reply.map(|(_, value)| value))
    }

    async fn list_get_all(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn list_replace(&self, key: &str, values: &[String], ttl_secs: usize) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(key);
        if !values.is_empty() {
            pipe.rpush(key, values);
        }
        pipe.expire(key, ttl_secs as i64);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zset_pop_due(&self, key: &str, max_score: i64) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(POP_DUE_SCRIPT);
        Ok(script.key(key).arg(max_score).invoke_async(&mut conn).await?)
    }

    async fn stream_ensure_group(&self, key: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(key, group, "$").await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_add(&self, key: &str, payload: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        Ok(conn.xadd(key, "*", &[("payload", payload)]).await?)
    }

    async fn stream_read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default().group(group, consumer).count(count).block(block_ms);
        let reply: redis::streams::StreamReadReply =
            conn.xread_options(&[key], &[">"], &opts).await?;

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                let Some(value) = id.map.get("payload") else { continue };
                if let Ok(payload) = redis::from_redis_value::<String>(value) {
                    entries.push(StreamEntry { id: id.id.clone(), payload });
                }
            }
        }
        Ok(entries)
    }

    async fn stream_ack_del(&self, key: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(key, group, &[id]).await?;
        let _: i64 = conn.xdel(key, &[id]).await?;
        Ok(())
    }
}

/// Distributed lock acquired via `Store::set_nx_px` / released via
/// `Store::delete_if_matches` (SPEC_FULL.md §4.8). Held resources live
/// under `lock:<resource>`.
pub struct LockGuard<'a> {
    store: &'a dyn Store,
    resource: String,
    token: String,
}

impl<'a> LockGuard<'a> {
    /// Tries to acquire `lock:<resource>` for `ttl_ms` milliseconds.
    /// `Ok(None)` (not an error) means the lock is already held — callers
    /// treat that as "duplicate delivery, skip processing".
    pub async fn acquire(store: &'a dyn Store, resource: impl Into<String>, ttl_ms: usize) -> Result<Option<Self>> {
        let resource = resource.into();
        let key = format!("lock:{resource}");
        let token = Uuid::new_v4().to_string();
        if store.set_nx_px(&key, &token, ttl_ms).await? {
            Ok(Some(Self { store, resource, token }))
        } else {
            Ok(None)
        }
    }

    pub async fn release(self) -> Result<()> {
        let key = format!("lock:{}", self.resource);
        self.store.delete_if_matches(&key, &self.token).await?;
        Ok(())
    }
}

/// `INCR rate:<sender>`; sets a 60s TTL on the first increment in a window
/// (SPEC_FULL.md §4.7). Returns the post-increment count; callers deny at
/// count > 20.
pub async fn incr_rate(store: &dyn Store, sender: &str) -> Result<i64> {
    let key = format!("rate:{sender}");
    let count = store.incr(&key).await?;
    if count == 1 {
        store.expire(&key, 60).await?;
    }
    Ok(count)
}

/// Writes this worker's heartbeat key (TTL 30s) plus the aggregate
/// `worker:heartbeat` key.
pub async fn heartbeat(store: &dyn Store, host: &str, worker_id: &str) -> Result<()> {
    let now = crate::utils::now_millis().to_string();
    store
        .set_string(&format!("worker:heartbeat:{host}:{worker_id}"), &now, Some(30))
        .await?;
    store.set_string("worker:heartbeat", &now, Some(30)).await
}

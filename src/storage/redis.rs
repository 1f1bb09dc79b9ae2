// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the document cache, recency record and write-behind queue.
//!
//! All multi-key writes go through a single `MULTI/EXEC` pipeline built from
//! [`KvOp`]s, so a document, its index entries and its recency stamp are
//! written together. Pub/sub uses a dedicated connection per subscription
//! because a `ConnectionManager` cannot enter subscriber mode.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, AsyncCommands, Client};
use tracing::{debug, warn};

use super::traits::{KvOp, KvStore, MemoryInfo, MessageStream, ScoreBound, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// KEYS[1] = list, KEYS[2] = stats hash, ARGV[1] = count field, ARGV[2] = ts field
const SYNC_LIST_STATS: &str = r#"
local len = redis.call('LLEN', KEYS[1])
redis.call('HSET', KEYS[2], ARGV[1], len)
if len == 0 then
  redis.call('HDEL', KEYS[2], ARGV[2])
  return 0
end
local ok, head = pcall(cjson.decode, redis.call('LINDEX', KEYS[1], 0))
if ok and type(head) == 'table' and type(head.ts) == 'number' then
  redis.call('HSET', KEYS[2], ARGV[2], string.format('%.0f', head.ts))
end
return len
"#;

pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
}

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl RedisStore {
    /// Connect to Redis, retrying with the startup preset.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(backend)?;

        // Fast-fail after ~5 attempts so bad config surfaces at startup
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)?;

        Ok(Self { client, connection })
    }

    /// Clone of the underlying connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    fn push_op(pipeline: &mut redis::Pipeline, op: &KvOp) {
        match op {
            KvOp::HashSet { key, fields } => {
                if !fields.is_empty() {
                    pipeline.hset_multiple(key, fields.as_slice()).ignore();
                }
            }
            KvOp::HashSetField { key, field, value } => {
                pipeline.hset(key, field, value).ignore();
            }
            KvOp::HashSetIfAbsent { key, field, value } => {
                pipeline.hset_nx(key, field, value).ignore();
            }
            KvOp::HashDelete { key, field } => {
                pipeline.hdel(key, field).ignore();
            }
            KvOp::HashIncr { key, field, delta } => {
                pipeline.hincr(key, field, *delta).ignore();
            }
            KvOp::Delete { key } => {
                pipeline.del(key).ignore();
            }
            KvOp::SetAdd { key, member } => {
                pipeline.sadd(key, member).ignore();
            }
            KvOp::SetRemove { key, member } => {
                pipeline.srem(key, member).ignore();
            }
            KvOp::SortedAdd { key, member, score } => {
                pipeline.zadd(key, member, *score).ignore();
            }
            KvOp::SortedRemove { key, member } => {
                pipeline.zrem(key, member).ignore();
            }
            KvOp::ListPush { key, value } => {
                pipeline.rpush(key, value).ignore();
            }
            KvOp::SetWithTtl { key, value, ttl_secs } => {
                pipeline.set_ex(key, value, *ttl_secs).ignore();
            }
            KvOp::SyncListStats { list, key, count_field, ts_field } => {
                pipeline
                    .cmd("EVAL")
                    .arg(SYNC_LIST_STATS)
                    .arg(2)
                    .arg(list)
                    .arg(key)
                    .arg(count_field)
                    .arg(ts_field)
                    .ignore();
            }
        }
    }
}

/// Extract a numeric `name:value` line from `INFO` output.
pub(crate) fn parse_info_field(info: &str, name: &str) -> Option<u64> {
    info.lines().find_map(|line| {
        let (key, value) = line.trim_end_matches('\r').split_once(':')?;
        if key == name {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

#[async_trait]
impl KvStore for RedisStore {
    async fn apply(&self, ops: &[KvOp]) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipeline = pipe();
        pipeline.atomic();
        for op in ops {
            Self::push_op(&mut pipeline, op);
        }
        let mut conn = self.connection.clone();
        pipeline.query_async::<()>(&mut conn).await.map_err(backend)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        let mut conn = self.connection.clone();
        conn.hgetall(key).await.map_err(backend)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        conn.exists(key).await.map_err(backend)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(backend)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        conn.smembers(key).await.map_err(backend)
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        conn.zrangebyscore(key, min.to_string(), max.to_string())
            .await
            .map_err(backend)
    }

    async fn sorted_head(&self, key: &str, count: usize) -> Result<Vec<String>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let stop = isize::try_from(count).unwrap_or(isize::MAX) - 1;
        conn.zrange(key, 0, stop).await.map_err(backend)
    }

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        let mut conn = self.connection.clone();
        conn.zscore(key, member).await.map_err(backend)
    }

    async fn list_pop(&self, key: &str, count: usize) -> Result<Vec<String>, StorageError> {
        let Some(count) = NonZeroUsize::new(count) else {
            return Ok(Vec::new());
        };
        let mut conn = self.connection.clone();
        // LPOP with a count replies nil for a missing key
        let popped: Option<Vec<String>> = conn.lpop(key, Some(count)).await.map_err(backend)?;
        Ok(popped.unwrap_or_default())
    }

    async fn list_head(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        conn.lindex(key, 0).await.map_err(backend)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StorageError> {
        let mut conn = self.connection.clone();
        conn.llen(key).await.map_err(backend)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let receivers: i64 = conn.publish(channel, message).await.map_err(backend)?;
        debug!(channel, receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StorageError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        pubsub.subscribe(channel).await.map_err(backend)?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(error = %e, "Dropping non-text pub/sub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn memory_info(&self) -> Result<MemoryInfo, StorageError> {
        let mut conn = self.connection.clone();
        let info: String = cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let used_bytes = parse_info_field(&info, "used_memory").ok_or_else(|| {
            StorageError::Backend("INFO memory reply has no used_memory field".into())
        })?;
        let total_system_bytes = parse_info_field(&info, "total_system_memory").unwrap_or(0);

        Ok(MemoryInfo {
            used_bytes,
            total_system_bytes,
        })
    }
}

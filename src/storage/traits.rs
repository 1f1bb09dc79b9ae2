// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Unknown collection '{0}'")]
    UnknownCollection(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True for errors caused by the caller's input rather than a backend.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, StorageError::Validation(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// One bound of a sorted-set score range query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInfinity,
    PosInfinity,
    Inclusive(f64),
    Exclusive(f64),
}

impl ScoreBound {
    /// Whether `score` satisfies this bound used as a range minimum.
    #[must_use]
    pub fn admits_from_below(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInfinity => true,
            ScoreBound::PosInfinity => false,
            ScoreBound::Inclusive(b) => score >= b,
            ScoreBound::Exclusive(b) => score > b,
        }
    }

    /// Whether `score` satisfies this bound used as a range maximum.
    #[must_use]
    pub fn admits_from_above(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInfinity => false,
            ScoreBound::PosInfinity => true,
            ScoreBound::Inclusive(b) => score <= b,
            ScoreBound::Exclusive(b) => score < b,
        }
    }
}

/// Renders the bound in `ZRANGEBYSCORE` syntax (`-inf`, `+inf`, `5`, `(5`).
impl fmt::Display for ScoreBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreBound::NegInfinity => write!(f, "-inf"),
            ScoreBound::PosInfinity => write!(f, "+inf"),
            ScoreBound::Inclusive(v) => write!(f, "{}", v),
            ScoreBound::Exclusive(v) => write!(f, "({}", v),
        }
    }
}

/// A single write against the key-value store.
///
/// Writes are grouped into a slice and applied by [`KvStore::apply`] as one
/// atomic unit (MULTI/EXEC on Redis).
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    /// HSET key f1 v1 f2 v2 ...
    HashSet { key: String, fields: Vec<(String, String)> },
    /// HSET key field value (overwrites)
    HashSetField { key: String, field: String, value: String },
    /// HSETNX key field value
    HashSetIfAbsent { key: String, field: String, value: String },
    /// HDEL key field
    HashDelete { key: String, field: String },
    /// HINCRBY key field delta
    HashIncr { key: String, field: String, delta: i64 },
    /// DEL key
    Delete { key: String },
    /// SADD key member
    SetAdd { key: String, member: String },
    /// SREM key member
    SetRemove { key: String, member: String },
    /// ZADD key score member
    SortedAdd { key: String, member: String, score: f64 },
    /// ZREM key member
    SortedRemove { key: String, member: String },
    /// RPUSH key value
    ListPush { key: String, value: String },
    /// SET key value EX ttl
    SetWithTtl { key: String, value: String, ttl_secs: u64 },
    /// Recount a queue list into a stats hash in one step: `count_field`
    /// becomes LLEN(list) and `ts_field` the `"ts"` of the JSON entry at the
    /// head. `ts_field` is removed when the list is empty and left alone when
    /// the head has no readable `"ts"`.
    SyncListStats {
        list: String,
        key: String,
        count_field: String,
        ts_field: String,
    },
}

/// Memory usage as reported by the backing store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Bytes currently used by the store (`used_memory`)
    pub used_bytes: u64,
    /// Total memory of the host the store runs on (`total_system_memory`), 0 if unknown
    pub total_system_bytes: u64,
}

/// Stream of pub/sub message payloads for one channel.
pub type MessageStream = BoxStream<'static, String>;

/// The key-value primitives the document cache, eviction sentinel,
/// write-behind queue and flux bus are built on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Apply all writes atomically, in order.
    async fn apply(&self, ops: &[KvOp]) -> Result<(), StorageError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError>;

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<Vec<String>, StorageError>;

    /// Lowest-scored `count` members, ascending.
    async fn sorted_head(&self, key: &str, count: usize) -> Result<Vec<String>, StorageError>;

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError>;

    /// Pop up to `count` values from the head of a list, oldest first.
    async fn list_pop(&self, key: &str, count: usize) -> Result<Vec<String>, StorageError>;

    /// Peek at the head of a list without removing it.
    async fn list_head(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn list_len(&self, key: &str) -> Result<usize, StorageError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError>;

    /// Subscribe to a channel. The stream ends when the subscription is dropped
    /// by the backend.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StorageError>;

    async fn memory_info(&self) -> Result<MemoryInfo, StorageError>;
}

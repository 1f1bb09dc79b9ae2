// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`KvStore`] with Redis semantics, used by unit tests and by
//! embedders that run without a Redis server.
//!
//! The whole keyspace sits behind one lock so a [`KvOp`] batch is applied
//! atomically, matching `MULTI/EXEC`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::traits::{KvOp, KvStore, MemoryInfo, MessageStream, ScoreBound, StorageError};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Keyspace {
    strings: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    sorted: HashMap<String, HashMap<String, f64>>,
    lists: HashMap<String, VecDeque<String>>,
}

/// `"ts"` of a JSON queue entry, if it has a numeric one.
fn head_timestamp(raw: &str) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let ts = value.get("ts")?;
    ts.as_i64().or_else(|| ts.as_f64().map(|f| f as i64))
}

impl Keyspace {
    fn remove_key(&mut self, key: &str) {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.sets.remove(key);
        self.sorted.remove(key);
        self.lists.remove(key);
    }

    fn live_string(&self, key: &str) -> Option<&String> {
        match self.strings.get(key) {
            Some((value, Some(deadline))) if Instant::now() < *deadline => Some(value),
            Some((value, None)) => Some(value),
            _ => None,
        }
    }

    fn apply(&mut self, op: &KvOp) -> Result<(), StorageError> {
        match op {
            KvOp::HashSet { key, fields } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                for (f, v) in fields {
                    hash.insert(f.clone(), v.clone());
                }
            }
            KvOp::HashSetField { key, field, value } => {
                self.hashes
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone());
            }
            KvOp::HashSetIfAbsent { key, field, value } => {
                self.hashes
                    .entry(key.clone())
                    .or_default()
                    .entry(field.clone())
                    .or_insert_with(|| value.clone());
            }
            KvOp::HashDelete { key, field } => {
                if let Some(hash) = self.hashes.get_mut(key) {
                    hash.remove(field);
                    if hash.is_empty() {
                        self.hashes.remove(key);
                    }
                }
            }
            KvOp::HashIncr { key, field, delta } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                let current = match hash.get(field) {
                    Some(raw) => raw.parse::<i64>().map_err(|_| {
                        StorageError::Backend(format!("hash value at {}/{} is not an integer", key, field))
                    })?,
                    None => 0,
                };
                hash.insert(field.clone(), (current + delta).to_string());
            }
            KvOp::Delete { key } => self.remove_key(key),
            KvOp::SetAdd { key, member } => {
                self.sets.entry(key.clone()).or_default().insert(member.clone());
            }
            KvOp::SetRemove { key, member } => {
                if let Some(set) = self.sets.get_mut(key) {
                    set.remove(member);
                    if set.is_empty() {
                        self.sets.remove(key);
                    }
                }
            }
            KvOp::SortedAdd { key, member, score } => {
                self.sorted
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
            KvOp::SortedRemove { key, member } => {
                if let Some(zset) = self.sorted.get_mut(key) {
                    zset.remove(member);
                    if zset.is_empty() {
                        self.sorted.remove(key);
                    }
                }
            }
            KvOp::ListPush { key, value } => {
                self.lists.entry(key.clone()).or_default().push_back(value.clone());
            }
            KvOp::SetWithTtl { key, value, ttl_secs } => {
                let deadline = Instant::now() + Duration::from_secs(*ttl_secs);
                self.strings.insert(key.clone(), (value.clone(), Some(deadline)));
            }
            KvOp::SyncListStats { list, key, count_field, ts_field } => {
                let (len, head_ts) = match self.lists.get(list) {
                    Some(entries) => (entries.len(), entries.front().and_then(|raw| head_timestamp(raw))),
                    None => (0, None),
                };
                let hash = self.hashes.entry(key.clone()).or_default();
                hash.insert(count_field.clone(), len.to_string());
                if len == 0 {
                    hash.remove(ts_field);
                } else if let Some(ts) = head_ts {
                    hash.insert(ts_field.clone(), ts.to_string());
                }
            }
        }
        Ok(())
    }

    /// Members of a sorted set ordered by (score, member), like Redis.
    fn ordered_members(&self, key: &str) -> Vec<(&String, f64)> {
        let mut members: Vec<(&String, f64)> = self
            .sorted
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m, *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        members
    }

    fn approximate_bytes(&self) -> u64 {
        let strings: usize = self.strings.iter().map(|(k, (v, _))| k.len() + v.len()).sum();
        let hashes: usize = self
            .hashes
            .iter()
            .map(|(k, h)| k.len() + h.iter().map(|(f, v)| f.len() + v.len()).sum::<usize>())
            .sum();
        let sets: usize = self
            .sets
            .iter()
            .map(|(k, s)| k.len() + s.iter().map(String::len).sum::<usize>())
            .sum();
        let sorted: usize = self
            .sorted
            .iter()
            .map(|(k, z)| k.len() + z.keys().map(|m| m.len() + 8).sum::<usize>())
            .sum();
        let lists: usize = self
            .lists
            .iter()
            .map(|(k, l)| k.len() + l.iter().map(String::len).sum::<usize>())
            .sum();
        (strings + hashes + sets + sorted + lists) as u64
    }
}

pub struct InMemoryStore {
    keyspace: Mutex<Keyspace>,
    channels: DashMap<String, broadcast::Sender<String>>,
    total_system_bytes: u64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            channels: DashMap::new(),
            total_system_bytes: 0,
        }
    }

    /// Report `bytes` as the host's total memory in [`KvStore::memory_info`].
    #[must_use]
    pub fn with_total_memory(mut self, bytes: u64) -> Self {
        self.total_system_bytes = bytes;
        self
    }

    /// Number of live keys of any type.
    #[must_use]
    pub fn key_count(&self) -> usize {
        let ks = self.keyspace.lock();
        let live_strings = ks.strings.keys().filter(|k| ks.live_string(k).is_some()).count();
        live_strings + ks.hashes.len() + ks.sets.len() + ks.sorted.len() + ks.lists.len()
    }

    /// Approximate bytes held, as reported in `used_bytes`.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.keyspace.lock().approximate_bytes()
    }

    /// Drop every key.
    pub fn clear(&self) {
        *self.keyspace.lock() = Keyspace::default();
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn apply(&self, ops: &[KvOp]) -> Result<(), StorageError> {
        let mut ks = self.keyspace.lock();
        // Validate increments up front so a failing batch leaves nothing behind
        for op in ops {
            if let KvOp::HashIncr { key, field, .. } = op {
                if let Some(raw) = ks.hashes.get(key).and_then(|h| h.get(field)) {
                    if raw.parse::<i64>().is_err() {
                        return Err(StorageError::Backend(format!(
                            "hash value at {}/{} is not an integer",
                            key, field
                        )));
                    }
                }
            }
        }
        for op in ops {
            ks.apply(op)?;
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        Ok(self.keyspace.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let ks = self.keyspace.lock();
        Ok(ks.live_string(key).is_some()
            || ks.hashes.contains_key(key)
            || ks.sets.contains_key(key)
            || ks.sorted.contains_key(key)
            || ks.lists.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.keyspace.lock().live_string(key).cloned())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .keyspace
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<Vec<String>, StorageError> {
        let ks = self.keyspace.lock();
        Ok(ks
            .ordered_members(key)
            .into_iter()
            .filter(|(_, score)| min.admits_from_below(*score) && max.admits_from_above(*score))
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn sorted_head(&self, key: &str, count: usize) -> Result<Vec<String>, StorageError> {
        let ks = self.keyspace.lock();
        Ok(ks
            .ordered_members(key)
            .into_iter()
            .take(count)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        Ok(self
            .keyspace
            .lock()
            .sorted
            .get(key)
            .and_then(|z| z.get(member).copied()))
    }

    async fn list_pop(&self, key: &str, count: usize) -> Result<Vec<String>, StorageError> {
        let mut ks = self.keyspace.lock();
        let Some(list) = ks.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let take = count.min(list.len());
        let popped: Vec<String> = list.drain(..take).collect();
        if list.is_empty() {
            ks.lists.remove(key);
        }
        Ok(popped)
    }

    async fn list_head(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .keyspace
            .lock()
            .lists
            .get(key)
            .and_then(|l| l.front().cloned()))
    }

    async fn list_len(&self, key: &str) -> Result<usize, StorageError> {
        Ok(self.keyspace.lock().lists.get(key).map_or(0, VecDeque::len))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StorageError> {
        // No subscribers is not an error, same as Redis PUBLISH returning 0
        let _ = self.sender(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StorageError> {
        let receiver = self.sender(channel).subscribe();
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn memory_info(&self) -> Result<MemoryInfo, StorageError> {
        Ok(MemoryInfo {
            used_bytes: self.used_bytes(),
            total_system_bytes: self.total_system_bytes,
        })
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sharded write-behind queue with a per-shard dashboard.
//!
//! Each (shard, entity, action) triple owns a FIFO list
//! `q:{shard}:{Entity}:{ACTION}`. The dashboard hash `h:stats:{shard}` keeps,
//! per triple, a pending count and the enqueue time of the oldest pending
//! event so the scheduler can pick work without touching the lists.
//!
//! The dashboard is advisory: after every pop a background task recounts it
//! from the list in one atomic step, so it may lag the lists briefly but never
//! hides a pending event.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::event::{Action, AsyncEvent, EntityType, Target};
use crate::keys;
use crate::metrics;
use crate::storage::{KvOp, KvStore, StorageError};

/// Dashboard row for one (entity, action) queue of a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub entity: EntityType,
    pub action: Action,
    pub count: u64,
    /// Enqueue time of the oldest pending event, Unix milliseconds
    pub oldest_ts_ms: Option<i64>,
    /// How long the oldest pending event has waited
    pub age: Duration,
}

/// Shard owning a partition key: CRC-32 of its decimal form.
#[must_use]
pub fn shard_for(partition_key: i64, shard_count: u32) -> u32 {
    crc32fast::hash(partition_key.to_string().as_bytes()) % shard_count.max(1)
}

pub struct WriteBehindQueue {
    store: Arc<dyn KvStore>,
    shard_count: u32,
}

impl WriteBehindQueue {
    pub fn new(store: Arc<dyn KvStore>, shard_count: u32) -> Self {
        Self {
            store,
            shard_count: shard_count.max(1),
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Shard for an event; a missing or zero partition key falls back to the id.
    #[must_use]
    pub fn shard_of(&self, id: i64, partition_key: Option<i64>) -> u32 {
        let key = partition_key.filter(|k| *k != 0).unwrap_or(id);
        shard_for(key, self.shard_count)
    }

    /// Build and append an event. Returns it with its enqueue timestamp.
    pub async fn enqueue(
        &self,
        id: i64,
        partition_key: Option<i64>,
        entity: EntityType,
        action: Action,
        payload: Value,
        targets: Target,
    ) -> Result<AsyncEvent, StorageError> {
        let event = AsyncEvent::new(id, entity, action, payload, targets);
        self.enqueue_event(&event, partition_key).await?;
        Ok(event)
    }

    /// Append a prepared event and bump the dashboard in one atomic batch.
    /// Returns the shard it landed on.
    pub async fn enqueue_event(&self, event: &AsyncEvent, partition_key: Option<i64>) -> Result<u32, StorageError> {
        let shard = self.shard_of(event.id, partition_key);
        let entity = event.entity.as_str();
        let action = event.action.as_str();
        let stats = keys::shard_stats(shard);

        let ops = [
            KvOp::ListPush {
                key: keys::queue(shard, entity, action),
                value: serde_json::to_string(event)?,
            },
            KvOp::HashIncr {
                key: stats.clone(),
                field: keys::stats_count_field(entity, action),
                delta: 1,
            },
            KvOp::HashSetIfAbsent {
                key: stats,
                field: keys::stats_ts_field(entity, action),
                value: event.timestamp_ms.to_string(),
            },
        ];
        self.store.apply(&ops).await?;

        metrics::record_enqueue(entity, action);
        Ok(shard)
    }

    /// Dashboard rows with pending work for a shard.
    pub async fn shard_stats(&self, shard: u32) -> Result<Vec<QueueStats>, StorageError> {
        let raw = self.store.hash_get_all(&keys::shard_stats(shard)).await?;
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut rows: std::collections::BTreeMap<(EntityType, Action), QueueStats> = Default::default();
        for (field, value) in &raw {
            let mut parts = field.rsplitn(3, ':');
            let (Some(kind), Some(action), Some(entity)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            let Some(action) = Action::parse(action) else { continue };
            let entity = EntityType::from(entity);
            let row = rows.entry((entity.clone(), action)).or_insert_with(|| QueueStats {
                entity,
                action,
                count: 0,
                oldest_ts_ms: None,
                age: Duration::ZERO,
            });

            let Ok(number) = value.parse::<i64>() else { continue };
            match kind {
                "count" => row.count = number.max(0) as u64,
                "ts" => {
                    row.oldest_ts_ms = Some(number);
                    row.age = Duration::from_millis(now_ms.saturating_sub(number).max(0) as u64);
                }
                _ => {}
            }
        }

        Ok(rows.into_values().filter(|row| row.count > 0).collect())
    }

    /// Pop up to `count` events from one queue, oldest first.
    ///
    /// Entries that fail to decode are logged and dropped. The dashboard is
    /// corrected in a background task.
    pub async fn pop_batch(
        &self,
        shard: u32,
        entity: &EntityType,
        action: Action,
        count: usize,
    ) -> Result<Vec<AsyncEvent>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let queue_key = keys::queue(shard, entity.as_str(), action.as_str());
        let raw = self.store.list_pop(&queue_key, count).await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let popped = raw.len();
        let mut events = Vec::with_capacity(popped);
        for entry in raw {
            match serde_json::from_str::<AsyncEvent>(&entry) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(queue = %queue_key, error = %e, "Dropping undecodable queue entry");
                    metrics::record_undecodable_event();
                }
            }
        }
        metrics::record_pop(popped);

        let store = self.store.clone();
        let entity = entity.clone();
        tokio::spawn(async move {
            if let Err(e) = refresh_dashboard(store.as_ref(), shard, &entity, action, popped).await {
                warn!(shard, entity = %entity, action = %action, error = %e, "Dashboard refresh failed");
            }
        });

        Ok(events)
    }

    /// Events currently waiting in one queue.
    pub async fn pending(&self, shard: u32, entity: &EntityType, action: Action) -> Result<usize, StorageError> {
        self.store
            .list_len(&keys::queue(shard, entity.as_str(), action.as_str()))
            .await
    }
}

/// Recount the queue into the dashboard: `count` from the list length and
/// the oldest timestamp from the new head, cleared when the queue drained.
///
/// Runs as one atomic step so an enqueue landing mid-refresh is never
/// overwritten.
async fn refresh_dashboard(
    store: &dyn KvStore,
    shard: u32,
    entity: &EntityType,
    action: Action,
    popped: usize,
) -> Result<(), StorageError> {
    store
        .apply(&[KvOp::SyncListStats {
            list: keys::queue(shard, entity.as_str(), action.as_str()),
            key: keys::shard_stats(shard),
            count_field: keys::stats_count_field(entity.as_str(), action.as_str()),
            ts_field: keys::stats_ts_field(entity.as_str(), action.as_str()),
        }])
        .await?;
    debug!(shard, entity = %entity, action = %action, popped, "Dashboard refreshed");
    Ok(())
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One polling worker per queue shard.
//!
//! Each tick a worker reads its shard's dashboard, picks a queue, pops up to
//! `max_batch_size` events and waits until the flush stage is done with them.
//! A slow store only holds back the shard that is waiting on it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::dispatch::{BatchOutcome, FlushHandle, FlushStage};
use super::scheduler::SchedulerPolicy;
use crate::metrics;
use crate::queue::WriteBehindQueue;
use crate::storage::StorageError;

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing pending on the shard
    Idle,
    /// The dashboard pointed at a queue that turned out empty
    Empty,
    Flushed { events: usize, outcome: BatchOutcome },
}

pub struct ShardWorker {
    shard: u32,
    queue: Arc<WriteBehindQueue>,
    policy: SchedulerPolicy,
    flush: FlushHandle,
}

impl ShardWorker {
    pub fn new(shard: u32, queue: Arc<WriteBehindQueue>, policy: SchedulerPolicy, flush: FlushHandle) -> Self {
        Self {
            shard,
            queue,
            policy,
            flush,
        }
    }

    #[must_use]
    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// Pick a queue, drain one batch and flush it.
    pub async fn tick(&self) -> Result<TickOutcome, StorageError> {
        let stats = self.queue.shard_stats(self.shard).await?;
        let Some((selected, reason)) = self.policy.decide_next_batch(&stats) else {
            return Ok(TickOutcome::Idle);
        };

        let limit = self.policy.batch_size(selected.count);
        let events = self
            .queue
            .pop_batch(self.shard, &selected.entity, selected.action, limit)
            .await?;
        if events.is_empty() {
            return Ok(TickOutcome::Empty);
        }

        let count = events.len();
        metrics::record_batch_size(count);
        debug!(
            shard = self.shard,
            entity = %selected.entity,
            action = %selected.action,
            reason = reason.as_str(),
            count,
            age_ms = selected.age.as_millis() as u64,
            "Draining queue"
        );

        let outcome = self
            .flush
            .submit(self.shard, selected.entity.clone(), selected.action, events)
            .await?;
        Ok(TickOutcome::Flushed { events: count, outcome })
    }

    /// Tick until shutdown is signalled. A batch in flight is always finished
    /// before the worker exits.
    pub async fn run(self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.tick().await {
                warn!(shard = self.shard, error = %e, "Worker tick failed");
            }
        }
        debug!(shard = self.shard, "Shard worker stopped");
    }
}

/// All shard workers and their flush stages.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn one worker, with its own flush stage task, per shard.
    pub fn spawn(
        queue: Arc<WriteBehindQueue>,
        stage: Arc<FlushStage>,
        policy: SchedulerPolicy,
        tick: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let shards = queue.shard_count();
        let mut handles = Vec::with_capacity(shards as usize * 2);
        for shard in 0..shards {
            let (flush, stage_task) = stage.clone().spawn(1);
            let worker = ShardWorker::new(shard, queue.clone(), policy, flush);
            handles.push(tokio::spawn(worker.run(tick, shutdown.clone())));
            handles.push(stage_task);
        }
        info!(shards, tick_ms = tick.as_millis() as u64, "Write-behind workers started");
        Self { handles }
    }

    /// Wait for every worker and stage to exit. Signal shutdown first.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Action, EntityType, Target};
    use crate::storage::memory::InMemoryStore;
    use crate::worker::dispatch::tests::RecordingFlusher;
    use crate::worker::dispatch::StoreOutcome;
    use serde_json::Value;

    fn setup(shards: u32) -> (Arc<WriteBehindQueue>, Arc<RecordingFlusher>, Arc<RecordingFlusher>, Arc<FlushStage>) {
        let queue = Arc::new(WriteBehindQueue::new(Arc::new(InMemoryStore::new()), shards));
        let mongo = RecordingFlusher::new("mongo", false);
        let postgres = RecordingFlusher::new("postgres", false);
        let stage = Arc::new(FlushStage::new(Some(mongo.clone()), Some(postgres.clone())));
        (queue, mongo, postgres, stage)
    }

    fn policy(max_batch_size: usize) -> SchedulerPolicy {
        SchedulerPolicy {
            critical_delay: Duration::from_secs(2),
            high_volume_threshold: 2000,
            max_batch_size,
        }
    }

    #[tokio::test]
    async fn test_tick_idle_on_empty_shard() {
        let (queue, _, _, stage) = setup(4);
        let (flush, _task) = stage.spawn(1);
        let worker = ShardWorker::new(0, queue, policy(10), flush);
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_tick_drains_capped_batch_in_order() {
        let (queue, mongo, postgres, stage) = setup(8);
        for id in 1..=5 {
            queue
                .enqueue(id, Some(42), EntityType::Posts, Action::Create, Value::Null, Target::ALL)
                .await
                .unwrap();
        }
        let shard = queue.shard_of(0, Some(42));
        let (flush, _task) = stage.spawn(1);
        let worker = ShardWorker::new(shard, queue.clone(), policy(3), flush);

        match worker.tick().await.unwrap() {
            TickOutcome::Flushed { events, outcome } => {
                assert_eq!(events, 3);
                assert!(outcome.mongo.is_flushed());
                assert!(outcome.postgres.is_flushed());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mongo.seen(), vec![1, 2, 3]);
        assert_eq!(postgres.seen(), vec![1, 2, 3]);
        assert_eq!(queue.pending(shard, &EntityType::Posts, Action::Create).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_aged_queue_beats_high_volume_queue() {
        let (queue, mongo, postgres, stage) = setup(4);
        queue
            .enqueue(900, Some(5), EntityType::Comments, Action::Update, Value::Null, Target::ALL)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;
        for id in 1..=5000 {
            queue
                .enqueue(id, Some(5), EntityType::Likes, Action::Create, Value::Null, Target::ALL)
                .await
                .unwrap();
        }
        let shard = queue.shard_of(0, Some(5));

        let stats = queue.shard_stats(shard).await.unwrap();
        assert_eq!(stats.len(), 2);
        let (selected, reason) = policy(5000).decide_next_batch(&stats).unwrap();
        assert_eq!(selected.entity, EntityType::Comments);
        assert_eq!(selected.action, Action::Update);
        assert_eq!(reason, crate::worker::scheduler::Selection::Critical);

        let (flush, _task) = stage.spawn(1);
        let worker = ShardWorker::new(shard, queue.clone(), policy(5000), flush);
        match worker.tick().await.unwrap() {
            TickOutcome::Flushed { events, .. } => assert_eq!(events, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mongo.seen(), vec![900]);
        assert_eq!(postgres.seen(), vec![900]);
        assert_eq!(queue.pending(shard, &EntityType::Likes, Action::Create).await.unwrap(), 5000);
    }

    #[tokio::test]
    async fn test_failed_flush_drops_batch() {
        let queue = Arc::new(WriteBehindQueue::new(Arc::new(InMemoryStore::new()), 1));
        let failing = RecordingFlusher::new("postgres", true);
        let stage = Arc::new(FlushStage::new(None, Some(failing.clone())));
        queue
            .enqueue(1, None, EntityType::Users, Action::Update, Value::Null, Target::POSTGRES)
            .await
            .unwrap();
        let (flush, _task) = stage.spawn(1);
        let worker = ShardWorker::new(0, queue.clone(), policy(100), flush);

        match worker.tick().await.unwrap() {
            TickOutcome::Flushed { outcome, .. } => assert!(matches!(outcome.postgres, StoreOutcome::Failed(_))),
            other => panic!("unexpected {other:?}"),
        }
        // Not requeued
        assert_eq!(queue.pending(0, &EntityType::Users, Action::Update).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pool_drains_all_shards_and_stops() {
        let (queue, mongo, _, stage) = setup(4);
        for id in 1..=40 {
            queue
                .enqueue(id, None, EntityType::Likes, Action::Create, Value::Null, Target::MONGO)
                .await
                .unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = WorkerPool::spawn(queue.clone(), stage, policy(5000), Duration::from_millis(5), shutdown_rx);

        for _ in 0..200 {
            if mongo.seen().len() == 40 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut seen = mongo.seen();
        seen.sort_unstable();
        assert_eq!(seen, (1..=40).collect::<Vec<_>>());

        shutdown_tx.send(true).unwrap();
        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), pool.join()).await.unwrap();
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store lifecycle: startup sequence and shutdown.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::cuckoo::{
    warm_from_postgres, CacheIndexProbe, ExistenceProbe, FluxBus, MongoProbe, PostgresProbe, UniquenessChecker,
    UniquenessFilter,
};
use crate::document::CollectionRegistry;
use crate::eviction::{EvictionConfig, EvictionSentinel, RecencyRecord};
use crate::flush::{Flusher, MapperRegistry, MongoFlusher, PostgresFlusher};
use crate::metrics;
use crate::queue::WriteBehindQueue;
use crate::storage::memory::InMemoryStore;
use crate::storage::redis::RedisStore;
use crate::storage::{KvStore, StorageError};
use crate::worker::{FlushStage, SchedulerPolicy, WorkerPool};

use super::{Backends, NuboStore, Runtime, StoreState};

/// Collection whose cached documents carry the unique-constrained fields.
const UNIQUE_COLLECTION: &str = "users";

impl NuboStore {
    /// Connect backends and start every background loop.
    ///
    /// Startup flow:
    /// 1. Connect the backing store (Redis, injected, or in-process)
    /// 2. Connect MongoDB and PostgreSQL when configured
    /// 3. Register the built-in collections and the write-behind queue
    /// 4. Warm the uniqueness filter from PostgreSQL
    /// 5. Spawn the eviction sentinel, one worker per shard and the flux listener
    #[tracing::instrument(skip(self), fields(has_redis, has_mongo, has_postgres))]
    pub async fn start(&mut self) -> Result<(), StorageError> {
        if self.state() != StoreState::Created {
            return Err(StorageError::Backend(format!("cannot start a store in state {}", self.state())));
        }
        let startup_start = Instant::now();
        info!("Starting nubo store...");
        let _ = self.state.send(StoreState::Connecting);

        // ========== PHASE 1: Backing key-value store ==========
        let phase_start = Instant::now();
        let mut backends = Backends::default();
        let store: Arc<dyn KvStore> = if let Some(store) = self.injected_store.clone() {
            info!("Using injected backing store");
            store
        } else if let Some(ref url) = self.config.redis_url {
            info!("Connecting to Redis...");
            let store = RedisStore::new(url).await?;
            backends.redis = true;
            Arc::new(store)
        } else {
            warn!("No Redis URL configured - caching in process memory only");
            Arc::new(InMemoryStore::new())
        };
        tracing::Span::current().record("has_redis", backends.redis);
        metrics::record_startup_phase("kv_connect", phase_start.elapsed());

        // ========== PHASE 2: Durable stores ==========
        let phase_start = Instant::now();
        let mongo = match self.config.mongo_url {
            Some(ref url) => {
                info!(database = %self.config.mongo_database, "Connecting to MongoDB...");
                let flusher = MongoFlusher::connect(url, &self.config.mongo_database).await?;
                backends.mongo = true;
                Some(Arc::new(flusher))
            }
            None => {
                warn!("No MongoDB URL configured - document store writes are dropped");
                None
            }
        };
        let postgres = match self.config.postgres_url {
            Some(ref url) => {
                info!("Connecting to PostgreSQL...");
                let flusher = PostgresFlusher::connect(url, MapperRegistry::builtin()).await?;
                backends.postgres = true;
                Some(Arc::new(flusher))
            }
            None => {
                warn!("No PostgreSQL URL configured - relational writes are dropped");
                None
            }
        };
        tracing::Span::current().record("has_mongo", backends.mongo);
        tracing::Span::current().record("has_postgres", backends.postgres);
        metrics::record_startup_phase("durable_connect", phase_start.elapsed());

        let recency = Arc::new(RecencyRecord::new(store.clone()));
        let registry = Arc::new(CollectionRegistry::with_builtin(store.clone(), recency));
        let queue = Arc::new(WriteBehindQueue::new(store.clone(), self.config.shard_count));
        info!(
            collections = registry.names().len(),
            shards = self.config.shard_count,
            "Collections and write-behind queue ready"
        );

        // ========== PHASE 3: Uniqueness filter warmup ==========
        let phase_start = Instant::now();
        let _ = self.state.send(StoreState::WarmingUp);
        let filter = Arc::new(UniquenessFilter::new(self.config.cuckoo_capacity));
        match postgres {
            Some(ref pg) => {
                match warm_from_postgres(
                    &pg.pool(),
                    &self.config.unique_source_table,
                    &self.config.unique_fields,
                    &filter,
                )
                .await
                {
                    Ok(rows) => {
                        info!(rows, entries = filter.len(), "Uniqueness filter loaded");
                        filter.mark_warmed();
                    }
                    Err(e) => {
                        warn!(error = %e, "Uniqueness warmup failed - every check goes to the stores");
                    }
                }
            }
            None => warn!("No relational source - uniqueness filter stays cold"),
        }
        metrics::record_startup_phase("filter_warmup", phase_start.elapsed());

        let mut probes: Vec<Arc<dyn ExistenceProbe>> = Vec::new();
        probes.push(Arc::new(CacheIndexProbe::new(registry.require(UNIQUE_COLLECTION)?)));
        if let Some(ref mongo) = mongo {
            probes.push(Arc::new(MongoProbe::new(mongo.client(), mongo.database(), UNIQUE_COLLECTION)));
        }
        if let Some(ref pg) = postgres {
            probes.push(Arc::new(PostgresProbe::new(pg.pool(), &self.config.unique_source_table)));
        }
        let bus = Arc::new(FluxBus::new(store.clone(), &self.config.flux_channel, self.config.flux_ttl_secs));
        let checker = Arc::new(UniquenessChecker::new(filter, probes, Some(bus)));

        // ========== PHASE 4: Background loops ==========
        let sentinel = Arc::new(EvictionSentinel::new(
            store.clone(),
            registry.clone(),
            EvictionConfig::from_config(&self.config),
        ));
        self.tasks.push(tokio::spawn(sentinel.run(self.shutdown_tx.subscribe())));

        let listener = checker.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.listen(shutdown).await {
                warn!(error = %e, "Uniqueness listener failed");
            }
        }));

        let stage = Arc::new(FlushStage::new(
            mongo.map(|m| m as Arc<dyn Flusher>),
            postgres.map(|p| p as Arc<dyn Flusher>),
        ));
        self.workers = Some(WorkerPool::spawn(
            queue.clone(),
            stage,
            SchedulerPolicy::from_config(&self.config),
            self.config.worker_tick(),
            self.shutdown_tx.subscribe(),
        ));

        self.runtime = Some(Runtime {
            store,
            registry,
            queue,
            checker,
            backends,
        });
        let _ = self.state.send(StoreState::Running);
        metrics::record_startup_phase("total", startup_start.elapsed());
        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "Nubo store running");
        Ok(())
    }

    /// Signal every background loop to stop and wait for them.
    ///
    /// Batches already popped are flushed before the workers exit; events
    /// still queued stay in the backing store for the next start.
    pub async fn shutdown(&mut self) {
        let shutdown_start = Instant::now();
        info!("Initiating nubo store shutdown...");
        let _ = self.state.send(StoreState::ShuttingDown);
        self.shutdown_tx.send_replace(true);

        if let Some(workers) = self.workers.take() {
            workers.join().await;
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let _ = self.state.send(StoreState::Stopped);
        metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Nubo store shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::queue::{Action, EntityType, Target};
    use serde_json::Value;
    use std::time::Duration;

    fn test_config() -> StoreConfig {
        StoreConfig {
            shard_count: 4,
            worker_tick_ms: 5,
            eviction_interval_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown_in_process() {
        let mut store = NuboStore::new(test_config());
        let mut states = store.state_receiver();

        store.start().await.unwrap();
        assert!(store.is_running());
        assert_eq!(store.backends(), Some(Backends::default()));
        assert_eq!(*states.borrow_and_update(), StoreState::Running);

        store.shutdown().await;
        assert_eq!(store.state(), StoreState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let mut store = NuboStore::new(test_config());
        store.start().await.unwrap();
        assert!(store.start().await.is_err());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_workers_drain_queue_without_durable_stores() {
        let kv = Arc::new(InMemoryStore::new());
        let mut store = NuboStore::with_store(test_config(), kv);
        store.start().await.unwrap();

        for id in 1..=10 {
            store
                .enqueue(id, None, EntityType::Posts, Action::Create, Value::Null, Target::ALL)
                .await
                .unwrap();
        }
        let queue = store.runtime().unwrap().queue.clone();
        let mut drained = false;
        for _ in 0..200 {
            let mut pending = 0;
            for shard in 0..4 {
                pending += queue.pending(shard, &EntityType::Posts, Action::Create).await.unwrap();
            }
            if pending == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(drained);
        store.shutdown().await;
    }
}

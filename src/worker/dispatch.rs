// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flush stage: receives popped batches over a channel, fans them out to the
//! document and relational flushers concurrently and reports back once both
//! are done.
//!
//! ```text
//! ShardWorker ──FlushJob──► FlushStage ──┬─► mongo flusher    (tg & 1)
//!      ▲                                 └─► postgres flusher (tg & 2)
//!      └──────────── oneshot BatchOutcome ◄──────────┘
//! ```
//!
//! Failed batches are not retried. When one store takes a batch and the other
//! rejects it the stores diverge; that is logged and counted, not repaired.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::flush::{FlushReport, Flusher};
use crate::metrics;
use crate::queue::{Action, AsyncEvent, EntityType};
use crate::storage::StorageError;

/// Result of one batch on one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// No event in the batch targets this store
    Idle,
    /// Events target this store but no flusher is configured
    Unconfigured { events: usize },
    Flushed(FlushReport),
    Failed(String),
}

impl StoreOutcome {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, StoreOutcome::Failed(_))
    }

    #[must_use]
    pub fn is_flushed(&self) -> bool {
        matches!(self, StoreOutcome::Flushed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub mongo: StoreOutcome,
    pub postgres: StoreOutcome,
}

impl BatchOutcome {
    /// Store that rejected a batch the other store accepted.
    #[must_use]
    pub fn diverged_store(&self) -> Option<&'static str> {
        match (&self.mongo, &self.postgres) {
            (StoreOutcome::Failed(_), StoreOutcome::Flushed(_)) => Some("mongo"),
            (StoreOutcome::Flushed(_), StoreOutcome::Failed(_)) => Some("postgres"),
            _ => None,
        }
    }
}

/// A popped batch on its way to the durable stores.
#[derive(Debug)]
pub struct FlushJob {
    pub shard: u32,
    pub entity: EntityType,
    pub action: Action,
    pub events: Vec<AsyncEvent>,
    pub done: oneshot::Sender<BatchOutcome>,
}

pub struct FlushStage {
    mongo: Option<Arc<dyn Flusher>>,
    postgres: Option<Arc<dyn Flusher>>,
}

impl FlushStage {
    pub fn new(mongo: Option<Arc<dyn Flusher>>, postgres: Option<Arc<dyn Flusher>>) -> Self {
        Self { mongo, postgres }
    }

    /// Split a batch by target and flush both halves concurrently.
    pub async fn dispatch(&self, shard: u32, entity: &EntityType, action: Action, events: &[AsyncEvent]) -> BatchOutcome {
        let mongo_events: Vec<AsyncEvent> = events.iter().filter(|e| e.targets.includes_mongo()).cloned().collect();
        let postgres_events: Vec<AsyncEvent> = events
            .iter()
            .filter(|e| e.targets.includes_postgres())
            .cloned()
            .collect();

        let (mongo, postgres) = tokio::join!(
            run_flusher(self.mongo.as_deref(), &mongo_events),
            run_flusher(self.postgres.as_deref(), &postgres_events),
        );
        let outcome = BatchOutcome { mongo, postgres };

        if let Some(failed) = outcome.diverged_store() {
            warn!(
                shard,
                entity = %entity,
                action = %action,
                failed_store = failed,
                events = events.len(),
                "Stores diverged: batch written to one store only"
            );
            metrics::record_cross_store_divergence();
        }
        debug!(shard, entity = %entity, action = %action, outcome = ?outcome, "Batch dispatched");
        outcome
    }

    /// Spawn a task serving jobs until every handle is dropped.
    pub fn spawn(self: Arc<Self>, capacity: usize) -> (FlushHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<FlushJob>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let outcome = self.dispatch(job.shard, &job.entity, job.action, &job.events).await;
                // The worker may have gone away; the flush already happened
                let _ = job.done.send(outcome);
            }
        });
        (FlushHandle { tx }, handle)
    }
}

async fn run_flusher(flusher: Option<&dyn Flusher>, events: &[AsyncEvent]) -> StoreOutcome {
    if events.is_empty() {
        return StoreOutcome::Idle;
    }
    let Some(flusher) = flusher else {
        debug!(events = events.len(), "No flusher configured for target, dropping");
        return StoreOutcome::Unconfigured { events: events.len() };
    };
    match flusher.flush(events).await {
        Ok(report) => StoreOutcome::Flushed(report),
        Err(e) => StoreOutcome::Failed(e.to_string()),
    }
}

/// Sending side of a flush stage.
#[derive(Clone)]
pub struct FlushHandle {
    tx: mpsc::Sender<FlushJob>,
}

impl FlushHandle {
    /// Hand a batch to the stage and wait until both stores are done with it.
    pub async fn submit(
        &self,
        shard: u32,
        entity: EntityType,
        action: Action,
        events: Vec<AsyncEvent>,
    ) -> Result<BatchOutcome, StorageError> {
        let (done, outcome) = oneshot::channel();
        self.tx
            .send(FlushJob {
                shard,
                entity,
                action,
                events,
                done,
            })
            .await
            .map_err(|_| StorageError::Backend("flush stage stopped".to_string()))?;
        outcome
            .await
            .map_err(|_| StorageError::Backend("flush stage dropped the batch".to_string()))
    }
}

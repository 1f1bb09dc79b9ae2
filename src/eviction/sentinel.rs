// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memory-pressure eviction of least recently used documents.
//!
//! ```text
//! every interval:
//!   used = INFO memory.used_memory
//!   trigger = (memory_cap or total_system_memory) - margin
//!   while used >= trigger and batches < max_batches:
//!     evict the batch_size oldest members of idx:lru:global,
//!       skipping members that already failed this cycle
//!     stop early if there was nothing left to look at
//!     re-measure
//! ```
//!
//! Only evictable collections ever appear in the recency record, so pinned
//! documents are never candidates.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::document::CollectionRegistry;
use crate::keys;
use crate::metrics;
use crate::storage::{KvStore, MemoryInfo, StorageError};

#[derive(Debug, Clone)]
pub struct EvictionConfig {
    pub interval: Duration,
    /// Explicit ceiling; the host's total memory is used when unset.
    pub memory_cap_bytes: Option<u64>,
    pub margin_bytes: u64,
    pub batch_size: usize,
    pub max_batches: usize,
}

impl EvictionConfig {
    #[must_use]
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            interval: config.eviction_interval(),
            memory_cap_bytes: config.memory_cap_bytes,
            margin_bytes: config.memory_margin_bytes,
            batch_size: config.eviction_batch_size,
            max_batches: config.eviction_max_batches,
        }
    }

    /// Usage at which eviction starts, or `None` when no ceiling is known.
    #[must_use]
    pub fn trigger_bytes(&self, info: &MemoryInfo) -> Option<u64> {
        let ceiling = match self.memory_cap_bytes {
            Some(cap) => cap,
            None if info.total_system_bytes > 0 => info.total_system_bytes,
            None => return None,
        };
        Some(ceiling.saturating_sub(self.margin_bytes))
    }
}

/// Outcome of one sentinel cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub used_bytes: u64,
    pub trigger_bytes: Option<u64>,
    pub evicted: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, Copy)]
struct BatchEviction {
    /// Head members looked at, evicted or not
    examined: usize,
    evicted: usize,
}

pub struct EvictionSentinel {
    store: Arc<dyn KvStore>,
    registry: Arc<CollectionRegistry>,
    config: EvictionConfig,
    /// Serializes cycles so two callers never evict the same head twice
    cycle: Mutex<()>,
}

impl EvictionSentinel {
    pub fn new(store: Arc<dyn KvStore>, registry: Arc<CollectionRegistry>, config: EvictionConfig) -> Self {
        Self {
            store,
            registry,
            config,
            cycle: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Measure memory and evict until usage drops under the trigger or the
    /// batch budget is spent.
    pub async fn run_cycle(&self) -> Result<CycleReport, StorageError> {
        let _guard = self.cycle.lock().await;

        let info = self.store.memory_info().await?;
        metrics::set_memory_used(info.used_bytes);
        let mut report = CycleReport {
            used_bytes: info.used_bytes,
            trigger_bytes: self.config.trigger_bytes(&info),
            ..Default::default()
        };

        let Some(trigger) = report.trigger_bytes else {
            debug!("No memory ceiling known, skipping eviction");
            return Ok(report);
        };
        if report.used_bytes < trigger {
            return Ok(report);
        }

        info!(used = report.used_bytes, trigger, "Memory above threshold, evicting");
        let mut skipped = HashSet::new();
        while report.batches < self.config.max_batches {
            let batch = self.evict_next(self.config.batch_size, &mut skipped).await?;
            report.batches += 1;
            report.evicted += batch.evicted;
            if batch.examined == 0 {
                break;
            }

            report.used_bytes = self.store.memory_info().await?.used_bytes;
            metrics::set_memory_used(report.used_bytes);
            if report.used_bytes < trigger {
                break;
            }
        }

        if !skipped.is_empty() {
            warn!(skipped = skipped.len(), "Some recency members could not be evicted this cycle");
        }
        info!(
            evicted = report.evicted,
            batches = report.batches,
            used = report.used_bytes,
            "Eviction cycle complete"
        );
        Ok(report)
    }

    /// Evict up to `count` of the least recently used documents and return
    /// how many documents were removed.
    ///
    /// Members whose collection is unknown or pinned, or whose document is
    /// already gone, are dropped from the record without counting.
    pub async fn evict_batch(&self, count: usize) -> Result<usize, StorageError> {
        Ok(self.evict_next(count, &mut HashSet::new()).await?.evicted)
    }

    /// Process the next `count` head members not in `skipped`. Members that
    /// fail to evict are added to `skipped` and stay in the record for the
    /// next cycle.
    async fn evict_next(&self, count: usize, skipped: &mut HashSet<String>) -> Result<BatchEviction, StorageError> {
        let recency = self.registry.recency();
        let members: Vec<String> = recency
            .oldest(count + skipped.len())
            .await?
            .into_iter()
            .filter(|member| !skipped.contains(member))
            .take(count)
            .collect();
        let mut batch = BatchEviction {
            examined: members.len(),
            evicted: 0,
        };

        for member in members {
            let target = keys::parse_recency_member(&member)
                .and_then(|(name, id)| self.registry.get(name).map(|c| (c, id)))
                .filter(|(collection, _)| collection.is_evictable());

            let Some((collection, id)) = target else {
                debug!(member = %member, "Dropping orphan recency member");
                if let Err(e) = recency.forget_member(&member).await {
                    warn!(member = %member, error = %e, "Failed to drop orphan recency member");
                    skipped.insert(member);
                }
                continue;
            };

            match collection.delete_by_id(id).await {
                Ok(true) => batch.evicted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(member = %member, error = %e, "Failed to evict document");
                    metrics::record_eviction_error();
                    skipped.insert(member);
                }
            }
        }

        if batch.evicted > 0 {
            metrics::record_eviction(batch.evicted);
        }
        Ok(batch)
    }

    /// Run cycles every interval until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        info!(interval = ?self.config.interval, "Eviction sentinel started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "Eviction cycle failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Eviction sentinel stopped");
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store coordinator.
//!
//! [`NuboStore`] ties the components together:
//! - document cache collections with secondary indexes
//! - eviction sentinel over the global recency record
//! - sharded write-behind queue drained by one worker per shard
//! - MongoDB and PostgreSQL flushers
//! - uniqueness filter kept in sync over the flux bus
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → WarmingUp → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use nubo_store::{NuboStore, StoreConfig, StoreState};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = StoreConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     ..Default::default()
//! };
//! let mut store = NuboStore::new(config);
//! assert_eq!(store.state(), StoreState::Created);
//!
//! store.start().await.expect("start failed");
//! assert!(store.is_running());
//! store.shutdown().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{Backends, StoreState};

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::StoreConfig;
use crate::cuckoo::UniquenessChecker;
use crate::document::CollectionRegistry;
use crate::queue::WriteBehindQueue;
use crate::storage::{KvStore, StorageError};
use crate::worker::WorkerPool;

/// Components that exist once the store has connected.
pub(super) struct Runtime {
    pub(super) store: Arc<dyn KvStore>,
    pub(super) registry: Arc<CollectionRegistry>,
    pub(super) queue: Arc<WriteBehindQueue>,
    pub(super) checker: Arc<UniquenessChecker>,
    pub(super) backends: Backends,
}

/// Write-behind document cache over Redis, MongoDB and PostgreSQL.
pub struct NuboStore {
    pub(super) config: StoreConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<StoreState>,
    pub(super) state_rx: watch::Receiver<StoreState>,

    /// Flipped to true to stop every background loop
    pub(super) shutdown_tx: watch::Sender<bool>,

    /// Backing store injected by the caller instead of connecting to Redis
    pub(super) injected_store: Option<Arc<dyn KvStore>>,

    pub(super) runtime: Option<Runtime>,
    pub(super) workers: Option<WorkerPool>,
    /// Sentinel and flux listener
    pub(super) tasks: Vec<JoinHandle<()>>,
}

impl NuboStore {
    /// Create a store that connects to the configured backends on
    /// [`start()`](Self::start). Without a Redis URL an in-process store is
    /// used.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let (state, state_rx) = watch::channel(StoreState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            state,
            state_rx,
            shutdown_tx,
            injected_store: None,
            runtime: None,
            workers: None,
            tasks: Vec::new(),
        }
    }

    /// Create a store over an existing backing store; `redis_url` is ignored.
    #[must_use]
    pub fn with_store(config: StoreConfig, store: Arc<dyn KvStore>) -> Self {
        let mut nubo = Self::new(config);
        nubo.injected_store = Some(store);
        nubo
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> StoreState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<StoreState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == StoreState::Running
    }

    /// Backends in use, once started.
    #[must_use]
    pub fn backends(&self) -> Option<Backends> {
        self.runtime.as_ref().map(|rt| rt.backends)
    }

    pub(super) fn runtime(&self) -> Result<&Runtime, StorageError> {
        self.runtime
            .as_ref()
            .ok_or_else(|| StorageError::Backend("store not started".to_string()))
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request-facing API: document operations, enqueue and uniqueness checks.
//!
//! Cache writes and queue appends are separate calls. A request layer that
//! wants both writes the document, then enqueues the matching event.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::document::{Collection, Document, Filter, Schema};
use crate::queue::{Action, AsyncEvent, EntityType, Target};
use crate::storage::StorageError;

use super::NuboStore;

impl NuboStore {
    /// Registered collection by name.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>, StorageError> {
        self.runtime()?.registry.require(name)
    }

    /// Register (or replace) a collection next to the built-in ones.
    pub fn register_collection(
        &self,
        name: &str,
        schema: Schema,
        evictable: bool,
    ) -> Result<Arc<Collection>, StorageError> {
        Ok(self.runtime()?.registry.register(name, schema, evictable))
    }

    /// Validate and cache a full document. Returns its id.
    pub async fn set(&self, collection: &str, doc: &Document) -> Result<i64, StorageError> {
        self.collection(collection)?.set(doc).await
    }

    /// Documents matching `filter`; no match is an empty result.
    pub async fn get(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StorageError> {
        self.collection(collection)?.get(filter).await
    }

    /// Apply `patch` to every match. Returns the number updated.
    pub async fn update(&self, collection: &str, filter: &Filter, patch: &Document) -> Result<usize, StorageError> {
        self.collection(collection)?.update(filter, patch).await
    }

    /// Remove every match with its index entries. Returns the number removed.
    pub async fn delete(&self, collection: &str, filter: &Filter) -> Result<usize, StorageError> {
        self.collection(collection)?.delete(filter).await
    }

    /// Queue a mutation for the durable stores.
    ///
    /// Events sharing a partition key land on one shard and are flushed in
    /// enqueue order per `(entity, action)`.
    pub async fn enqueue(
        &self,
        id: i64,
        partition_key: Option<i64>,
        entity: EntityType,
        action: Action,
        payload: Value,
        targets: Target,
    ) -> Result<AsyncEvent, StorageError> {
        let event = self
            .runtime()?
            .queue
            .enqueue(id, partition_key, entity, action, payload, targets)
            .await?;
        debug!(id, entity = %event.entity, action = %event.action, "Event enqueued");
        Ok(event)
    }

    /// Whether no record holds `value` in the unique-constrained `field`.
    pub async fn is_unique(&self, field: &str, value: &str) -> Result<bool, StorageError> {
        self.runtime()?.checker.is_unique(field, value).await
    }

    /// Mark a value as taken on every process.
    pub async fn claim_unique(&self, field: &str, value: &str) -> Result<(), StorageError> {
        self.runtime()?.checker.claim(field, value).await
    }

    /// Mark a value as free again on every process.
    pub async fn release_unique(&self, field: &str, value: &str) -> Result<(), StorageError> {
        self.runtime()?.checker.release(field, value).await
    }

    /// Used memory of the backing store.
    pub async fn memory_used_bytes(&self) -> Result<u64, StorageError> {
        Ok(self.runtime()?.store.memory_info().await?.used_bytes)
    }
}

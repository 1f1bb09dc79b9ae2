// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::catalog::BUILTIN;
use super::collection::Collection;
use super::schema::Schema;
use crate::eviction::recency::RecencyRecord;
use crate::storage::{KvStore, StorageError};

/// Name to collection lookup shared by the public API and the eviction sentinel.
pub struct CollectionRegistry {
    store: Arc<dyn KvStore>,
    recency: Arc<RecencyRecord>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl CollectionRegistry {
    pub fn new(store: Arc<dyn KvStore>, recency: Arc<RecencyRecord>) -> Self {
        Self {
            store,
            recency,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the built-in collections.
    pub fn with_builtin(store: Arc<dyn KvStore>, recency: Arc<RecencyRecord>) -> Self {
        let registry = Self::new(store, recency);
        for def in BUILTIN {
            registry.register(def.name, def.schema(), def.evictable);
        }
        registry
    }

    /// Register (or replace) a collection.
    pub fn register(&self, name: &str, schema: Schema, evictable: bool) -> Arc<Collection> {
        let collection = Arc::new(Collection::new(
            name,
            schema,
            evictable,
            self.store.clone(),
            self.recency.clone(),
        ));
        self.collections
            .write()
            .insert(name.to_string(), collection.clone());
        collection
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<Collection>, StorageError> {
        self.get(name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn recency(&self) -> &Arc<RecencyRecord> {
        &self.recency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::FieldKind;
    use crate::storage::memory::InMemoryStore;

    fn registry() -> CollectionRegistry {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let recency = Arc::new(RecencyRecord::new(store.clone()));
        CollectionRegistry::with_builtin(store, recency)
    }

    #[test]
    fn test_builtin_registered() {
        let registry = registry();
        assert_eq!(registry.names().len(), 11);
        assert!(!registry.require("users").unwrap().is_evictable());
        assert!(registry.require("posts").unwrap().is_evictable());
    }

    #[test]
    fn test_unknown_collection() {
        let err = registry().require("widgets").err().unwrap();
        assert!(matches!(err, StorageError::UnknownCollection(name) if name == "widgets"));
    }

    #[test]
    fn test_register_custom() {
        let registry = registry();
        registry.register("notes", Schema::new([("title", FieldKind::String)]), true);
        assert_eq!(registry.require("notes").unwrap().schema().len(), 2);
    }
}

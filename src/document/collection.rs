// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Schema-validated document collection backed by Redis hashes with
//! automatically maintained secondary indexes.
//!
//! Every write for one document (hash, index entries, recency stamp) goes to
//! the store as a single atomic batch, so readers never observe a hash
//! without its indexes or the other way round.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::filter::{Filter, Op};
use super::schema::{
    dequote, encode_value, index_token, value_as_id, Document, FieldKind, IndexKind, Schema, ID_FIELD,
};
use crate::eviction::recency::RecencyRecord;
use crate::keys;
use crate::metrics;
use crate::storage::{KvOp, KvStore, StorageError};

pub struct Collection {
    name: String,
    schema: Schema,
    evictable: bool,
    store: Arc<dyn KvStore>,
    recency: Arc<RecencyRecord>,
}

impl Collection {
    pub fn new(
        name: impl Into<String>,
        schema: Schema,
        evictable: bool,
        store: Arc<dyn KvStore>,
        recency: Arc<RecencyRecord>,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            evictable,
            store,
            recency,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Pinned collections are never tracked for recency nor evicted.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        self.evictable
    }

    /// Insert or replace a document.
    ///
    /// Index entries of a previously stored version that no longer match are
    /// removed in the same batch.
    #[tracing::instrument(skip(self, doc), fields(collection = %self.name))]
    pub async fn set(&self, doc: &Document) -> Result<i64, StorageError> {
        let id = match self.schema.validate(doc) {
            Ok(id) => id,
            Err(e) => {
                metrics::record_validation_failure(&self.name);
                return Err(e);
            }
        };

        let key = keys::document(&self.name, id);
        let previous = self.store.hash_get_all(&key).await?;
        let mut ops = Vec::new();

        for (field, kind) in self.schema.indexed_fields() {
            let new_value = doc.get(field).unwrap_or(&Value::Null);
            self.reindex_field(id, field, kind, previous.get(field), new_value, &mut ops);
        }

        let fields = self.schema.encode(doc);
        // Drop stored fields that are now null
        for field in previous.keys() {
            if !fields.iter().any(|(f, _)| f == field) {
                ops.push(KvOp::HashDelete {
                    key: key.clone(),
                    field: field.clone(),
                });
            }
        }
        ops.push(KvOp::HashSet { key, fields });

        if self.evictable {
            ops.push(self.recency.touch_op(&self.name, id));
        }

        self.store.apply(&ops).await?;
        metrics::record_document_operation(&self.name, "set", 1);
        debug!(id, replaced = !previous.is_empty(), "Document stored");
        Ok(id)
    }

    /// Documents matching `filter`. Loaded evictable documents are marked as
    /// recently used.
    #[tracing::instrument(skip(self, filter), fields(collection = %self.name))]
    pub async fn get(&self, filter: &Filter) -> Result<Vec<Document>, StorageError> {
        let ids = self.resolve(filter).await?;
        let mut docs = Vec::with_capacity(ids.len());
        let mut touches = Vec::new();

        for id in ids {
            let hash = self.store.hash_get_all(&keys::document(&self.name, id)).await?;
            if hash.is_empty() {
                // Index entry outlived its document
                debug!(id, "Skipping id with no stored document");
                continue;
            }
            docs.push(self.schema.decode(&hash));
            if self.evictable {
                touches.push(self.recency.touch_op(&self.name, id));
            }
        }

        if !touches.is_empty() {
            self.store.apply(&touches).await?;
        }
        metrics::record_document_operation(&self.name, "get", docs.len());
        Ok(docs)
    }

    /// Apply `patch` to every matching document and return how many changed.
    #[tracing::instrument(skip(self, filter, patch), fields(collection = %self.name))]
    pub async fn update(&self, filter: &Filter, patch: &Document) -> Result<usize, StorageError> {
        if let Err(e) = self.schema.validate_patch(patch) {
            metrics::record_validation_failure(&self.name);
            return Err(e);
        }

        let ids = self.resolve(filter).await?;
        let mut updated = 0;

        for id in ids {
            let key = keys::document(&self.name, id);
            let previous = self.store.hash_get_all(&key).await?;
            if previous.is_empty() {
                continue;
            }

            let mut ops = Vec::new();
            let mut fields = Vec::new();
            for (field, new_value) in patch {
                // validate_patch guarantees the field is in the schema
                let Some(kind) = self.schema.kind(field) else { continue };
                self.reindex_field(id, field, kind, previous.get(field), new_value, &mut ops);
                match encode_value(new_value) {
                    Some(raw) => fields.push((field.clone(), raw)),
                    None => ops.push(KvOp::HashDelete {
                        key: key.clone(),
                        field: field.clone(),
                    }),
                }
            }
            if !fields.is_empty() {
                ops.push(KvOp::HashSet { key, fields });
            }
            if self.evictable {
                ops.push(self.recency.touch_op(&self.name, id));
            }

            self.store.apply(&ops).await?;
            updated += 1;
        }

        metrics::record_document_operation(&self.name, "update", updated);
        Ok(updated)
    }

    /// Delete every matching document and return how many were removed.
    #[tracing::instrument(skip(self, filter), fields(collection = %self.name))]
    pub async fn delete(&self, filter: &Filter) -> Result<usize, StorageError> {
        let ids = self.resolve(filter).await?;
        let mut deleted = 0;
        for id in ids {
            if self.delete_by_id(id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Remove one document with all of its index entries and its recency
    /// member. Returns false when no document was stored under `id`.
    pub async fn delete_by_id(&self, id: i64) -> Result<bool, StorageError> {
        let key = keys::document(&self.name, id);
        let stored = self.store.hash_get_all(&key).await?;
        let mut ops = vec![RecencyRecord::forget_op(&self.name, id)];

        if stored.is_empty() {
            self.store.apply(&ops).await?;
            return Ok(false);
        }

        for (field, kind) in self.schema.indexed_fields() {
            self.reindex_field(id, field, kind, stored.get(field), &Value::Null, &mut ops);
        }
        ops.push(KvOp::Delete { key });

        self.store.apply(&ops).await?;
        metrics::record_document_operation(&self.name, "delete", 1);
        Ok(true)
    }

    /// Index writes that move `field` of document `id` from its stored raw
    /// value to `new_value`.
    fn reindex_field(
        &self,
        id: i64,
        field: &str,
        kind: FieldKind,
        stored: Option<&String>,
        new_value: &Value,
        ops: &mut Vec<KvOp>,
    ) {
        let member = id.to_string();
        match kind.index_kind() {
            IndexKind::Exact => {
                let old_token = stored.map(|raw| dequote(raw).to_string());
                let new_token = index_token(new_value);
                if let Some(old) = old_token.filter(|old| Some(old) != new_token.as_ref()) {
                    ops.push(KvOp::SetRemove {
                        key: keys::exact_index(&self.name, field, &old),
                        member: member.clone(),
                    });
                }
                if let Some(new) = new_token {
                    ops.push(KvOp::SetAdd {
                        key: keys::exact_index(&self.name, field, &new),
                        member,
                    });
                }
            }
            IndexKind::Range => {
                let key = keys::range_index(&self.name, field);
                match kind.score(new_value) {
                    Some(score) => ops.push(KvOp::SortedAdd { key, member, score }),
                    None if stored.is_some() => ops.push(KvOp::SortedRemove { key, member }),
                    None => {}
                }
            }
        }
    }

    /// Ids matching a filter, using only the indexes.
    pub fn resolve<'a>(&'a self, filter: &'a Filter) -> BoxFuture<'a, Result<BTreeSet<i64>, StorageError>> {
        async move {
            match filter {
                Filter::Leaf { field, op, value } => self.resolve_leaf(field, op, value).await,
                Filter::Or(children) => {
                    let mut ids = BTreeSet::new();
                    for child in children {
                        ids.extend(self.resolve(child).await?);
                    }
                    Ok(ids)
                }
                Filter::And(children) => self.resolve_and(children).await,
            }
        }
        .boxed()
    }

    async fn resolve_and(&self, children: &[Filter]) -> Result<BTreeSet<i64>, StorageError> {
        // Range predicates on the primary key have no index: apply them to
        // whatever the other clauses produce.
        let (id_ranges, indexed): (Vec<&Filter>, Vec<&Filter>) = children.iter().partition(|f| {
            matches!(f, Filter::Leaf { field, op, .. } if field == ID_FIELD && op.is_range())
        });

        let mut result: Option<BTreeSet<i64>> = None;
        for child in indexed {
            let ids = self.resolve(child).await?;
            let narrowed = match result {
                Some(acc) => acc.intersection(&ids).copied().collect(),
                None => ids,
            };
            if narrowed.is_empty() {
                return Ok(narrowed);
            }
            result = Some(narrowed);
        }

        let mut ids = result.unwrap_or_default();
        for predicate in id_ranges {
            if let Filter::Leaf { op, value, .. } = predicate {
                let Some(bound) = value_as_id(value) else {
                    return Err(StorageError::Validation(format!("id bound {} is not an integer", value)));
                };
                ids.retain(|id| op.compare(*id as f64, bound as f64));
            }
        }
        Ok(ids)
    }

    async fn resolve_leaf(&self, field: &str, op: &Op, value: &Value) -> Result<BTreeSet<i64>, StorageError> {
        if let Op::Unsupported(token) = op {
            debug!(field, operator = %token, "Unsupported operator matches nothing");
            return Ok(BTreeSet::new());
        }

        if field == ID_FIELD {
            return self.resolve_ids(op, value).await;
        }

        let Some(kind) = self.schema.kind(field) else {
            debug!(field, "Filter on unknown field matches nothing");
            return Ok(BTreeSet::new());
        };

        let operands = operands(op, value);
        let mut ids = BTreeSet::new();
        match kind.index_kind() {
            IndexKind::Exact => {
                if op.is_range() {
                    return Ok(ids);
                }
                for operand in operands {
                    let Some(token) = index_token(operand) else { continue };
                    let members = self
                        .store
                        .set_members(&keys::exact_index(&self.name, field, &token))
                        .await?;
                    ids.extend(parse_members(&members));
                }
            }
            IndexKind::Range => {
                let key = keys::range_index(&self.name, field);
                for operand in operands {
                    let score = kind.score(operand).ok_or_else(|| {
                        StorageError::Validation(format!("'{}' cannot compare against {}", field, operand))
                    })?;
                    let Some((min, max)) = op.bounds(score) else { continue };
                    let members = self.store.sorted_range_by_score(&key, min, max).await?;
                    ids.extend(parse_members(&members));
                }
            }
        }
        Ok(ids)
    }

    async fn resolve_ids(&self, op: &Op, value: &Value) -> Result<BTreeSet<i64>, StorageError> {
        let mut ids = BTreeSet::new();
        if op.is_range() {
            debug!("Range on id outside a conjunction matches nothing");
            return Ok(ids);
        }
        for operand in operands(op, value) {
            let Some(id) = value_as_id(operand) else { continue };
            if self.store.exists(&keys::document(&self.name, id)).await? {
                ids.insert(id);
            }
        }
        Ok(ids)
    }
}

fn operands<'a>(op: &Op, value: &'a Value) -> Vec<&'a Value> {
    match (op, value) {
        (Op::In, Value::Array(items)) => items.iter().collect(),
        _ => vec![value],
    }
}

fn parse_members(members: &[String]) -> impl Iterator<Item = i64> + '_ {
    members.iter().filter_map(|m| match m.parse::<i64>() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(member = %m, "Ignoring non-numeric index member");
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;
    use serde_json::json;

    fn users(store: Arc<InMemoryStore>, evictable: bool) -> Collection {
        let schema = Schema::new([
            ("username", FieldKind::String),
            ("age", FieldKind::Integer),
            ("created_at", FieldKind::Timestamp),
            ("bio", FieldKind::String),
        ]);
        let recency = Arc::new(RecencyRecord::new(store.clone()));
        Collection::new("users", schema, evictable, store, recency)
    }

    fn user(id: i64, name: &str, age: i64) -> Document {
        json!({
            "id": id, "username": name, "age": age,
            "created_at": 1_700_000_000 + id, "bio": null
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    async fn ids(c: &Collection, filter: Value) -> Vec<i64> {
        let f = Filter::from_json(&filter).unwrap();
        c.resolve(&f).await.unwrap().into_iter().collect()
    }

    #[tokio::test]
    async fn test_set_then_get_by_id() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store, true);
        c.set(&user(1, "alice", 30)).await.unwrap();

        let docs = c.get(&Filter::by_id(1)).await.unwrap();
        assert_eq!(docs, vec![user(1, "alice", 30)]);
    }

    #[tokio::test]
    async fn test_set_writes_indexes() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store.clone(), true);
        c.set(&user(1, "alice", 30)).await.unwrap();

        assert_eq!(store.set_members("idx:users:username:alice").await.unwrap(), vec!["1"]);
        assert_eq!(store.sorted_score("idx:zset:users:age", "1").await.unwrap(), Some(30.0));
        assert!(store.sorted_score("idx:lru:global", "users:1").await.unwrap().is_some());
        // Null fields are neither stored nor indexed
        assert!(!store.hash_get_all("cache:users:1").await.unwrap().contains_key("bio"));
    }

    #[tokio::test]
    async fn test_set_rejects_invalid_document() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store.clone(), true);
        let bad = json!({"id": 1, "username": 5, "age": 1, "created_at": 0, "bio": null});
        let err = c.set(bad.as_object().unwrap()).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_set_replaces_stale_index_entries() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store.clone(), true);
        c.set(&user(1, "alice", 30)).await.unwrap();
        c.set(&user(1, "alicia", 31)).await.unwrap();

        assert!(ids(&c, json!({"username": "alice"})).await.is_empty());
        assert_eq!(ids(&c, json!({"username": "alicia"})).await, vec![1]);
        assert!(ids(&c, json!({"age": 30})).await.is_empty());
    }

    #[tokio::test]
    async fn test_equality_and_range_queries() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store, true);
        for (id, name, age) in [(1, "a", 20), (2, "b", 25), (3, "c", 30), (4, "b", 35)] {
            c.set(&user(id, name, age)).await.unwrap();
        }

        assert_eq!(ids(&c, json!({"username": "b"})).await, vec![2, 4]);
        assert_eq!(ids(&c, json!({"age": {"$gte": 25}})).await, vec![2, 3, 4]);
        assert_eq!(ids(&c, json!({"age": {"$gt": 25, "$lt": 35}})).await, vec![3]);
        assert_eq!(ids(&c, json!({"age": 30})).await, vec![3]);
        assert_eq!(ids(&c, json!({"username": {"$in": ["a", "c"]}})).await, vec![1, 3]);
        assert_eq!(ids(&c, json!({"username": "b", "age": {"$lt": 30}})).await, vec![2]);
        assert_eq!(
            ids(&c, json!({"$or": [{"username": "a"}, {"age": {"$gte": 35}}]})).await,
            vec![1, 4]
        );
    }

    #[tokio::test]
    async fn test_timestamp_range_accepts_string_bounds() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store, true);
        c.set(&user(1, "a", 1)).await.unwrap();
        c.set(&user(2, "b", 1)).await.unwrap();

        let found = ids(&c, json!({"created_at": {"$gte": "2023-11-14T22:13:20Z"}})).await;
        assert_eq!(found, vec![1, 2]);
        let found = ids(&c, json!({"created_at": {"$gt": 1_700_000_001}})).await;
        assert_eq!(found, vec![2]);
    }

    #[tokio::test]
    async fn test_unindexable_queries_match_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store, true);
        c.set(&user(1, "alice", 30)).await.unwrap();

        assert!(ids(&c, json!({"nickname": "x"})).await.is_empty());
        assert!(ids(&c, json!({"username": {"$gt": "a"}})).await.is_empty());
        assert!(ids(&c, json!({"username": {"$ne": "bob"}})).await.is_empty());
        assert!(ids(&c, json!({"id": {"$gt": 0}})).await.is_empty());
        assert!(ids(&c, json!({})).await.is_empty());
    }

    #[tokio::test]
    async fn test_id_lookups() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store, true);
        c.set(&user(1, "a", 20)).await.unwrap();
        c.set(&user(2, "b", 20)).await.unwrap();

        assert_eq!(ids(&c, json!({"id": 1})).await, vec![1]);
        assert_eq!(ids(&c, json!({"id": "2"})).await, vec![2]);
        assert!(ids(&c, json!({"id": 9})).await.is_empty());
        assert_eq!(ids(&c, json!({"id": {"$in": [1, 2, 3]}})).await, vec![1, 2]);
        // Range on id narrows an indexed conjunction
        assert_eq!(ids(&c, json!({"age": 20, "id": {"$gt": 1}})).await, vec![2]);
    }

    #[tokio::test]
    async fn test_update_moves_index_entries() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store.clone(), true);
        c.set(&user(1, "alice", 30)).await.unwrap();

        let patch = json!({"username": "alicia", "age": 31, "bio": "hi"});
        let n = c.update(&Filter::by_id(1), patch.as_object().unwrap()).await.unwrap();
        assert_eq!(n, 1);

        assert!(ids(&c, json!({"username": "alice"})).await.is_empty());
        assert_eq!(ids(&c, json!({"username": "alicia"})).await, vec![1]);
        assert_eq!(ids(&c, json!({"age": 31})).await, vec![1]);
        assert_eq!(ids(&c, json!({"bio": "hi"})).await, vec![1]);

        let doc = &c.get(&Filter::by_id(1)).await.unwrap()[0];
        assert_eq!(doc["username"], json!("alicia"));
        assert_eq!(doc["age"], json!(31));
    }

    #[tokio::test]
    async fn test_update_to_null_clears_field_and_index() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store.clone(), true);
        c.set(&user(1, "alice", 30)).await.unwrap();

        let patch = json!({"age": null});
        c.update(&Filter::by_id(1), patch.as_object().unwrap()).await.unwrap();

        assert!(ids(&c, json!({"age": {"$gte": 0}})).await.is_empty());
        let doc = &c.get(&Filter::by_id(1)).await.unwrap()[0];
        assert_eq!(doc["age"], Value::Null);
    }

    #[tokio::test]
    async fn test_update_rejects_id_and_unknown_fields() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store, true);
        c.set(&user(1, "alice", 30)).await.unwrap();

        let err = c
            .update(&Filter::by_id(1), json!({"id": 5}).as_object().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(c
            .update(&Filter::by_id(1), json!({"nope": 5}).as_object().unwrap())
            .await
            .is_err());
        assert_eq!(ids(&c, json!({"username": "alice"})).await, vec![1]);
    }

    #[tokio::test]
    async fn test_update_with_no_match_changes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store, true);
        let n = c
            .update(&Filter::eq("username", json!("ghost")), json!({"age": 1}).as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store.clone(), true);
        c.set(&user(1, "alice", 30)).await.unwrap();
        c.set(&user(2, "bob", 40)).await.unwrap();

        assert_eq!(c.delete(&Filter::eq("username", json!("alice"))).await.unwrap(), 1);
        assert!(c.get(&Filter::by_id(1)).await.unwrap().is_empty());
        assert!(ids(&c, json!({"username": "alice"})).await.is_empty());
        assert!(ids(&c, json!({"age": 30})).await.is_empty());
        assert!(store.sorted_score("idx:lru:global", "users:1").await.unwrap().is_none());

        assert_eq!(ids(&c, json!({"username": "bob"})).await, vec![2]);
        assert!(!c.delete_by_id(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_touches_recency() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store.clone(), true);
        c.set(&user(1, "a", 1)).await.unwrap();
        c.set(&user(2, "b", 1)).await.unwrap();

        let recency = RecencyRecord::new(store.clone());
        assert_eq!(recency.oldest(1).await.unwrap(), vec!["users:1"]);

        c.get(&Filter::by_id(1)).await.unwrap();
        assert_eq!(recency.oldest(1).await.unwrap(), vec!["users:2"]);
    }

    #[tokio::test]
    async fn test_pinned_collection_is_not_tracked() {
        let store = Arc::new(InMemoryStore::new());
        let c = users(store.clone(), false);
        c.set(&user(1, "a", 1)).await.unwrap();
        c.get(&Filter::by_id(1)).await.unwrap();
        assert!(store.sorted_head("idx:lru:global", 10).await.unwrap().is_empty());
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Uniqueness checks for constrained values (username, email, phone).
//!
//! ```text
//! is_unique(field, value)
//!   filter says absent ─────────────► unique (no store touched)
//!   filter says maybe ─► probes in order: cache index, mongo, postgres
//!                         any hit ───► taken
//!                         no hit ────► unique (false positive)
//! ```
//!
//! Filter changes are applied locally first, then broadcast on the flux bus
//! as `{"action":"ADD"|"DEL","key":"field:value"}` so every process converges.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{doc, Document as BsonDocument};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::filter_manager::UniquenessFilter;
use super::flux::FluxBus;
use crate::document::{Collection, Filter};
use crate::flush::mapper::quote_ident;
use crate::metrics;
use crate::storage::StorageError;

/// Filter key for a constrained value.
#[must_use]
pub fn unique_key(field: &str, value: &str) -> String {
    format!("{field}:{value}")
}

/// Quote a possibly schema-qualified table name (`auth.users`).
fn quote_table(table: &str) -> String {
    table.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterAction {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "DEL")]
    Delete,
}

/// Filter change broadcast between processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterUpdate {
    #[serde(alias = "Action")]
    pub action: FilterAction,
    #[serde(alias = "Key")]
    pub key: String,
    /// Publishing process; a process skips its own updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// A store that can confirm a value is already taken.
#[async_trait]
pub trait ExistenceProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn exists(&self, field: &str, value: &str) -> Result<bool, StorageError>;
}

/// Looks the value up in a cached collection's exact-match index.
pub struct CacheIndexProbe {
    collection: Arc<Collection>,
}

impl CacheIndexProbe {
    pub fn new(collection: Arc<Collection>) -> Self {
        Self { collection }
    }
}

#[async_trait]
impl ExistenceProbe for CacheIndexProbe {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn exists(&self, field: &str, value: &str) -> Result<bool, StorageError> {
        let filter = Filter::eq(field, Value::String(value.to_string()));
        Ok(!self.collection.resolve(&filter).await?.is_empty())
    }
}

pub struct MongoProbe {
    collection: mongodb::Collection<BsonDocument>,
}

impl MongoProbe {
    pub fn new(client: &mongodb::Client, database: &str, collection: &str) -> Self {
        Self {
            collection: client.database(database).collection(collection),
        }
    }
}

#[async_trait]
impl ExistenceProbe for MongoProbe {
    fn name(&self) -> &'static str {
        "mongo"
    }

    async fn exists(&self, field: &str, value: &str) -> Result<bool, StorageError> {
        let mut filter = BsonDocument::new();
        filter.insert(field, value);
        let found = self
            .collection
            .find_one(filter)
            .projection(doc! { "_id": 1 })
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(found.is_some())
    }
}

pub struct PostgresProbe {
    pool: PgPool,
    table: String,
}

impl PostgresProbe {
    pub fn new(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
        }
    }
}

#[async_trait]
impl ExistenceProbe for PostgresProbe {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn exists(&self, field: &str, value: &str) -> Result<bool, StorageError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {}::text = $1)",
            quote_table(&self.table),
            quote_ident(field)
        );
        sqlx::query_scalar::<_, bool>(&sql)
            .bind(value)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

/// Load every non-empty `(field, value)` of `table` into the filter.
/// Returns the number of rows scanned.
pub async fn warm_from_postgres(
    pool: &PgPool,
    table: &str,
    fields: &[String],
    filter: &UniquenessFilter,
) -> Result<usize, StorageError> {
    if fields.is_empty() {
        return Ok(0);
    }
    let columns: Vec<String> = fields.iter().map(|f| format!("{}::text", quote_ident(f))).collect();
    let sql = format!("SELECT {} FROM {}", columns.join(", "), quote_table(table));

    let mut rows = sqlx::query(&sql).fetch(pool);
    let mut scanned = 0;
    while let Some(row) = rows.try_next().await.map_err(|e| StorageError::Backend(e.to_string()))? {
        for (i, field) in fields.iter().enumerate() {
            let value: Option<String> = row.try_get(i).map_err(|e| StorageError::Backend(e.to_string()))?;
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                filter.insert(&unique_key(field, &value));
            }
        }
        scanned += 1;
        if scanned % 100_000 == 0 {
            debug!(scanned, "Uniqueness warmup progress");
        }
    }
    Ok(scanned)
}

pub struct UniquenessChecker {
    filter: Arc<UniquenessFilter>,
    probes: Vec<Arc<dyn ExistenceProbe>>,
    bus: Option<Arc<FluxBus>>,
    origin: String,
}

impl UniquenessChecker {
    pub fn new(filter: Arc<UniquenessFilter>, probes: Vec<Arc<dyn ExistenceProbe>>, bus: Option<Arc<FluxBus>>) -> Self {
        Self {
            filter,
            probes,
            bus,
            origin: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn filter(&self) -> &Arc<UniquenessFilter> {
        &self.filter
    }

    /// Whether no record holds `value` in `field`.
    pub async fn is_unique(&self, field: &str, value: &str) -> Result<bool, StorageError> {
        let key = unique_key(field, value);
        if !self.filter.might_contain(&key) {
            metrics::record_uniqueness_check("filter_negative");
            return Ok(true);
        }

        for probe in &self.probes {
            if probe.exists(field, value).await? {
                debug!(field, probe = probe.name(), "Value already taken");
                metrics::record_uniqueness_check("confirmed_taken");
                return Ok(false);
            }
        }
        metrics::record_uniqueness_check("unique");
        Ok(true)
    }

    /// Record a newly taken value here and on every other process.
    pub async fn claim(&self, field: &str, value: &str) -> Result<(), StorageError> {
        let key = unique_key(field, value);
        self.filter.insert(&key);
        self.broadcast(FilterAction::Add, key).await
    }

    /// Release a value that is no longer taken.
    pub async fn release(&self, field: &str, value: &str) -> Result<(), StorageError> {
        let key = unique_key(field, value);
        self.filter.remove(&key);
        self.broadcast(FilterAction::Delete, key).await
    }

    async fn broadcast(&self, action: FilterAction, key: String) -> Result<(), StorageError> {
        let Some(bus) = &self.bus else {
            return Ok(());
        };
        let update = FilterUpdate {
            action,
            key,
            origin: Some(self.origin.clone()),
        };
        bus.publish(&serde_json::to_string(&update)?).await?;
        Ok(())
    }

    /// Apply an update received from the bus. Returns false for updates this
    /// process published itself.
    pub fn apply(&self, update: &FilterUpdate) -> bool {
        if update.origin.as_deref() == Some(self.origin.as_str()) {
            return false;
        }
        match update.action {
            FilterAction::Add => self.filter.insert(&update.key),
            FilterAction::Delete => {
                self.filter.remove(&update.key);
            }
        }
        metrics::record_flux_message("applied");
        true
    }

    /// Apply bus updates until shutdown or until the subscription ends.
    pub async fn listen(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), StorageError> {
        let Some(bus) = self.bus.clone() else {
            return Ok(());
        };
        let mut updates = bus.subscribe().await?;
        info!(channel = bus.channel(), "Listening for uniqueness filter updates");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = updates.next() => {
                    let Some(payload) = next else {
                        warn!(channel = bus.channel(), "Uniqueness update subscription closed");
                        break;
                    };
                    match serde_json::from_str::<FilterUpdate>(&payload) {
                        Ok(update) => {
                            self.apply(&update);
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed filter update"),
                    }
                }
            }
        }
        debug!("Uniqueness listener stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{CollectionRegistry, FieldKind, Schema};
    use crate::eviction::RecencyRecord;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::KvStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    struct FixedProbe {
        taken: Vec<&'static str>,
        calls: Mutex<usize>,
    }

    impl FixedProbe {
        fn new(taken: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                taken,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl ExistenceProbe for FixedProbe {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn exists(&self, _field: &str, value: &str) -> Result<bool, StorageError> {
            *self.calls.lock() += 1;
            Ok(self.taken.contains(&value))
        }
    }

    fn warmed_filter(keys: &[&str]) -> Arc<UniquenessFilter> {
        let filter = Arc::new(UniquenessFilter::new(1_000));
        filter.bulk_insert(keys.iter().copied());
        filter.mark_warmed();
        filter
    }

    #[tokio::test]
    async fn test_negative_lookup_skips_probes() {
        let probe = FixedProbe::new(vec!["alice"]);
        let checker = UniquenessChecker::new(warmed_filter(&[]), vec![probe.clone()], None);
        assert!(checker.is_unique("username", "alice").await.unwrap());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_positive_lookup_confirmed_by_probe() {
        let probe = FixedProbe::new(vec!["alice"]);
        let checker = UniquenessChecker::new(warmed_filter(&["username:alice"]), vec![probe.clone()], None);
        assert!(!checker.is_unique("username", "alice").await.unwrap());
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_false_positive_resolved_by_probes() {
        let first = FixedProbe::new(vec![]);
        let second = FixedProbe::new(vec![]);
        let checker = UniquenessChecker::new(
            warmed_filter(&["username:bob"]),
            vec![first.clone(), second.clone()],
            None,
        );
        assert!(checker.is_unique("username", "bob").await.unwrap());
        assert_eq!((first.calls(), second.calls()), (1, 1));
    }

    #[tokio::test]
    async fn test_probe_order_short_circuits() {
        let first = FixedProbe::new(vec!["carol"]);
        let second = FixedProbe::new(vec!["carol"]);
        let checker = UniquenessChecker::new(
            warmed_filter(&["username:carol"]),
            vec![first.clone(), second.clone()],
            None,
        );
        assert!(!checker.is_unique("username", "carol").await.unwrap());
        assert_eq!((first.calls(), second.calls()), (1, 0));
    }

    #[tokio::test]
    async fn test_cache_index_probe() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let registry = CollectionRegistry::new(store.clone(), Arc::new(RecencyRecord::new(store)));
        let users = registry.register(
            "users",
            Schema::new([("username", FieldKind::String), ("email", FieldKind::String)]),
            false,
        );
        users
            .set(json!({"id": 1, "username": "alice", "email": null}).as_object().unwrap())
            .await
            .unwrap();

        let probe = CacheIndexProbe::new(users);
        assert!(probe.exists("username", "alice").await.unwrap());
        assert!(!probe.exists("username", "bob").await.unwrap());
    }

    #[test]
    fn test_update_wire_format() {
        let update = FilterUpdate {
            action: FilterAction::Add,
            key: "email:a@b.c".into(),
            origin: None,
        };
        assert_eq!(serde_json::to_string(&update).unwrap(), r#"{"action":"ADD","key":"email:a@b.c"}"#);

        let legacy: FilterUpdate = serde_json::from_str(r#"{"Action":"DEL","Key":"phone:1"}"#).unwrap();
        assert_eq!(legacy.action, FilterAction::Delete);
        assert_eq!(legacy.key, "phone:1");
    }

    #[tokio::test]
    async fn test_claims_propagate_between_processes() {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let bus = || Some(Arc::new(FluxBus::new(store.clone(), "cuckoo-sync", 5)));
        let here = Arc::new(UniquenessChecker::new(warmed_filter(&[]), vec![], bus()));
        let there = Arc::new(UniquenessChecker::new(warmed_filter(&[]), vec![], bus()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(there.clone().listen(shutdown_rx));
        // Let the listener subscribe before publishing
        tokio::time::sleep(Duration::from_millis(50)).await;

        here.claim("username", "dave").await.unwrap();
        for _ in 0..100 {
            if there.filter().might_contain("username:dave") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(there.filter().might_contain("username:dave"));
        assert!(here.filter().might_contain("username:dave"));

        here.release("username", "dave").await.unwrap();
        for _ in 0..100 {
            if !there.filter().might_contain("username:dave") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!there.filter().might_contain("username:dave"));

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap().unwrap();
    }

    #[test]
    fn test_own_updates_ignored() {
        let checker = UniquenessChecker::new(warmed_filter(&[]), vec![], None);
        let own = FilterUpdate {
            action: FilterAction::Add,
            key: "username:eve".into(),
            origin: Some(checker.origin.clone()),
        };
        assert!(!checker.apply(&own));
        assert!(!checker.filter().might_contain("username:eve"));

        let remote = FilterUpdate { origin: None, ..own };
        assert!(checker.apply(&remote));
        assert!(checker.filter().might_contain("username:eve"));
    }

    #[test]
    fn test_quote_table() {
        assert_eq!(quote_table("auth.users"), r#""auth"."users""#);
        assert_eq!(unique_key("email", "x@y.z"), "email:x@y.z");
    }
}

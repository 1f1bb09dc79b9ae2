// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document-store flusher.
//!
//! Each entity type becomes one ordered client bulk write (MongoDB 8.0+):
//! Create inserts the payload with `_id` set to the event id, Update `$set`s
//! the payload fields by `_id`, Delete removes by `_id`.

use async_trait::async_trait;
use mongodb::bson::{self, doc, Document as BsonDocument};
use mongodb::options::{ClientOptions, DeleteOneModel, InsertOneModel, UpdateOneModel, WriteModel};
use mongodb::{Client, Namespace};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{group_by_entity, FlushReport, Flusher};
use crate::document::schema::ID_FIELD;
use crate::metrics::FlushTimer;
use crate::queue::{Action, AsyncEvent, EntityType};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::StorageError;

const MONGO_ID: &str = "_id";

/// Oldest server major version with client-level `bulkWrite`.
pub const MIN_SERVER_MAJOR: i64 = 8;

/// Major version from a `buildInfo` reply: `versionArray[0]`, else the
/// leading component of `version`.
fn server_major_version(build_info: &BsonDocument) -> Option<i64> {
    let from_array = build_info
        .get_array("versionArray")
        .ok()
        .and_then(|parts| parts.first())
        .and_then(|major| match major {
            bson::Bson::Int32(n) => Some(i64::from(*n)),
            bson::Bson::Int64(n) => Some(*n),
            bson::Bson::Double(n) => Some(*n as i64),
            _ => None,
        });
    from_array.or_else(|| {
        build_info
            .get_str("version")
            .ok()?
            .split('.')
            .next()?
            .parse()
            .ok()
    })
}

/// Refuse servers that cannot run client-level bulk writes, so the mismatch
/// shows at startup instead of as a failed flush on every batch.
fn check_server_version(build_info: &BsonDocument) -> Result<(), StorageError> {
    match server_major_version(build_info) {
        Some(major) if major >= MIN_SERVER_MAJOR => Ok(()),
        Some(_) => Err(StorageError::Backend(format!(
            "MongoDB {} is not supported, client bulk writes need {}.0 or newer",
            build_info.get_str("version").unwrap_or("server"),
            MIN_SERVER_MAJOR
        ))),
        None => Err(StorageError::Backend(
            "MongoDB buildInfo did not report a server version".to_string(),
        )),
    }
}

/// Collection an entity type is written to.
#[must_use]
pub fn collection_for(entity: &EntityType) -> Option<&'static str> {
    Some(match entity {
        EntityType::Users => "users",
        EntityType::UserSettings => "user_settings",
        EntityType::Sessions => "sessions",
        EntityType::Relations => "relations",
        EntityType::Posts => "posts",
        EntityType::Comments => "comments",
        EntityType::Likes => "likes",
        EntityType::Media => "media",
        EntityType::Conversations => "conversations_meta",
        EntityType::Members => "conversation_members",
        EntityType::Messages => "messages",
        EntityType::Other(_) => return None,
    })
}

/// One write, before it is bound to a namespace.
#[derive(Debug, Clone, PartialEq)]
enum MongoOp {
    Insert(BsonDocument),
    Update { filter: BsonDocument, update: BsonDocument },
    Delete { filter: BsonDocument },
}

impl MongoOp {
    fn from_event(event: &AsyncEvent) -> Result<Option<Self>, StorageError> {
        Ok(match event.action {
            Action::Create => {
                let mut document = payload_document(&event.payload)?;
                document.remove(ID_FIELD);
                document.insert(MONGO_ID, event.id);
                Some(MongoOp::Insert(document))
            }
            Action::Update => {
                let mut fields = payload_document(&event.payload)?;
                fields.remove(ID_FIELD);
                fields.remove(MONGO_ID);
                if fields.is_empty() {
                    return Ok(None);
                }
                Some(MongoOp::Update {
                    filter: doc! { MONGO_ID: event.id },
                    update: doc! { "$set": fields },
                })
            }
            Action::Delete => Some(MongoOp::Delete {
                filter: doc! { MONGO_ID: event.id },
            }),
        })
    }

    fn into_model(self, namespace: Namespace) -> WriteModel {
        match self {
            MongoOp::Insert(document) => WriteModel::InsertOne(
                InsertOneModel::builder()
                    .namespace(namespace)
                    .document(document)
                    .build(),
            ),
            MongoOp::Update { filter, update } => WriteModel::UpdateOne(
                UpdateOneModel::builder()
                    .namespace(namespace)
                    .filter(filter)
                    .update(update)
                    .build(),
            ),
            MongoOp::Delete { filter } => WriteModel::DeleteOne(
                DeleteOneModel::builder()
                    .namespace(namespace)
                    .filter(filter)
                    .build(),
            ),
        }
    }
}

fn payload_document(payload: &Value) -> Result<BsonDocument, StorageError> {
    match payload {
        Value::Object(_) => bson::to_document(payload).map_err(|e| StorageError::Serialization(e.to_string())),
        Value::Null => Ok(BsonDocument::new()),
        other => Err(StorageError::Serialization(format!("payload is not an object: {other}"))),
    }
}

pub struct MongoFlusher {
    client: Client,
    database: String,
}

impl MongoFlusher {
    pub fn new(client: Client, database: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
        }
    }

    /// Connect with startup-mode retry, verify the server answers and that it
    /// is MongoDB 8.0 or newer.
    pub async fn connect(connection_string: &str, database: &str) -> Result<Self, StorageError> {
        let client = retry("mongo_connect", &RetryConfig::startup(), || async {
            let options = ClientOptions::parse(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let client = Client::with_options(options).map_err(|e| StorageError::Backend(e.to_string()))?;
            client
                .database(database)
                .run_command(doc! { "ping": 1 })
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok::<_, StorageError>(client)
        })
        .await?;

        let build_info = client
            .database("admin")
            .run_command(doc! { "buildInfo": 1 })
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        check_server_version(&build_info)?;
        debug!(version = build_info.get_str("version").unwrap_or("?"), "Connected to MongoDB");
        Ok(Self::new(client, database))
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    fn namespace(&self, collection: &str) -> Namespace {
        self.client
            .database(&self.database)
            .collection::<BsonDocument>(collection)
            .namespace()
    }
}

#[async_trait]
impl Flusher for MongoFlusher {
    fn name(&self) -> &'static str {
        "mongo"
    }

    async fn flush(&self, events: &[AsyncEvent]) -> Result<FlushReport, StorageError> {
        let mut timer = FlushTimer::new("mongo");
        let mut report = FlushReport::default();
        let mut failures = Vec::new();

        for (entity, group) in group_by_entity(events) {
            let Some(collection) = collection_for(&entity) else {
                warn!(entity = %entity, count = group.len(), "No collection for entity, skipping events");
                report.skipped += group.len();
                continue;
            };

            let namespace = self.namespace(collection);
            let mut models = Vec::with_capacity(group.len());
            for event in &group {
                match MongoOp::from_event(event) {
                    Ok(Some(op)) => models.push(op.into_model(namespace.clone())),
                    Ok(None) => report.skipped += 1,
                    Err(e) => {
                        warn!(collection, id = event.id, error = %e, "Skipping unconvertible event");
                        report.skipped += 1;
                    }
                }
            }
            if models.is_empty() {
                continue;
            }

            let count = models.len();
            match self.client.bulk_write(models).ordered(true).await {
                Ok(result) => {
                    debug!(
                        collection,
                        inserted = result.inserted_count,
                        modified = result.modified_count,
                        deleted = result.deleted_count,
                        "Bulk write done"
                    );
                    report.written += count;
                }
                Err(e) => {
                    error!(collection, count, error = %e, "Document flush failed, batch dropped");
                    failures.push(format!("{collection}: {e}"));
                }
            }
        }

        if !failures.is_empty() {
            return Err(StorageError::Backend(failures.join("; ")));
        }
        timer.succeed();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Target;
    use serde_json::json;

    fn event(id: i64, action: Action, payload: Value) -> AsyncEvent {
        AsyncEvent::new(id, EntityType::Posts, action, payload, Target::MONGO)
    }

    #[test]
    fn test_server_version_gate() {
        let old = doc! { "version": "7.0.12", "versionArray": [7, 0, 12, 0] };
        assert_eq!(server_major_version(&old), Some(7));
        assert!(matches!(check_server_version(&old), Err(StorageError::Backend(msg)) if msg.contains("7.0.12")));

        let current = doc! { "version": "8.0.4", "versionArray": [8, 0, 4, 0] };
        assert!(check_server_version(&current).is_ok());

        // Falls back to the version string
        let string_only = doc! { "version": "9.1.0-rc0" };
        assert_eq!(server_major_version(&string_only), Some(9));
        assert!(check_server_version(&string_only).is_ok());

        assert!(check_server_version(&doc! { "ok": 1 }).is_err());
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(collection_for(&EntityType::Conversations), Some("conversations_meta"));
        assert_eq!(collection_for(&EntityType::Members), Some("conversation_members"));
        assert_eq!(collection_for(&EntityType::Other("stories".into())), None);
        for entity in EntityType::BUILTIN.iter() {
            assert!(collection_for(entity).is_some());
        }
    }

    #[test]
    fn test_insert_uses_event_id() {
        let op = MongoOp::from_event(&event(9, Action::Create, json!({"id": 9, "content": "hi"})))
            .unwrap()
            .unwrap();
        assert_eq!(op, MongoOp::Insert(doc! { "content": "hi", "_id": 9_i64 }));
    }

    #[test]
    fn test_update_sets_fields_by_id() {
        let op = MongoOp::from_event(&event(9, Action::Update, json!({"content": "edit", "_id": 1})))
            .unwrap()
            .unwrap();
        assert_eq!(
            op,
            MongoOp::Update {
                filter: doc! { "_id": 9_i64 },
                update: doc! { "$set": { "content": "edit" } },
            }
        );
        assert!(MongoOp::from_event(&event(9, Action::Update, json!({"id": 9})))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_delete_ignores_payload() {
        let op = MongoOp::from_event(&event(4, Action::Delete, Value::Null)).unwrap().unwrap();
        assert_eq!(op, MongoOp::Delete { filter: doc! { "_id": 4_i64 } });
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(MongoOp::from_event(&event(1, Action::Create, json!([1, 2]))).is_err());
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity to table mappings for the relational flusher.
//!
//! Each mapping knows its target table and typed column list, and renders
//! event payloads as `COPY ... WITH (FORMAT csv)` rows:
//!
//! - NULL is an unquoted empty field, every other value is quoted
//! - arrays become Postgres array literals (`{"a","b"}`, `{1,2}`)
//! - JSON columns carry the JSON text
//! - timestamps are normalized to RFC 3339 UTC
//!
//! Updates only touch the columns present in the payload, so the merge
//! statement and temp table are generated per column set.

use std::collections::HashMap;

use chrono::SecondsFormat;
use serde_json::Value;
use thiserror::Error;

use crate::document::schema::{parse_timestamp, value_as_id, ID_FIELD};
use crate::queue::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    BigInt,
    Int,
    Text,
    Bool,
    Date,
    Timestamp,
    TextArray,
    BigIntArray,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

/// A payload that cannot be turned into a row. The row is skipped, the batch continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("payload is not an object")]
    NotAnObject,
    #[error("column '{column}': {reason}")]
    InvalidValue { column: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct TableMapping {
    pub entity: EntityType,
    pub schema: String,
    pub table: String,
    /// Ordered column list; the first is always `id`
    pub columns: Vec<Column>,
    /// Whether update events are applied (append-only tables have none)
    pub updatable: bool,
}

/// Quote an identifier for Postgres.
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

impl TableMapping {
    pub fn new(entity: EntityType, schema: &str, table: &str, columns: &[(&str, ColumnKind)]) -> Self {
        let mut cols: Vec<Column> = vec![Column {
            name: ID_FIELD.to_string(),
            kind: ColumnKind::BigInt,
        }];
        cols.extend(
            columns
                .iter()
                .filter(|(name, _)| *name != ID_FIELD)
                .map(|(name, kind)| Column {
                    name: (*name).to_string(),
                    kind: *kind,
                }),
        );
        Self {
            entity,
            schema: schema.to_string(),
            table: table.to_string(),
            columns: cols,
            updatable: true,
        }
    }

    #[must_use]
    pub fn append_only(mut self) -> Self {
        self.updatable = false;
        self
    }

    /// `"schema"."table"`
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// `id` plus the mapped columns present in an update payload, in table order.
    #[must_use]
    pub fn update_columns(&self, patch: &serde_json::Map<String, Value>) -> Vec<&Column> {
        self.columns
            .iter()
            .filter(|c| c.name == ID_FIELD || patch.contains_key(&c.name))
            .collect()
    }

    #[must_use]
    pub fn copy_statement(target: &str, columns: &[&Column]) -> String {
        let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        format!("COPY {} ({}) FROM STDIN WITH (FORMAT csv)", target, names.join(", "))
    }

    /// Transaction-scoped temp table holding just `columns`, typed like the target.
    #[must_use]
    pub fn temp_table_statement(&self, temp: &str, columns: &[&Column]) -> String {
        let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        format!(
            "CREATE TEMP TABLE {} ON COMMIT DROP AS SELECT {} FROM {} WITH NO DATA",
            quote_ident(temp),
            names.join(", "),
            self.qualified_name()
        )
    }

    /// `UPDATE target SET c = tmp.c, ... FROM tmp WHERE target.id = tmp.id`,
    /// or `None` when nothing besides the id would change.
    #[must_use]
    pub fn merge_statement(&self, temp: &str, columns: &[&Column]) -> Option<String> {
        if !self.updatable {
            return None;
        }
        let sets: Vec<String> = columns
            .iter()
            .filter(|c| c.name != ID_FIELD)
            .map(|c| format!("{col} = tmp.{col}", col = quote_ident(&c.name)))
            .collect();
        if sets.is_empty() {
            return None;
        }
        Some(format!(
            "UPDATE {} AS t SET {} FROM {} AS tmp WHERE t.{id} = tmp.{id}",
            self.qualified_name(),
            sets.join(", "),
            quote_ident(temp),
            id = quote_ident(ID_FIELD)
        ))
    }

    /// One CSV line for `columns`. The `id` column always takes the event id.
    pub fn render_row(&self, id: i64, payload: &Value, columns: &[&Column]) -> Result<String, MappingError> {
        let fields = match payload {
            Value::Object(map) => map,
            _ => return Err(MappingError::NotAnObject),
        };

        let mut cells = Vec::with_capacity(columns.len());
        for column in columns {
            if column.name == ID_FIELD {
                cells.push(csv_field(Some(id.to_string())));
                continue;
            }
            let value = fields.get(&column.name).unwrap_or(&Value::Null);
            let cell = render_cell(column.kind, value).map_err(|reason| MappingError::InvalidValue {
                column: column.name.clone(),
                reason,
            })?;
            cells.push(csv_field(cell));
        }

        let mut line = cells.join(",");
        line.push('\n');
        Ok(line)
    }
}

fn csv_field(cell: Option<String>) -> String {
    match cell {
        None => String::new(),
        Some(s) => format!("\"{}\"", s.replace('"', "\"\"")),
    }
}

fn array_element(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn as_integer(value: &Value) -> Option<i64> {
    value_as_id(value).or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
            .map(|f| f as i64)
    })
}

fn as_array(value: &Value) -> Result<Vec<Value>, String> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(format!("expected an array, got {s:?}")),
        },
        other => Err(format!("expected an array, got {other}")),
    }
}

/// Text form of one cell, `None` for NULL.
fn render_cell(kind: ColumnKind, value: &Value) -> Result<Option<String>, String> {
    if value.is_null() {
        return Ok(None);
    }
    let text = match kind {
        ColumnKind::BigInt => as_integer(value)
            .ok_or_else(|| format!("expected an integer, got {value}"))?
            .to_string(),
        ColumnKind::Int => {
            let n = as_integer(value).ok_or_else(|| format!("expected an integer, got {value}"))?;
            i32::try_from(n)
                .map_err(|_| format!("{n} out of range for integer"))?
                .to_string()
        }
        ColumnKind::Text => match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        ColumnKind::Bool => {
            let b = match value {
                Value::Bool(b) => *b,
                Value::Number(n) if n.as_i64() == Some(0) => false,
                Value::Number(n) if n.as_i64() == Some(1) => true,
                Value::String(s) => match s.as_str() {
                    "true" | "t" | "1" => true,
                    "false" | "f" | "0" => false,
                    _ => return Err(format!("expected a boolean, got {s:?}")),
                },
                other => return Err(format!("expected a boolean, got {other}")),
            };
            b.to_string()
        }
        ColumnKind::Date => parse_timestamp(value)
            .ok_or_else(|| format!("unparseable date {value}"))?
            .format("%Y-%m-%d")
            .to_string(),
        ColumnKind::Timestamp => parse_timestamp(value)
            .ok_or_else(|| format!("unparseable timestamp {value}"))?
            .to_rfc3339_opts(SecondsFormat::Micros, true),
        ColumnKind::TextArray => {
            let items: Vec<String> = as_array(value)?
                .iter()
                .map(|item| match item {
                    Value::Null => "NULL".to_string(),
                    Value::String(s) => array_element(s),
                    other => array_element(&other.to_string()),
                })
                .collect();
            format!("{{{}}}", items.join(","))
        }
        ColumnKind::BigIntArray => {
            let mut items = Vec::new();
            for item in as_array(value)? {
                match item {
                    Value::Null => items.push("NULL".to_string()),
                    other => items.push(
                        as_integer(&other)
                            .ok_or_else(|| format!("expected integer elements, got {other}"))?
                            .to_string(),
                    ),
                }
            }
            format!("{{{}}}", items.join(","))
        }
        ColumnKind::Json => match value {
            Value::String(s) if serde_json::from_str::<Value>(s).is_ok() => s.clone(),
            other => other.to_string(),
        },
    };
    Ok(Some(text))
}

/// Mappings by entity type.
#[derive(Debug, Clone, Default)]
pub struct MapperRegistry {
    mappings: HashMap<EntityType, TableMapping>,
}

impl MapperRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any existing mapping for the same entity.
    pub fn register(&mut self, mapping: TableMapping) {
        self.mappings.insert(mapping.entity.clone(), mapping);
    }

    #[must_use]
    pub fn get(&self, entity: &EntityType) -> Option<&TableMapping> {
        self.mappings.get(entity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Mappings for the built-in social schema.
    #[must_use]
    pub fn builtin() -> Self {
        use ColumnKind::*;

        let mut registry = Self::new();
        registry.register(TableMapping::new(
            EntityType::Users,
            "auth",
            "users",
            &[
                ("username", Text),
                ("email", Text),
                ("email_verified", Bool),
                ("phone", Text),
                ("phone_verified", Bool),
                ("password_hash", Text),
                ("first_name", Text),
                ("last_name", Text),
                ("birthdate", Date),
                ("sex", Int),
                ("bio", Text),
                ("profile_picture_id", BigInt),
                ("grade", Int),
                ("location", Text),
                ("school", Text),
                ("work", Text),
                ("badges", TextArray),
                ("desactivated", Bool),
                ("banned", Bool),
                ("ban_reason", Text),
                ("ban_expires_at", Timestamp),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
            ],
        ));
        registry.register(TableMapping::new(
            EntityType::UserSettings,
            "auth",
            "user_settings",
            &[
                ("user_id", BigInt),
                ("privacy", Json),
                ("notifications", Json),
                ("language", Text),
                ("theme", Int),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
            ],
        ));
        registry.register(TableMapping::new(
            EntityType::Sessions,
            "auth",
            "sessions",
            &[
                ("user_id", BigInt),
                ("master_token", Text),
                ("device_token", Text),
                ("device_info", Json),
                ("ip_history", TextArray),
                ("current_secret", Text),
                ("last_secret", Text),
                ("last_jwt", Text),
                ("tolerance_time", Timestamp),
                ("created_at", Timestamp),
                ("expires_at", Timestamp),
            ],
        ));
        registry.register(TableMapping::new(
            EntityType::Relations,
            "auth",
            "relations",
            &[
                ("primary_id", BigInt),
                ("secondary_id", BigInt),
                ("state", Int),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
            ],
        ));
        registry.register(TableMapping::new(
            EntityType::Posts,
            "content",
            "posts",
            &[
                ("user_id", BigInt),
                ("content", Text),
                ("hashtags", TextArray),
                ("identifiers", BigIntArray),
                ("media_ids", BigIntArray),
                ("visibility", Int),
                ("location", Text),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
            ],
        ));
        registry.register(TableMapping::new(
            EntityType::Comments,
            "content",
            "comments",
            &[
                ("post_id", BigInt),
                ("user_id", BigInt),
                ("content", Text),
                ("visibility", Bool),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
            ],
        ));
        registry.register(
            TableMapping::new(
                EntityType::Likes,
                "content",
                "likes",
                &[
                    ("target_type", Int),
                    ("target_id", BigInt),
                    ("user_id", BigInt),
                    ("created_at", Timestamp),
                ],
            )
            .append_only(),
        );
        registry.register(TableMapping::new(
            EntityType::Media,
            "content",
            "media",
            &[
                ("owner_id", BigInt),
                ("storage_path", Text),
                ("visibility", Bool),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
            ],
        ));
        registry.register(TableMapping::new(
            EntityType::Conversations,
            "messaging",
            "conversations",
            &[
                ("type", Int),
                ("title", Text),
                ("last_message_id", BigInt),
                ("last_read_by_all_message_id", BigInt),
                ("state", Int),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
            ],
        ));
        registry.register(TableMapping::new(
            EntityType::Members,
            "messaging",
            "members",
            &[
                ("conversation_id", BigInt),
                ("user_id", BigInt),
                ("role", Int),
                ("joined_at", Timestamp),
                ("unread_count", Int),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
            ],
        ));
        registry.register(TableMapping::new(
            EntityType::Messages,
            "messaging",
            "messages",
            &[
                ("conversation_id", BigInt),
                ("sender_id", BigInt),
                ("message_type", Int),
                ("state", Int),
                ("content", Text),
                ("attachments", Json),
                ("created_at", Timestamp),
                ("updated_at", Timestamp),
            ],
        ));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn posts() -> TableMapping {
        MapperRegistry::builtin().get(&EntityType::Posts).unwrap().clone()
    }

    #[test]
    fn test_builtin_covers_every_entity() {
        let registry = MapperRegistry::builtin();
        assert_eq!(registry.len(), 11);
        for entity in EntityType::BUILTIN.iter() {
            let mapping = registry.get(entity).unwrap();
            assert_eq!(mapping.columns[0].name, "id");
        }
        assert!(registry.get(&EntityType::Other("stories".into())).is_none());
        assert!(!registry.get(&EntityType::Likes).unwrap().updatable);
        assert_eq!(
            registry.get(&EntityType::UserSettings).unwrap().qualified_name(),
            r#""auth"."user_settings""#
        );
    }

    #[test]
    fn test_copy_statement() {
        let mapping = posts();
        let cols: Vec<&Column> = mapping.columns.iter().take(3).collect();
        assert_eq!(
            TableMapping::copy_statement(&mapping.qualified_name(), &cols),
            r#"COPY "content"."posts" ("id", "user_id", "content") FROM STDIN WITH (FORMAT csv)"#
        );
    }

    #[test]
    fn test_render_full_row() {
        let mapping = posts();
        let cols: Vec<&Column> = mapping.columns.iter().collect();
        let row = mapping
            .render_row(
                7,
                &json!({
                    "id": 999,
                    "user_id": 1,
                    "content": "say \"hi\", ok",
                    "hashtags": ["rust", "a\"b"],
                    "identifiers": [],
                    "media_ids": "[3,4]",
                    "visibility": 0,
                    "created_at": 1_700_000_000,
                    "updated_at": "2023-11-14T22:13:20Z"
                }),
                &cols,
            )
            .unwrap();
        assert_eq!(
            row,
            concat!(
                r#""7","1","say ""hi"", ok","{""rust"",""a\""b""}","{}","{3,4}","0",,"#,
                r#""2023-11-14T22:13:20.000000Z","2023-11-14T22:13:20.000000Z""#,
                "\n"
            )
        );
    }

    #[test]
    fn test_empty_string_is_not_null() {
        let mapping = posts();
        let cols: Vec<&Column> = mapping.columns.iter().filter(|c| c.name == "id" || c.name == "location").collect();
        let row = mapping.render_row(1, &json!({"location": ""}), &cols).unwrap();
        assert_eq!(row, "\"1\",\"\"\n");
        let row = mapping.render_row(1, &json!({}), &cols).unwrap();
        assert_eq!(row, "\"1\",\n");
    }

    #[test]
    fn test_mapping_errors() {
        let mapping = posts();
        let cols: Vec<&Column> = mapping.columns.iter().collect();
        assert_eq!(mapping.render_row(1, &json!([1]), &cols), Err(MappingError::NotAnObject));

        let err = mapping.render_row(1, &json!({"user_id": "bob"}), &cols).unwrap_err();
        assert!(matches!(err, MappingError::InvalidValue { ref column, .. } if column == "user_id"));

        let err = mapping.render_row(1, &json!({"visibility": 1_i64 << 40}), &cols).unwrap_err();
        assert!(matches!(err, MappingError::InvalidValue { ref column, .. } if column == "visibility"));

        let err = mapping.render_row(1, &json!({"created_at": "yesterday"}), &cols).unwrap_err();
        assert!(matches!(err, MappingError::InvalidValue { ref column, .. } if column == "created_at"));
    }

    #[test]
    fn test_cells() {
        assert_eq!(render_cell(ColumnKind::Bool, &json!("t")), Ok(Some("true".into())));
        assert_eq!(render_cell(ColumnKind::Bool, &json!(0)), Ok(Some("false".into())));
        assert!(render_cell(ColumnKind::Bool, &json!("maybe")).is_err());
        assert_eq!(render_cell(ColumnKind::Date, &json!("2001-02-03")), Ok(Some("2001-02-03".into())));
        assert_eq!(render_cell(ColumnKind::Json, &json!({"a": 1})), Ok(Some(r#"{"a":1}"#.into())));
        assert_eq!(render_cell(ColumnKind::Json, &json!(r#"{"a":1}"#)), Ok(Some(r#"{"a":1}"#.into())));
        assert_eq!(render_cell(ColumnKind::Json, &json!("plain")), Ok(Some(r#""plain""#.into())));
        assert_eq!(render_cell(ColumnKind::BigInt, &json!("42")), Ok(Some("42".into())));
        assert_eq!(render_cell(ColumnKind::Text, &Value::Null), Ok(None));
        assert_eq!(
            render_cell(ColumnKind::TextArray, &json!(["10.0.0.1", null])),
            Ok(Some(r#"{"10.0.0.1",NULL}"#.into()))
        );
    }

    #[test]
    fn test_update_statements_follow_patch_columns() {
        let mapping = posts();
        let patch = json!({"content": "edited", "visibility": 2, "unknown": 1});
        let cols = mapping.update_columns(patch.as_object().unwrap());
        assert_eq!(cols.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), vec!["id", "content", "visibility"]);

        assert_eq!(
            mapping.temp_table_statement("tmp_posts_1", &cols),
            r#"CREATE TEMP TABLE "tmp_posts_1" ON COMMIT DROP AS SELECT "id", "content", "visibility" FROM "content"."posts" WITH NO DATA"#
        );
        assert_eq!(
            mapping.merge_statement("tmp_posts_1", &cols).unwrap(),
            r#"UPDATE "content"."posts" AS t SET "content" = tmp."content", "visibility" = tmp."visibility" FROM "tmp_posts_1" AS tmp WHERE t."id" = tmp."id""#
        );
    }

    #[test]
    fn test_no_merge_without_columns_or_updates() {
        let mapping = posts();
        let cols = mapping.update_columns(json!({"nope": 1}).as_object().unwrap());
        assert!(mapping.merge_statement("tmp", &cols).is_none());

        let likes = MapperRegistry::builtin().get(&EntityType::Likes).unwrap().clone();
        let cols: Vec<&Column> = likes.columns.iter().collect();
        assert!(likes.merge_statement("tmp", &cols).is_none());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("type"), "\"type\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}

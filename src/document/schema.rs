// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field kinds, schema validation and the string encoding used in Redis hashes.
//!
//! Every non-id field gets exactly one index entry, and its [`FieldKind`]
//! decides which kind:
//!
//! | Kind | Index | Score / token |
//! |------|-------|---------------|
//! | `Integer` | range | the number |
//! | `Timestamp` | range | Unix seconds |
//! | `Reference`, `String`, `Boolean`, `StringList`, `Json` | exact | dequoted text |
//!
//! `Reference` is for 64-bit foreign identifiers. They are integers, but a
//! float score cannot hold every i64, so they are matched exactly.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::storage::StorageError;

/// A cached document: field name to JSON value, with an integer `id`.
pub type Document = Map<String, Value>;

/// Name of the primary key field in every schema.
pub const ID_FIELD: &str = "id";

/// Semantic type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Integer,
    /// 64-bit identifier of another document
    Reference,
    String,
    Boolean,
    Timestamp,
    StringList,
    /// JSON object (or array) column
    Json,
}

/// Which secondary index a field lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// `idx:{collection}:{field}:{value}` set of ids
    Exact,
    /// `idx:zset:{collection}:{field}` id scored by value
    Range,
}

impl FieldKind {
    #[must_use]
    pub fn index_kind(self) -> IndexKind {
        match self {
            FieldKind::Integer | FieldKind::Timestamp => IndexKind::Range,
            _ => IndexKind::Exact,
        }
    }

    /// Whether `value` is acceptable for this kind. Null is accepted for every
    /// kind; composite kinds and timestamps also accept their string form.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldKind::Integer | FieldKind::Reference, Value::Number(n)) => n.as_i64().is_some(),
            (FieldKind::String, Value::String(_)) => true,
            (FieldKind::Boolean, Value::Bool(_)) => true,
            (FieldKind::Timestamp, Value::Number(_) | Value::String(_)) => parse_timestamp(value).is_some(),
            (FieldKind::StringList, Value::Array(items)) => items
                .iter()
                .all(|v| matches!(v, Value::String(_) | Value::Number(_))),
            (FieldKind::StringList | FieldKind::Json, Value::String(_)) => true,
            (FieldKind::Json, Value::Object(_) | Value::Array(_)) => true,
            _ => false,
        }
    }

    /// Turn a stored hash string back into a typed value.
    #[must_use]
    pub fn decode(self, raw: &str) -> Value {
        match self {
            FieldKind::String => Value::String(raw.to_string()),
            FieldKind::Integer | FieldKind::Reference => raw
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            FieldKind::Boolean => match raw {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                other => Value::String(other.to_string()),
            },
            FieldKind::Timestamp => {
                if let Ok(n) = raw.parse::<i64>() {
                    Value::from(n)
                } else if let Some(n) = raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                    Value::Number(n)
                } else {
                    Value::String(raw.to_string())
                }
            }
            FieldKind::StringList | FieldKind::Json => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
            }
        }
    }

    /// Range-index score for a value of this kind.
    #[must_use]
    pub fn score(self, value: &Value) -> Option<f64> {
        match self {
            FieldKind::Timestamp => parse_timestamp(value).map(|t| t.timestamp() as f64),
            FieldKind::Integer => match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => dequote(s).parse::<f64>().ok(),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Strip one pair of surrounding double quotes.
#[must_use]
pub fn dequote(s: &str) -> &str {
    if s.len() > 1 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Hash-field encoding of a value; `None` for null (null fields are not stored).
#[must_use]
pub fn encode_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Exact-match index token for a value.
#[must_use]
pub fn index_token(value: &Value) -> Option<String> {
    encode_value(value).map(|s| dequote(&s).to_string())
}

/// Interpret a value as a document id (integer or numeric string).
#[must_use]
pub fn value_as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => dequote(s).parse().ok(),
        _ => None,
    }
}

/// Parse a timestamp from a number or string.
///
/// Numbers above 1e12 are Unix milliseconds, smaller ones Unix seconds.
/// Strings are dequoted, then tried as a number, RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`,
/// `YYYY-MM-DD` and RFC 2822.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                from_epoch(i)
            } else {
                let f = n.as_f64()?;
                let secs = f.trunc() as i64;
                let nanos = ((f - f.trunc()) * 1e9) as u32;
                DateTime::from_timestamp(secs, nanos)
            }
        }
        Value::String(s) => parse_timestamp_str(dequote(s)),
        _ => None,
    }
}

fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    if n > 1_000_000_000_000 {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(n) = s.parse::<i64>() {
        return from_epoch(n);
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(t.and_utc());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    }
    DateTime::parse_from_rfc2822(s).ok().map(|t| t.with_timezone(&Utc))
}

/// Field name to kind map for one collection. Always contains `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: BTreeMap<String, FieldKind>,
}

impl Schema {
    /// Build a schema; `id` is added as an integer if the caller left it out.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldKind)>,
        S: Into<String>,
    {
        let mut fields: BTreeMap<String, FieldKind> =
            fields.into_iter().map(|(name, kind)| (name.into(), kind)).collect();
        fields.entry(ID_FIELD.to_string()).or_insert(FieldKind::Integer);
        Self { fields }
    }

    #[must_use]
    pub fn kind(&self, field: &str) -> Option<FieldKind> {
        self.fields.get(field).copied()
    }

    /// Non-id fields with their kinds, in name order.
    pub fn indexed_fields(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.fields
            .iter()
            .filter(|(name, _)| name.as_str() != ID_FIELD)
            .map(|(name, kind)| (name.as_str(), *kind))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check a full document and return its id.
    pub fn validate(&self, doc: &Document) -> Result<i64, StorageError> {
        let id = doc
            .get(ID_FIELD)
            .and_then(Value::as_i64)
            .ok_or_else(|| StorageError::Validation("field 'id' must be a 64-bit integer".into()))?;

        for (field, kind) in &self.fields {
            let value = doc
                .get(field)
                .ok_or_else(|| StorageError::Validation(format!("missing field '{}'", field)))?;
            if !kind.accepts(value) {
                return Err(StorageError::Validation(format!(
                    "field '{}' expects {:?}, got {}",
                    field,
                    kind,
                    type_name(value)
                )));
            }
        }
        Ok(id)
    }

    /// Check a partial update: every field known, compatible, and not `id`.
    pub fn validate_patch(&self, patch: &Document) -> Result<(), StorageError> {
        for (field, value) in patch {
            if field == ID_FIELD {
                return Err(StorageError::Validation("field 'id' is immutable".into()));
            }
            let kind = self
                .kind(field)
                .ok_or_else(|| StorageError::Validation(format!("unknown field '{}'", field)))?;
            if !kind.accepts(value) {
                return Err(StorageError::Validation(format!(
                    "field '{}' expects {:?}, got {}",
                    field,
                    kind,
                    type_name(value)
                )));
            }
        }
        Ok(())
    }

    /// Hash fields to store for a document (null fields omitted).
    #[must_use]
    pub fn encode(&self, doc: &Document) -> Vec<(String, String)> {
        doc.iter()
            .filter(|(field, _)| self.fields.contains_key(field.as_str()))
            .filter_map(|(field, value)| encode_value(value).map(|raw| (field.clone(), raw)))
            .collect()
    }

    /// Rebuild a document from a stored hash. Schema fields missing from the
    /// hash read back as null; unknown hash fields are kept as strings.
    #[must_use]
    pub fn decode(&self, hash: &std::collections::HashMap<String, String>) -> Document {
        let mut doc = Document::new();
        for (field, kind) in &self.fields {
            let value = hash.get(field).map_or(Value::Null, |raw| kind.decode(raw));
            doc.insert(field.clone(), value);
        }
        for (field, raw) in hash {
            if !self.fields.contains_key(field) {
                doc.insert(field.clone(), Value::String(raw.clone()));
            }
        }
        doc
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

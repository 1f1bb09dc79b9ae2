// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filter expressions over cached documents.
//!
//! Filters are built either with the constructors on [`Filter`] or parsed from
//! the Mongo-like JSON form:
//!
//! ```
//! use nubo_store::document::{Filter, Op};
//! use serde_json::json;
//!
//! let filter = Filter::from_json(&json!({
//!     "$or": [
//!         {"user_id": 1},
//!         {"created_at": {"$gte": "2024-01-01T00:00:00Z"}}
//!     ]
//! })).unwrap();
//!
//! assert_eq!(
//!     filter,
//!     Filter::or(vec![
//!         Filter::eq("user_id", json!(1)),
//!         Filter::leaf("created_at", Op::Gte, json!("2024-01-01T00:00:00Z")),
//!     ])
//! );
//! ```

use serde_json::Value;

use crate::storage::{ScoreBound, StorageError};

/// Comparison operator of a leaf filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Eq,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Any other `$op`; matches nothing.
    Unsupported(String),
}

impl Op {
    #[must_use]
    pub fn parse(token: &str) -> Self {
        match token {
            "$eq" => Op::Eq,
            "$in" => Op::In,
            "$gt" => Op::Gt,
            "$gte" => Op::Gte,
            "$lt" => Op::Lt,
            "$lte" => Op::Lte,
            other => Op::Unsupported(other.to_string()),
        }
    }

    #[must_use]
    pub fn is_range(&self) -> bool {
        matches!(self, Op::Gt | Op::Gte | Op::Lt | Op::Lte)
    }

    /// Score bounds for a range operator against `score`.
    #[must_use]
    pub fn bounds(&self, score: f64) -> Option<(ScoreBound, ScoreBound)> {
        match self {
            Op::Eq | Op::In => Some((ScoreBound::Inclusive(score), ScoreBound::Inclusive(score))),
            Op::Gt => Some((ScoreBound::Exclusive(score), ScoreBound::PosInfinity)),
            Op::Gte => Some((ScoreBound::Inclusive(score), ScoreBound::PosInfinity)),
            Op::Lt => Some((ScoreBound::NegInfinity, ScoreBound::Exclusive(score))),
            Op::Lte => Some((ScoreBound::NegInfinity, ScoreBound::Inclusive(score))),
            Op::Unsupported(_) => None,
        }
    }

    /// Evaluate a range operator on two plain numbers.
    #[must_use]
    pub fn compare(&self, left: f64, right: f64) -> bool {
        match self {
            Op::Eq | Op::In => left == right,
            Op::Gt => left > right,
            Op::Gte => left >= right,
            Op::Lt => left < right,
            Op::Lte => left <= right,
            Op::Unsupported(_) => false,
        }
    }
}

/// A filter expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Leaf { field: String, op: Op, value: Value },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn leaf(field: impl Into<String>, op: Op, value: Value) -> Self {
        Filter::Leaf {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::leaf(field, Op::Eq, value)
    }

    pub fn any_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::leaf(field, Op::In, Value::Array(values))
    }

    /// Match a single document by id.
    #[must_use]
    pub fn by_id(id: i64) -> Self {
        Self::eq(super::schema::ID_FIELD, Value::from(id))
    }

    #[must_use]
    pub fn and(children: Vec<Filter>) -> Self {
        Filter::And(children)
    }

    #[must_use]
    pub fn or(children: Vec<Filter>) -> Self {
        Filter::Or(children)
    }

    /// Parse the JSON filter form.
    ///
    /// `{field: value}` means `$eq`; `{field: {"$op": value, ...}}` lists
    /// operators; `$and`/`$or` take arrays of sub-filters. Several clauses in
    /// one object are combined with AND.
    pub fn from_json(value: &Value) -> Result<Self, StorageError> {
        let object = value
            .as_object()
            .ok_or_else(|| StorageError::Validation("filter must be a JSON object".into()))?;

        let mut clauses = Vec::with_capacity(object.len());
        for (key, operand) in object {
            match key.as_str() {
                "$and" | "$or" => {
                    let items = operand.as_array().ok_or_else(|| {
                        StorageError::Validation(format!("{} expects an array of filters", key))
                    })?;
                    let children = items
                        .iter()
                        .map(Filter::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    clauses.push(if key == "$and" {
                        Filter::And(children)
                    } else {
                        Filter::Or(children)
                    });
                }
                k if k.starts_with('$') => {
                    return Err(StorageError::Validation(format!("unknown combinator {}", k)));
                }
                field => clauses.extend(parse_field(field, operand)?),
            }
        }

        if clauses.len() == 1 {
            Ok(clauses.remove(0))
        } else {
            Ok(Filter::And(clauses))
        }
    }
}

fn parse_field(field: &str, operand: &Value) -> Result<Vec<Filter>, StorageError> {
    let operators = match operand {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
        other => return Ok(vec![Filter::eq(field, other.clone())]),
    };

    operators
        .iter()
        .map(|(token, value)| {
            let op = Op::parse(token);
            if op == Op::In && !value.is_array() {
                return Err(StorageError::Validation(format!("$in on '{}' expects an array", field)));
            }
            Ok(Filter::leaf(field, op, value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shorthand_equality() {
        let filter = Filter::from_json(&json!({"username": "alice"})).unwrap();
        assert_eq!(filter, Filter::eq("username", json!("alice")));
    }

    #[test]
    fn test_operator_object() {
        let filter = Filter::from_json(&json!({"age": {"$gte": 18, "$lt": 30}})).unwrap();
        assert_eq!(
            filter,
            Filter::and(vec![
                Filter::leaf("age", Op::Gte, json!(18)),
                Filter::leaf("age", Op::Lt, json!(30)),
            ])
        );
    }

    #[test]
    fn test_multiple_fields_are_anded() {
        let filter = Filter::from_json(&json!({"a": 1, "b": 2})).unwrap();
        match filter {
            Filter::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_or() {
        let filter = Filter::from_json(&json!({
            "$or": [{"id": 1}, {"id": {"$in": [2, 3]}}]
        }))
        .unwrap();
        assert_eq!(
            filter,
            Filter::or(vec![
                Filter::by_id(1),
                Filter::any_of("id", vec![json!(2), json!(3)]),
            ])
        );
    }

    #[test]
    fn test_unknown_operator_is_kept() {
        let filter = Filter::from_json(&json!({"name": {"$regex": "^a"}})).unwrap();
        assert_eq!(filter, Filter::leaf("name", Op::Unsupported("$regex".into()), json!("^a")));
    }

    #[test]
    fn test_plain_object_value_is_equality() {
        let filter = Filter::from_json(&json!({"privacy": {"profile": "public"}})).unwrap();
        assert_eq!(filter, Filter::eq("privacy", json!({"profile": "public"})));
    }

    #[test]
    fn test_invalid_filters() {
        assert!(Filter::from_json(&json!([1, 2])).is_err());
        assert!(Filter::from_json(&json!({"$or": {"a": 1}})).is_err());
        assert!(Filter::from_json(&json!({"$nor": []})).is_err());
        assert!(Filter::from_json(&json!({"id": {"$in": 5}})).is_err());
    }

    #[test]
    fn test_bounds() {
        assert_eq!(
            Op::Gt.bounds(5.0),
            Some((ScoreBound::Exclusive(5.0), ScoreBound::PosInfinity))
        );
        assert_eq!(
            Op::Eq.bounds(5.0),
            Some((ScoreBound::Inclusive(5.0), ScoreBound::Inclusive(5.0)))
        );
        assert_eq!(Op::Unsupported("$ne".into()).bounds(5.0), None);
    }

    #[test]
    fn test_compare() {
        assert!(Op::Gte.compare(5.0, 5.0));
        assert!(!Op::Gt.compare(5.0, 5.0));
        assert!(Op::Lt.compare(4.0, 5.0));
        assert!(!Op::Unsupported("$ne".into()).compare(1.0, 2.0));
    }
}

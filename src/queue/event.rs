// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind event envelope.
//!
//! Serialized compactly because millions of these sit in Redis lists:
//!
//! ```json
//! {"id":42,"t":"Posts","a":"ADD","p":{...},"tg":3,"ts":1714557600000}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity an event applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Users,
    UserSettings,
    Sessions,
    Relations,
    Posts,
    Comments,
    Likes,
    Media,
    Conversations,
    Members,
    Messages,
    /// Entity without a built-in mapping
    Other(String),
}

impl EntityType {
    /// Built-in entities in foreign-key dependency order.
    pub const BUILTIN: [EntityType; 11] = [
        EntityType::Users,
        EntityType::UserSettings,
        EntityType::Sessions,
        EntityType::Relations,
        EntityType::Posts,
        EntityType::Comments,
        EntityType::Likes,
        EntityType::Media,
        EntityType::Conversations,
        EntityType::Members,
        EntityType::Messages,
    ];

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Users => "Users",
            EntityType::UserSettings => "UserSettings",
            EntityType::Sessions => "Sessions",
            EntityType::Relations => "Relations",
            EntityType::Posts => "Posts",
            EntityType::Comments => "Comments",
            EntityType::Likes => "Likes",
            EntityType::Media => "Media",
            EntityType::Conversations => "Conversations",
            EntityType::Members => "Members",
            EntityType::Messages => "Messages",
            EntityType::Other(name) => name,
        }
    }

    /// Position in foreign-key order; unknown entities sort last.
    #[must_use]
    pub fn dependency_rank(&self) -> usize {
        Self::BUILTIN
            .iter()
            .position(|e| e == self)
            .unwrap_or(Self::BUILTIN.len())
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "Users" => EntityType::Users,
            "UserSettings" => EntityType::UserSettings,
            "Sessions" => EntityType::Sessions,
            "Relations" => EntityType::Relations,
            "Posts" => EntityType::Posts,
            "Comments" => EntityType::Comments,
            "Likes" => EntityType::Likes,
            "Media" => EntityType::Media,
            "Conversations" => EntityType::Conversations,
            "Members" => EntityType::Members,
            "Messages" => EntityType::Messages,
            _ => EntityType::Other(name),
        }
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        EntityType::from(name.to_string())
    }
}

impl From<EntityType> for String {
    fn from(entity: EntityType) -> Self {
        entity.as_str().to_string()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "ADD")]
    Create,
    #[serde(rename = "UPD")]
    Update,
    #[serde(rename = "DEL")]
    Delete,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Create, Action::Update, Action::Delete];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "ADD",
            Action::Update => "UPD",
            Action::Delete => "DEL",
        }
    }

    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "ADD" => Some(Action::Create),
            "UPD" => Some(Action::Update),
            "DEL" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination stores as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(u8);

impl Target {
    pub const NONE: Target = Target(0);
    pub const MONGO: Target = Target(1);
    pub const POSTGRES: Target = Target(1 << 1);
    pub const ALL: Target = Target(1 | 1 << 1);

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn includes_mongo(self) -> bool {
        self.0 & Self::MONGO.0 != 0
    }

    #[must_use]
    pub fn includes_postgres(self) -> bool {
        self.0 & Self::POSTGRES.0 != 0
    }
}

impl std::ops::BitOr for Target {
    type Output = Target;

    fn bitor(self, rhs: Target) -> Target {
        Target(self.0 | rhs.0)
    }
}

/// One pending mutation for the durable stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncEvent {
    pub id: i64,
    #[serde(rename = "t")]
    pub entity: EntityType,
    #[serde(rename = "a")]
    pub action: Action,
    /// Full row for ADD, changed fields for UPD, usually null for DEL
    #[serde(rename = "p", default)]
    pub payload: Value,
    #[serde(rename = "tg")]
    pub targets: Target,
    /// Enqueue time, Unix milliseconds
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
}

impl AsyncEvent {
    #[must_use]
    pub fn new(id: i64, entity: EntityType, action: Action, payload: Value, targets: Target) -> Self {
        Self {
            id,
            entity,
            action,
            payload,
            targets,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let event = AsyncEvent {
            id: 9_007_199_254_740_993,
            entity: EntityType::Posts,
            action: Action::Create,
            payload: json!({"content": "hi"}),
            targets: Target::ALL,
            timestamp_ms: 1_714_557_600_000,
        };
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(
            encoded,
            json!({
                "id": 9_007_199_254_740_993_i64, "t": "Posts", "a": "ADD",
                "p": {"content": "hi"}, "tg": 3, "ts": 1_714_557_600_000_i64
            })
        );
    }

    #[test]
    fn test_decode_preserves_large_ids() {
        let raw = r#"{"id":1234567890123456789,"t":"Messages","a":"UPD","p":{"sender_id":1234567890123456788},"tg":2,"ts":1}"#;
        let event: AsyncEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.id, 1_234_567_890_123_456_789);
        assert_eq!(event.payload["sender_id"].as_i64(), Some(1_234_567_890_123_456_788));
        assert_eq!(event.action, Action::Update);
        assert!(event.targets.includes_postgres());
        assert!(!event.targets.includes_mongo());
    }

    #[test]
    fn test_unknown_entity_roundtrips() {
        let raw = r#"{"id":1,"t":"Stories","a":"DEL","tg":1,"ts":5}"#;
        let event: AsyncEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.entity, EntityType::Other("Stories".into()));
        assert_eq!(event.payload, Value::Null);
        assert!(serde_json::to_string(&event).unwrap().contains(r#""t":"Stories""#));
    }

    #[test]
    fn test_dependency_rank() {
        assert!(EntityType::Users.dependency_rank() < EntityType::Posts.dependency_rank());
        assert!(EntityType::Conversations.dependency_rank() < EntityType::Members.dependency_rank());
        assert!(EntityType::Members.dependency_rank() < EntityType::Messages.dependency_rank());
        assert_eq!(EntityType::Other("x".into()).dependency_rank(), 11);
    }

    #[test]
    fn test_target_bits() {
        assert_eq!(Target::MONGO | Target::POSTGRES, Target::ALL);
        assert!(!Target::NONE.includes_mongo());
        assert_eq!(Target::ALL.bits(), 3);
    }

    #[test]
    fn test_action_tokens() {
        for action in Action::ALL {
            assert_eq!(Action::parse(action.as_str()), Some(action));
        }
        assert_eq!(Action::parse("PUT"), None);
    }
}

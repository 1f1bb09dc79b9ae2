// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Built-in collections of the social platform cache.

use super::schema::{FieldKind, Schema};

use FieldKind::{Boolean, Integer, Json, Reference, String as Text, StringList, Timestamp};

/// Definition of one built-in collection.
pub struct CollectionDef {
    pub name: &'static str,
    pub evictable: bool,
    pub fields: &'static [(&'static str, FieldKind)],
}

impl CollectionDef {
    #[must_use]
    pub fn schema(&self) -> Schema {
        Schema::new(self.fields.iter().copied())
    }
}

/// All built-in collections. Account data is pinned; content is evictable.
pub const BUILTIN: &[CollectionDef] = &[
    CollectionDef {
        name: "users",
        evictable: false,
        fields: &[
            ("id", Integer),
            ("username", Text),
            ("email", Text),
            ("email_verified", Boolean),
            ("phone", Text),
            ("phone_verified", Boolean),
            ("password_hash", Text),
            ("first_name", Text),
            ("last_name", Text),
            ("birthdate", Timestamp),
            ("sex", Integer),
            ("bio", Text),
            ("profile_picture_id", Reference),
            ("grade", Integer),
            ("location", Text),
            ("school", Text),
            ("work", Text),
            ("badges", StringList),
            ("desactivated", Boolean),
            ("banned", Boolean),
            ("ban_reason", Text),
            ("ban_expires_at", Timestamp),
            ("created_at", Timestamp),
            ("updated_at", Timestamp),
        ],
    },
    CollectionDef {
        name: "user_settings",
        evictable: false,
        fields: &[
            ("id", Integer),
            ("user_id", Reference),
            ("privacy", Json),
            ("notifications", Json),
            ("language", Text),
            ("theme", Integer),
            ("created_at", Timestamp),
            ("updated_at", Timestamp),
        ],
    },
    CollectionDef {
        name: "sessions",
        evictable: false,
        fields: &[
            ("id", Integer),
            ("user_id", Reference),
            ("master_token", Text),
            ("device_token", Text),
            ("device_info", Json),
            ("ip_history", StringList),
            ("current_secret", Text),
            ("last_secret", Text),
            ("last_jwt", Text),
            ("tolerance_time", Timestamp),
            ("created_at", Timestamp),
            ("expires_at", Timestamp),
        ],
    },
    CollectionDef {
        name: "relations",
        evictable: true,
        fields: &[
            ("id", Integer),
            ("primary_id", Reference),
            ("secondary_id", Reference),
            ("state", Integer),
            ("created_at", Timestamp),
            ("updated_at", Timestamp),
        ],
    },
    CollectionDef {
        name: "posts",
        evictable: true,
        fields: &[
            ("id", Integer),
            ("user_id", Reference),
            ("content", Text),
            ("hashtags", StringList),
            ("identifiers", StringList),
            ("media_ids", StringList),
            ("visibility", Integer),
            ("location", Text),
            ("created_at", Timestamp),
            ("updated_at", Timestamp),
        ],
    },
    CollectionDef {
        name: "comments",
        evictable: true,
        fields: &[
            ("id", Integer),
            ("post_id", Reference),
            ("user_id", Reference),
            ("content", Text),
            ("visibility", Boolean),
            ("created_at", Timestamp),
            ("updated_at", Timestamp),
        ],
    },
    CollectionDef {
        name: "likes",
        evictable: true,
        fields: &[
            ("id", Integer),
            ("target_type", Integer),
            ("target_id", Reference),
            ("user_id", Reference),
            ("created_at", Timestamp),
        ],
    },
    CollectionDef {
        name: "media",
        evictable: true,
        fields: &[
            ("id", Integer),
            ("owner_id", Reference),
            ("storage_path", Text),
            ("visibility", Boolean),
            ("created_at", Timestamp),
            ("updated_at", Timestamp),
        ],
    },
    CollectionDef {
        name: "conversations",
        evictable: true,
        fields: &[
            ("id", Integer),
            ("type", Integer),
            ("title", Text),
            ("last_message_id", Reference),
            ("last_read_by_all_message_id", Reference),
            ("state", Integer),
            ("created_at", Timestamp),
            ("updated_at", Timestamp),
        ],
    },
    CollectionDef {
        name: "members",
        evictable: true,
        fields: &[
            ("id", Integer),
            ("conversation_id", Reference),
            ("user_id", Reference),
            ("role", Integer),
            ("joined_at", Timestamp),
            ("unread_count", Integer),
            ("created_at", Timestamp),
            ("updated_at", Timestamp),
        ],
    },
    CollectionDef {
        name: "messages",
        evictable: true,
        fields: &[
            ("id", Integer),
            ("conversation_id", Reference),
            ("sender_id", Reference),
            ("message_type", Integer),
            ("state", Integer),
            ("content", Text),
            ("attachments", Json),
            ("created_at", Timestamp),
            ("updated_at", Timestamp),
        ],
    },
];

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable write-behind queue in Redis.

pub mod event;
pub mod write_behind;

pub use event::{Action, AsyncEvent, EntityType, Target};
pub use write_behind::{shard_for, QueueStats, WriteBehindQueue};

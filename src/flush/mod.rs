// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable store flushers for write-behind batches.
//!
//! ```text
//! batch ──► Flusher::flush
//!             ├─ MongoFlusher     one ordered bulk write per entity type
//!             └─ PostgresFlusher  COPY inserts, temp-table merge updates,
//!                                 ANY($1) deletes, in foreign-key order
//! ```
//!
//! A failed flush is reported to the caller and the batch is dropped; nothing
//! is requeued.

pub mod mapper;
pub mod mongo;
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::queue::{AsyncEvent, EntityType};
use crate::storage::StorageError;

pub use mapper::{ColumnKind, MapperRegistry, MappingError, TableMapping};
pub use mongo::MongoFlusher;
pub use postgres::PostgresFlusher;

/// What a flush applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Rows or documents written; successive updates of one id count once
    pub written: usize,
    /// Events dropped before reaching the store (unmapped entity, bad row)
    pub skipped: usize,
}

impl FlushReport {
    pub fn merge(&mut self, other: FlushReport) {
        self.written += other.written;
        self.skipped += other.skipped;
    }
}

/// A durable store a batch of events is written to.
#[async_trait]
pub trait Flusher: Send + Sync {
    /// Store name used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn flush(&self, events: &[AsyncEvent]) -> Result<FlushReport, StorageError>;
}

/// Events grouped by entity type, in foreign-key order, each group keeping
/// its queue order.
#[must_use]
pub fn group_by_entity(events: &[AsyncEvent]) -> Vec<(EntityType, Vec<&AsyncEvent>)> {
    let mut groups: BTreeMap<(usize, EntityType), Vec<&AsyncEvent>> = BTreeMap::new();
    for event in events {
        groups
            .entry((event.entity.dependency_rank(), event.entity.clone()))
            .or_default()
            .push(event);
    }
    groups
        .into_iter()
        .map(|((_, entity), events)| (entity, events))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Action, Target};
    use serde_json::Value;

    fn event(id: i64, entity: EntityType) -> AsyncEvent {
        AsyncEvent::new(id, entity, Action::Create, Value::Null, Target::ALL)
    }

    #[test]
    fn test_group_by_entity_orders_by_dependency() {
        let events = vec![
            event(1, EntityType::Messages),
            event(2, EntityType::Other("stories".into())),
            event(3, EntityType::Users),
            event(4, EntityType::Messages),
            event(5, EntityType::Conversations),
        ];
        let groups = group_by_entity(&events);
        let order: Vec<_> = groups.iter().map(|(e, _)| e.clone()).collect();
        assert_eq!(
            order,
            vec![
                EntityType::Users,
                EntityType::Conversations,
                EntityType::Messages,
                EntityType::Other("stories".into()),
            ]
        );
        let messages: Vec<i64> = groups[2].1.iter().map(|e| e.id).collect();
        assert_eq!(messages, vec![1, 4]);
    }

    #[test]
    fn test_report_merge() {
        let mut total = FlushReport::default();
        total.merge(FlushReport { written: 3, skipped: 1 });
        total.merge(FlushReport { written: 2, skipped: 0 });
        assert_eq!(total, FlushReport { written: 5, skipped: 1 });
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Global access-recency record for evictable documents.
//!
//! One sorted set (`idx:lru:global`) scores `{collection}:{id}` members by the
//! time of their last write or read, in microseconds. The head of the set is
//! the least recently used document.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::keys::{self, RECENCY_KEY};
use crate::storage::{KvOp, KvStore, StorageError};

pub struct RecencyRecord {
    store: Arc<dyn KvStore>,
    last_stamp: AtomicU64,
}

impl RecencyRecord {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            last_stamp: AtomicU64::new(0),
        }
    }

    /// Current time in microseconds, strictly greater than any stamp handed
    /// out before by this record.
    pub fn next_stamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut last = self.last_stamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last_stamp
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Write that marks a document as just accessed.
    pub fn touch_op(&self, collection: &str, id: i64) -> KvOp {
        KvOp::SortedAdd {
            key: RECENCY_KEY.to_string(),
            member: keys::recency_member(collection, id),
            score: self.next_stamp() as f64,
        }
    }

    /// Write that drops a document from the record.
    #[must_use]
    pub fn forget_op(collection: &str, id: i64) -> KvOp {
        KvOp::SortedRemove {
            key: RECENCY_KEY.to_string(),
            member: keys::recency_member(collection, id),
        }
    }

    /// Up to `count` least recently used members, oldest first.
    pub async fn oldest(&self, count: usize) -> Result<Vec<String>, StorageError> {
        self.store.sorted_head(RECENCY_KEY, count).await
    }

    /// Remove a member that no longer maps to a document.
    pub async fn forget_member(&self, member: &str) -> Result<(), StorageError> {
        self.store
            .apply(&[KvOp::SortedRemove {
                key: RECENCY_KEY.to_string(),
                member: member.to_string(),
            }])
            .await
    }

    /// Last-access stamp of a document, if it is tracked.
    pub async fn stamp(&self, collection: &str, id: i64) -> Result<Option<f64>, StorageError> {
        self.store
            .sorted_score(RECENCY_KEY, &keys::recency_member(collection, id))
            .await
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cuckoo filter over unique-constrained values (`field:value` keys).
//!
//! A negative lookup proves a value is free; a positive one only means it
//! might be taken. Removing a fingerprint from a cuckoo filter is only safe
//! for a key that is really in it, so the filter keeps an insertion ledger
//! keyed by a 64-bit hash of the key:
//!
//! - the first insert of a key adds its fingerprint, later ones only count
//! - a remove decrements; the fingerprint goes when the count reaches zero
//! - removing a key the ledger has never seen is refused

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};

use cuckoofilter::{CuckooError, CuckooFilter};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::metrics;

/// Outcome of a remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Last reference gone, fingerprint deleted
    Deleted,
    /// Other references remain, fingerprint kept
    Decremented,
    /// The key was never inserted here; nothing changed
    Refused,
}

pub struct UniquenessFilter {
    filter: RwLock<CuckooFilter<DefaultHasher>>,
    ledger: DashMap<u64, u32>,
    capacity: usize,
    /// Set once warmup completed; before that negatives prove nothing
    warmed: AtomicBool,
}

fn ledger_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl UniquenessFilter {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        info!(capacity, "Creating uniqueness filter");
        Self {
            filter: RwLock::new(CuckooFilter::with_capacity(capacity.max(1))),
            ledger: DashMap::new(),
            capacity,
            warmed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_warmed(&self) -> bool {
        self.warmed.load(Ordering::Acquire)
    }

    pub fn mark_warmed(&self) {
        info!(entries = self.len(), "Uniqueness filter warmed");
        self.warmed.store(true, Ordering::Release);
    }

    /// Whether `key` might be present. Always true until warmed.
    #[must_use]
    pub fn might_contain(&self, key: &str) -> bool {
        if !self.is_warmed() {
            return true;
        }
        self.filter.read().contains(key)
    }

    /// Record one insertion of `key`.
    pub fn insert(&self, key: &str) {
        match self.ledger.entry(ledger_key(key)) {
            Entry::Occupied(mut count) => {
                *count.get_mut() += 1;
            }
            Entry::Vacant(slot) => {
                let added = self.filter.write().add(key);
                slot.insert(1);
                if let Err(CuckooError::NotEnoughSpace) = added {
                    // The key went in but another fingerprint was pushed out,
                    // so negatives can no longer be trusted
                    warn!(key, capacity = self.capacity, "Uniqueness filter full, falling back to store checks");
                    self.warmed.store(false, Ordering::Release);
                }
            }
        }
        metrics::set_cuckoo_entries(self.len());
    }

    /// Drop one insertion of `key`.
    pub fn remove(&self, key: &str) -> Removal {
        let removal = match self.ledger.entry(ledger_key(key)) {
            Entry::Vacant(_) => {
                warn!(key, "Refusing to delete a key the filter never recorded");
                Removal::Refused
            }
            Entry::Occupied(mut count) if *count.get() > 1 => {
                *count.get_mut() -= 1;
                Removal::Decremented
            }
            Entry::Occupied(count) => {
                count.remove();
                self.filter.write().delete(key);
                Removal::Deleted
            }
        };
        metrics::set_cuckoo_entries(self.len());
        removal
    }

    /// Insert many keys, returning how many were seen.
    pub fn bulk_insert<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        keys.into_iter().map(|key| self.insert(key)).count()
    }

    /// Distinct keys recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ledger.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ledger.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warmed(capacity: usize) -> UniquenessFilter {
        let filter = UniquenessFilter::new(capacity);
        filter.mark_warmed();
        filter
    }

    #[test]
    fn test_cold_filter_proves_nothing() {
        let filter = UniquenessFilter::new(100);
        assert!(filter.might_contain("username:ghost"));
        filter.mark_warmed();
        assert!(!filter.might_contain("username:ghost"));
    }

    #[test]
    fn test_no_false_negatives() {
        let filter = warmed(10_000);
        for i in 0..5_000 {
            filter.insert(&format!("email:user{i}@nubo.io"));
        }
        for i in 0..5_000 {
            assert!(filter.might_contain(&format!("email:user{i}@nubo.io")));
        }
        assert_eq!(filter.len(), 5_000);
    }

    #[test]
    fn test_false_positive_rate_bounded() {
        let filter = warmed(100_000);
        let members: Vec<String> = (0..20_000).map(|i| format!("username:member{i}")).collect();
        assert_eq!(filter.bulk_insert(members.iter().map(String::as_str)), 20_000);
        let false_positives = (0..20_000)
            .filter(|i| filter.might_contain(&format!("username:stranger{i}")))
            .count();
        // 8-bit fingerprints, 4-slot buckets: well under 3%
        assert!(false_positives < 600, "{false_positives} false positives");
    }

    #[test]
    fn test_remove_follows_ledger() {
        let filter = warmed(100);
        filter.insert("phone:+331");
        filter.insert("phone:+331");

        assert_eq!(filter.remove("phone:+331"), Removal::Decremented);
        assert!(filter.might_contain("phone:+331"));
        assert_eq!(filter.remove("phone:+331"), Removal::Deleted);
        assert!(!filter.might_contain("phone:+331"));
        assert!(filter.is_empty());
    }

    #[test]
    fn test_remove_unknown_key_refused() {
        let filter = warmed(100);
        filter.insert("username:alice");
        assert_eq!(filter.remove("username:bob"), Removal::Refused);
        assert!(filter.might_contain("username:alice"));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_overflow_distrusts_negatives() {
        let filter = warmed(8);
        for i in 0..200 {
            filter.insert(&format!("username:u{i}"));
        }
        assert!(!filter.is_warmed());
        assert!(filter.might_contain("username:nobody"));
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Which queue of a shard to drain next.
//!
//! Priority order:
//!
//! 1. **Critical**: the oldest queue whose head has waited at least
//!    `critical_delay`.
//! 2. **Volume**: the fullest queue with at least `high_volume_threshold`
//!    pending events.
//! 3. **Fallback**: the oldest queue, so nothing starves.

use std::time::Duration;

use crate::config::StoreConfig;
use crate::queue::QueueStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPolicy {
    pub critical_delay: Duration,
    pub high_volume_threshold: u64,
    pub max_batch_size: usize,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Why a queue was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Critical,
    Volume,
    Fallback,
}

impl Selection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Selection::Critical => "critical",
            Selection::Volume => "volume",
            Selection::Fallback => "fallback",
        }
    }
}

impl SchedulerPolicy {
    #[must_use]
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            critical_delay: config.critical_delay(),
            high_volume_threshold: config.high_volume_threshold,
            max_batch_size: config.max_batch_size.max(1),
        }
    }

    /// Pick the queue to drain from a shard's dashboard rows, or `None` when
    /// nothing is pending.
    #[must_use]
    pub fn decide_next_batch<'a>(&self, stats: &'a [QueueStats]) -> Option<(&'a QueueStats, Selection)> {
        let pending = || stats.iter().filter(|s| s.count > 0);

        if let Some(critical) = pending()
            .filter(|s| s.age >= self.critical_delay)
            .max_by_key(|s| s.age)
        {
            return Some((critical, Selection::Critical));
        }

        if let Some(busy) = pending()
            .filter(|s| s.count >= self.high_volume_threshold)
            .max_by_key(|s| s.count)
        {
            return Some((busy, Selection::Volume));
        }

        pending().max_by_key(|s| s.age).map(|s| (s, Selection::Fallback))
    }

    /// Events to pop for a queue with `pending` entries.
    #[must_use]
    pub fn batch_size(&self, pending: u64) -> usize {
        usize::try_from(pending)
            .unwrap_or(usize::MAX)
            .min(self.max_batch_size)
    }
}

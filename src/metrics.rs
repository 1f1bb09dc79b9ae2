// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` facade; the embedding service picks the exporter.
//!
//! # Naming
//! - `nubo_store_` prefix
//! - `_total` suffix for counters, `_seconds` for duration histograms
//!
//! # Labels
//! - `collection`: cache collection name
//! - `store`: mongo, postgres
//! - `status`: success, error

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Record a document operation against a collection
pub fn record_document_operation(collection: &str, operation: &'static str, count: usize) {
    counter!(
        "nubo_store_documents_total",
        "collection" => collection.to_string(),
        "operation" => operation
    )
    .increment(count as u64);
}

/// Record a rejected write (validation failure)
pub fn record_validation_failure(collection: &str) {
    counter!(
        "nubo_store_validation_failures_total",
        "collection" => collection.to_string()
    )
    .increment(1);
}

/// Record documents evicted under memory pressure
pub fn record_eviction(count: usize) {
    counter!("nubo_store_evictions_total").increment(count as u64);
}

/// Record an eviction failure for one document
pub fn record_eviction_error() {
    counter!("nubo_store_eviction_errors_total").increment(1);
}

/// Last measured memory usage of the backing store
pub fn set_memory_used(bytes: u64) {
    gauge!("nubo_store_memory_used_bytes").set(bytes as f64);
}

/// Record an event appended to the write-behind queue
pub fn record_enqueue(entity: &str, action: &'static str) {
    counter!(
        "nubo_store_queue_enqueued_total",
        "entity" => entity.to_string(),
        "action" => action
    )
    .increment(1);
}

/// Record events popped from the write-behind queue
pub fn record_pop(count: usize) {
    counter!("nubo_store_queue_popped_total").increment(count as u64);
}

/// Record a queue entry that could not be decoded
pub fn record_undecodable_event() {
    counter!("nubo_store_queue_undecodable_total").increment(1);
}

/// Record a dispatched batch size
pub fn record_batch_size(count: usize) {
    histogram!("nubo_store_batch_size").record(count as f64);
}

/// Record the outcome of a flush to one store
pub fn record_flush(store: &'static str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "error" };
    counter!(
        "nubo_store_flush_total",
        "store" => store,
        "status" => status
    )
    .increment(1);
    histogram!("nubo_store_flush_seconds", "store" => store).record(duration.as_secs_f64());
}

/// Record rows dropped by the relational flusher because they could not be mapped
pub fn record_rows_skipped(count: usize) {
    counter!("nubo_store_flush_rows_skipped_total").increment(count as u64);
}

/// Record a batch where one store succeeded and the other failed
pub fn record_cross_store_divergence() {
    counter!("nubo_store_cross_store_divergence_total").increment(1);
}

/// Record a uniqueness check outcome (`filter_negative`, `confirmed_taken`, `unique`)
pub fn record_uniqueness_check(outcome: &'static str) {
    counter!(
        "nubo_store_uniqueness_checks_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Set current uniqueness filter entry count
pub fn set_cuckoo_entries(count: usize) {
    gauge!("nubo_store_cuckoo_entries").set(count as f64);
}

/// Record a flux message (`published`, `applied`, `expired`)
pub fn record_flux_message(direction: &'static str) {
    counter!(
        "nubo_store_flux_messages_total",
        "direction" => direction
    )
    .increment(1);
}

/// Record time spent in a startup phase
pub fn record_startup_phase(phase: &'static str, duration: Duration) {
    histogram!(
        "nubo_store_startup_seconds",
        "phase" => phase
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records a flush duration on drop
pub struct FlushTimer {
    store: &'static str,
    start: Instant,
    success: bool,
}

impl FlushTimer {
    pub fn new(store: &'static str) -> Self {
        Self {
            store,
            start: Instant::now(),
            success: false,
        }
    }

    /// Mark the flush as successful before the guard drops
    pub fn succeed(&mut self) {
        self.success = true;
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        record_flush(self.store, self.success, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder installed: these only check the calls are well-formed.

    #[test]
    fn test_document_metrics() {
        record_document_operation("posts", "set", 1);
        record_document_operation("users", "delete", 3);
        record_validation_failure("posts");
    }

    #[test]
    fn test_queue_metrics() {
        record_enqueue("Posts", "ADD");
        record_pop(3000);
        record_undecodable_event();
        record_batch_size(5000);
    }

    #[test]
    fn test_flush_timer() {
        {
            let mut timer = FlushTimer::new("postgres");
            timer.succeed();
        }
        let _failed = FlushTimer::new("mongo");
    }

    #[test]
    fn test_misc_metrics() {
        record_eviction(50);
        record_eviction_error();
        set_memory_used(1024);
        record_rows_skipped(2);
        record_cross_store_divergence();
        record_uniqueness_check("unique");
        set_cuckoo_entries(10);
        record_flux_message("published");
        record_startup_phase("connect", Duration::from_millis(5));
    }
}

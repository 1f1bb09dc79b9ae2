//! Memory-pressure eviction for the document cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Eviction Module                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  recency.rs    - Global LRU record (idx:lru:global)          │
//! │  └─ RecencyRecord: strictly increasing microsecond stamps    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  sentinel.rs   - Periodic memory check + batch eviction      │
//! │  └─ EvictionSentinel: evicts LRU head while over trigger     │
//! │  └─ Pinned collections never enter the recency record        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Collections stamp the record on every write and read of an evictable
//! document; the sentinel only reads the head and deletes through the owning
//! collection so index entries go with the document.

pub mod recency;
pub mod sentinel;

pub use recency::RecencyRecord;
pub use sentinel::{CycleReport, EvictionConfig, EvictionSentinel};

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document cache: schema-validated collections stored as Redis hashes,
//! queried through secondary indexes.
//!
//! ```text
//! CollectionRegistry ──► Collection ──► KvStore
//!        │                   │
//!        │                   └─► RecencyRecord (evictable collections)
//!        └─ catalog::BUILTIN (11 collections)
//! ```

pub mod catalog;
pub mod collection;
pub mod filter;
pub mod registry;
pub mod schema;

pub use collection::Collection;
pub use filter::{Filter, Op};
pub use registry::CollectionRegistry;
pub use schema::{Document, FieldKind, IndexKind, Schema};

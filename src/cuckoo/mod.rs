// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Probabilistic uniqueness checks shared across processes.
//!
//! - [`filter_manager::UniquenessFilter`]: cuckoo filter with a removal ledger
//! - [`flux::FluxBus`]: pub/sub with TTL-bound payloads
//! - [`unique::UniquenessChecker`]: filter first, store probes on a maybe

pub mod filter_manager;
pub mod flux;
pub mod unique;

pub use filter_manager::{Removal, UniquenessFilter};
pub use flux::FluxBus;
pub use unique::{
    unique_key, warm_from_postgres, CacheIndexProbe, ExistenceProbe, FilterAction, FilterUpdate, MongoProbe,
    PostgresProbe, UniquenessChecker,
};

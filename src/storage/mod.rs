// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backing key-value store seam.
//!
//! - [`traits::KvStore`]: the primitives everything above is built on
//! - [`redis::RedisStore`]: production backend
//! - [`memory::InMemoryStore`]: in-process backend with the same semantics

pub mod traits;
pub mod redis;
pub mod memory;

pub use traits::{KvOp, KvStore, MemoryInfo, MessageStream, ScoreBound, StorageError};

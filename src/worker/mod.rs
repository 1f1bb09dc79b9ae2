// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind workers: one polling loop per shard, scheduling which queue
//! to drain and handing batches to the flush stage.

pub mod dispatch;
pub mod pool;
pub mod scheduler;

pub use dispatch::{BatchOutcome, FlushHandle, FlushJob, FlushStage, StoreOutcome};
pub use pool::{ShardWorker, TickOutcome, WorkerPool};
pub use scheduler::{SchedulerPolicy, Selection};

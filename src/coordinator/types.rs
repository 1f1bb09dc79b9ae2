// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the store coordinator.

/// Store lifecycle state.
///
/// Use [`super::NuboStore::state()`] to read it or
/// [`super::NuboStore::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Just created, not yet started
    Created,
    /// Connecting to Redis, MongoDB and PostgreSQL
    Connecting,
    /// Loading taken values into the uniqueness filter
    WarmingUp,
    /// Background loops running, accepting requests
    Running,
    /// Shutdown signalled, waiting for loops to finish
    ShuttingDown,
    /// Every background loop has exited
    Stopped,
}

impl std::fmt::Display for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::WarmingUp => write!(f, "WarmingUp"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Backends a started store ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Backends {
    /// Redis rather than the in-process store
    pub redis: bool,
    pub mongo: bool,
    pub postgres: bool,
}

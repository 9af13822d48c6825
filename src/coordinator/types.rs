// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Manager state and operation options.
//!
//! # State Transitions
//!
//! ```text
//!          start()              shutdown()
//! Created ─────────→ Running ─────────────→ ShuttingDown ──→ Stopped
//!    │                                                          ↑
//!    └──────────────────────── shutdown() ──────────────────────┘
//! ```
//!
//! - **Created**: After `ReplicationManager::new()`. Progress store open, no tasks.
//! - **Running**: Appliers can be started and collections synchronized.
//! - **ShuttingDown**: Appliers are being stopped and progress flushed.
//! - **Stopped**: Everything drained. Safe to drop.

use crate::document::Tick;
use serde::{Deserialize, Serialize};

/// State of the replication manager.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerState::Created => write!(f, "Created"),
            ManagerState::Running => write!(f, "Running"),
            ManagerState::ShuttingDown => write!(f, "ShuttingDown"),
            ManagerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Options for [`start_replication`](super::ReplicationManager::start_replication).
///
/// Unset fields fall back to the manager's [`ApplierConfig`](crate::config::ApplierConfig).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    pub chunk_size: Option<usize>,
    pub require_from_present: Option<bool>,
    /// Resume from this tick instead of the persisted one. Required when
    /// nothing is persisted; must not be below the persisted tick.
    pub from_tick: Option<Tick>,
}

impl StartOptions {
    pub fn from_tick(tick: Tick) -> Self {
        Self {
            from_tick: Some(tick),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    #[must_use]
    pub fn require_from_present(mut self, required: bool) -> Self {
        self.require_from_present = Some(required);
        self
    }
}

/// Options for [`sync_collection`](super::ReplicationManager::sync_collection).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Reconcile by tree comparison instead of a full dump.
    pub incremental: bool,
    /// Leader endpoint. Defaults to the one the collection already follows,
    /// or the only registered leader.
    pub leader: Option<String>,
}

impl SyncOptions {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn incremental() -> Self {
        Self {
            incremental: true,
            leader: None,
        }
    }

    #[must_use]
    pub fn from_leader(mut self, endpoint: impl Into<String>) -> Self {
        self.leader = Some(endpoint.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_state_display() {
        assert_eq!(ManagerState::Created.to_string(), "Created");
        assert_eq!(ManagerState::Running.to_string(), "Running");
        assert_eq!(ManagerState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(ManagerState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_start_options_builders() {
        let options = StartOptions::from_tick(7).with_chunk_size(10).require_from_present(true);
        assert_eq!(options.from_tick, Some(7));
        assert_eq!(options.chunk_size, Some(10));
        assert_eq!(options.require_from_present, Some(true));
        assert_eq!(StartOptions::default().from_tick, None);
    }

    #[test]
    fn test_sync_options_builders() {
        assert!(!SyncOptions::full().incremental);
        let options = SyncOptions::incremental().from_leader("leader-2");
        assert!(options.incremental);
        assert_eq!(options.leader.as_deref(), Some("leader-2"));
    }
}

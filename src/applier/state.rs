// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Observable applier state.

use crate::document::Tick;
use serde::{Deserialize, Serialize};

/// Whether an applier task is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplierStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for ApplierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Counters accumulated by an applier. Persisted with its progress, so they
/// survive restarts until the collection is forgotten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplierStats {
    pub documents_applied: u64,
    pub removals_applied: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub conflicts_resolved: u64,
    pub entries_fetched: u64,
    pub fetch_requests: u64,
    pub fetch_time_ms: u64,
    pub apply_time_ms: u64,
}

/// Snapshot of one collection's applier, as returned by
/// [`ReplicationManager::applier_state`](crate::ReplicationManager::applier_state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplierState {
    pub collection: String,
    /// Endpoint of the leader being followed.
    pub leader: String,
    pub running: bool,
    /// Everything up to this tick is reflected locally.
    pub last_applied_tick: Tick,
    /// Highest tick the leader has scanned for us. Can run ahead of
    /// `last_applied_tick` while a transaction is open.
    pub last_processed_tick: Tick,
    /// Leader's tick at the last tail.
    pub leader_tick: Tick,
    pub last_error: Option<String>,
    /// Milliseconds since the epoch.
    pub started_at_ms: Option<i64>,
    pub stats: ApplierStats,
}

impl ApplierState {
    pub fn new(collection: impl Into<String>, leader: impl Into<String>, last_applied_tick: Tick) -> Self {
        Self {
            collection: collection.into(),
            leader: leader.into(),
            running: false,
            last_applied_tick,
            last_processed_tick: last_applied_tick,
            leader_tick: last_applied_tick,
            last_error: None,
            started_at_ms: None,
            stats: ApplierStats::default(),
        }
    }

    pub fn status(&self) -> ApplierStatus {
        if self.running {
            ApplierStatus::Running
        } else {
            ApplierStatus::Stopped
        }
    }

    /// Whether everything up to `target` has been applied or skipped.
    pub fn is_caught_up(&self, target: Tick) -> bool {
        self.last_applied_tick >= target || self.last_processed_tick >= target
    }

    /// Ticks behind the leader, as of the last tail.
    pub fn lag(&self) -> u64 {
        self.leader_tick.saturating_sub(self.last_applied_tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_stopped() {
        let state = ApplierState::new("users", "leader-1", 42);
        assert_eq!(state.status(), ApplierStatus::Stopped);
        assert_eq!(state.last_processed_tick, 42);
        assert_eq!(state.lag(), 0);
        assert_eq!(state.status().to_string(), "stopped");
    }

    #[test]
    fn test_caught_up() {
        let mut state = ApplierState::new("users", "leader-1", 10);
        assert!(state.is_caught_up(10));
        assert!(!state.is_caught_up(11));
        state.last_processed_tick = 12;
        assert!(state.is_caught_up(11));
    }

    #[test]
    fn test_stats_deserialize_with_missing_fields() {
        let stats: ApplierStats = serde_json::from_str(r#"{"documents_applied": 3}"#).unwrap();
        assert_eq!(stats.documents_applied, 3);
        assert_eq!(stats.entries_fetched, 0);
    }
}

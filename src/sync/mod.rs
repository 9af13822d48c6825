// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One-shot collection synchronization.
//!
//! Two strategies bring a follower collection to a leader snapshot:
//!
//! - **Full** ([`Synchronizer::full_sync`]): recreate the collection and
//!   bulk-load an ordered dump. Cost is proportional to the collection.
//! - **Incremental** ([`Synchronizer::incremental_sync`]): compare revision
//!   trees, exchange `(key, revision)` lists for divergent ranges only, and
//!   repair them. Cost is proportional to the divergence.
//!
//! Both pin a leader batch for the duration and renew its lease through
//! [`LeaseKeeper`]. The batch is destroyed on every exit path. Either way the
//! result carries the **resume tick**: the snapshot tick from which the
//! applier continues.
//!
//! Callers must make sure no applier writes the collection meanwhile.

mod full;
mod incremental;

pub use incremental::{plan_repairs, ConsistencyReport, RepairPlan};

use crate::batch::BatchInfo;
use crate::circuit_breaker::StoreCircuit;
use crate::config::SyncConfig;
use crate::document::Tick;
use crate::error::Result;
use crate::leader::LeaderRef;
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Counters for one synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub documents_inserted: u64,
    pub documents_removed: u64,
    pub conflicts_resolved: u64,
    pub dump_requests: u64,
    pub tree_requests: u64,
    /// `range_revisions` calls.
    pub keys_requests: u64,
    /// `fetch_documents` calls.
    pub docs_requests: u64,
    pub batch_extensions: u64,
    /// Time spent waiting on the leader.
    pub leader_wait_ms: u64,
}

/// Result of a successful synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub collection: String,
    pub incremental: bool,
    /// Tick of the snapshot the collection now matches.
    pub resume_tick: Tick,
    pub stats: SyncStats,
    /// Divergent ranges repaired across all rounds.
    pub ranges_repaired: usize,
    /// Verification rounds run after the initial repair.
    pub verification_rounds: u32,
}

/// Runs synchronizations of one leader into one local store.
pub struct Synchronizer<'a, L: LeaderRef, S: DocumentStore> {
    leader: &'a L,
    store: &'a S,
    circuit: &'a StoreCircuit,
    config: &'a SyncConfig,
}

impl<'a, L: LeaderRef, S: DocumentStore> Synchronizer<'a, L, S> {
    pub fn new(leader: &'a L, store: &'a S, circuit: &'a StoreCircuit, config: &'a SyncConfig) -> Self {
        Self {
            leader,
            store,
            circuit,
            config,
        }
    }

    /// Run a leader call, accounting the wait.
    async fn timed<T>(&self, stats: &mut SyncStats, call: impl Future<Output = Result<T>>) -> Result<T> {
        let started = Instant::now();
        let result = call.await;
        stats.leader_wait_ms += u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result
    }

    /// Destroy a batch, logging instead of failing.
    async fn release(&self, batch: &BatchInfo) {
        if let Err(e) = self.leader.destroy_batch(batch.id).await {
            warn!(batch_id = batch.id, error = %e, "Failed to destroy batch");
        }
    }
}

/// Keeps a batch lease alive during a long synchronization.
///
/// Call [`keep_alive`](Self::keep_alive) between leader requests; the lease is
/// extended once half of the TTL has elapsed since the last extension.
#[derive(Debug)]
pub struct LeaseKeeper {
    batch_id: u64,
    ttl: Duration,
    renewed_at: Instant,
}

impl LeaseKeeper {
    pub fn new(batch_id: u64, ttl: Duration) -> Self {
        Self {
            batch_id,
            ttl,
            renewed_at: Instant::now(),
        }
    }

    pub fn is_due(&self) -> bool {
        self.renewed_at.elapsed() >= self.ttl / 2
    }

    /// Extend the lease if due. Returns whether it was extended.
    pub async fn keep_alive<L: LeaderRef + ?Sized>(&mut self, leader: &L) -> Result<bool> {
        if !self.is_due() {
            return Ok(false);
        }
        leader.extend_batch(self.batch_id, self.ttl).await?;
        self.renewed_at = Instant::now();
        debug!(batch_id = self.batch_id, "Extended batch lease");
        Ok(true)
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Incremental reconciliation by revision-tree comparison.
//!
//! # Algorithm
//!
//! 1. Pin a leader batch and fetch its tree summary
//! 2. Leader empty → truncate locally, done
//! 3. Diff the local tree against the summary → divergent key ranges
//! 4. Per group of ranges, fetch the leader's `(key, revision)` list and
//!    merge it with the local one:
//!    - local only → remove
//!    - leader only, or revisions differ → fetch and write (leader wins)
//! 5. Destroy the batch, then verify against a fresh snapshot, repairing
//!    whatever is still divergent, a bounded number of times. Verification
//!    rounds request the leader summary with per-leaf entries and reject it
//!    if the entries do not add up to the leaves
//!
//! A collection that keeps diverging after the last verification round is
//! reported as [`ReplicationError::Inconsistent`]; it is never escalated to a
//! full sync automatically.

use super::{LeaseKeeper, SyncOutcome, SyncStats, Synchronizer};
use crate::batch::BatchInfo;
use crate::conflict::{apply_unit, ChunkWrites};
use crate::document::Tick;
use crate::error::{ReplicationError, Result};
use crate::leader::LeaderRef;
use crate::metrics;
use crate::store::{DocumentStore, LocalOp};
use crate::tree::{KeyRange, RevisionTree, TreeEntry, TreeError, TreeSummary};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What a divergent range needs locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairPlan {
    /// Keys the leader does not have.
    pub remove: Vec<String>,
    /// Keys missing locally or held at another revision.
    pub fetch: Vec<String>,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.fetch.is_empty()
    }
}

/// Merge two `(key, revision)` lists ordered by position then key.
pub fn plan_repairs(leader: &[TreeEntry], local: &[TreeEntry]) -> RepairPlan {
    let mut plan = RepairPlan::default();
    let (mut i, mut j) = (0, 0);
    while i < leader.len() && j < local.len() {
        let (theirs, ours) = (&leader[i], &local[j]);
        match theirs.sort_key().cmp(&ours.sort_key()) {
            Ordering::Less => {
                plan.fetch.push(theirs.key.clone());
                i += 1;
            }
            Ordering::Greater => {
                plan.remove.push(ours.key.clone());
                j += 1;
            }
            Ordering::Equal => {
                if theirs.revision != ours.revision {
                    plan.fetch.push(theirs.key.clone());
                }
                i += 1;
                j += 1;
            }
        }
    }
    plan.fetch.extend(leader[i..].iter().map(|e| e.key.clone()));
    plan.remove.extend(local[j..].iter().map(|e| e.key.clone()));
    plan
}

/// Outcome of [`Synchronizer::verify_consistency`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub collection: String,
    pub consistent: bool,
    pub divergent_ranges: Vec<KeyRange>,
    /// Tick of the leader snapshot compared against.
    pub leader_tick: Tick,
    pub leader_count: u64,
    pub local_count: u64,
    pub leader_hash: u64,
    pub local_hash: u64,
}

struct Round {
    tick: Tick,
    divergent: Vec<KeyRange>,
}

impl<L: LeaderRef, S: DocumentStore> Synchronizer<'_, L, S> {
    /// Repair the local collection against the leader's current snapshot.
    ///
    /// Creates the local collection from the leader's definition if it does
    /// not exist yet.
    #[instrument(skip(self), fields(leader = %self.leader.endpoint()))]
    pub async fn incremental_sync(&self, collection: &str) -> Result<SyncOutcome> {
        let started = Instant::now();
        let mut stats = SyncStats::default();

        let result = self.incremental_sync_inner(collection, &mut stats).await;
        metrics::record_sync(collection, "incremental", result.is_ok(), started.elapsed());
        metrics::record_sync_documents(collection, stats.documents_inserted, stats.documents_removed);

        match result {
            Ok((resume_tick, ranges_repaired, verification_rounds)) => {
                info!(
                    resume_tick,
                    ranges_repaired,
                    verification_rounds,
                    inserted = stats.documents_inserted,
                    removed = stats.documents_removed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Incremental sync complete"
                );
                Ok(SyncOutcome {
                    collection: collection.to_string(),
                    incremental: true,
                    resume_tick,
                    stats,
                    ranges_repaired,
                    verification_rounds,
                })
            }
            Err(e) => {
                warn!(error = %e, "Incremental sync failed");
                Err(e)
            }
        }
    }

    async fn incremental_sync_inner(&self, collection: &str, stats: &mut SyncStats) -> Result<(Tick, usize, u32)> {
        let spec = self.timed(stats, self.leader.collection_spec(collection)).await?;
        if self.circuit.write(|| self.store.ensure_collection(spec.clone())).await? {
            info!("Created local collection from leader definition");
        } else {
            let indexes = spec.indexes.len();
            let alignment = self.circuit.write(|| self.store.align_indexes(spec)).await?;
            if alignment.changed {
                info!(
                    indexes,
                    dropped = alignment.dropped.len(),
                    "Aligned local indexes with leader definition"
                );
                stats.documents_removed += alignment.dropped.len() as u64;
            }
        }

        let first = self.repair_round(collection, false, stats).await?;
        let mut resume_tick = first.tick;
        let mut ranges_repaired = first.divergent.len();
        let mut pending = first.divergent;
        let mut rounds = 0u32;
        let attempts = self.config.verify_attempts.max(1);

        while self.config.verify_after_repair && !pending.is_empty() {
            if rounds >= attempts {
                warn!(rounds, ranges = pending.len(), "Still divergent after verification");
                return Err(ReplicationError::Inconsistent {
                    collection: collection.to_string(),
                    ranges: pending,
                });
            }
            rounds += 1;
            let round = self.repair_round(collection, true, stats).await?;
            metrics::record_verification(collection, round.divergent.is_empty());
            debug!(round = rounds, divergent = round.divergent.len(), "Verification round");
            resume_tick = round.tick;
            ranges_repaired += round.divergent.len();
            pending = round.divergent;
        }
        Ok((resume_tick, ranges_repaired, rounds))
    }

    /// One batch: diff and repair. Returns the ranges that were divergent.
    ///
    /// Verification rounds request the leader summary in verification mode
    /// and check it before diffing.
    async fn repair_round(&self, collection: &str, verifying: bool, stats: &mut SyncStats) -> Result<Round> {
        let batch = self
            .timed(stats, self.leader.create_batch(collection, self.config.batch_ttl()))
            .await?;
        let result = self.repair_against(collection, &batch, verifying, stats).await;
        self.release(&batch).await;
        Ok(Round {
            tick: batch.tick,
            divergent: result?,
        })
    }

    async fn repair_against(
        &self,
        collection: &str,
        batch: &BatchInfo,
        verifying: bool,
        stats: &mut SyncStats,
    ) -> Result<Vec<KeyRange>> {
        let mut lease = LeaseKeeper::new(batch.id, self.config.batch_ttl());
        let summary = self
            .timed(stats, self.leader.tree_summary(collection, batch.id, verifying, verifying))
            .await?;
        stats.tree_requests += 1;
        if verifying {
            check_summary(&summary)?;
        }

        if summary.count == 0 {
            let removed = self.circuit.write(|| self.store.truncate(collection)).await?;
            stats.documents_removed += removed;
            if removed == 0 {
                return Ok(Vec::new());
            }
            debug!(removed, "Leader collection empty, truncated local copy");
            return Ok(vec![KeyRange::FULL]);
        }

        let local = self.circuit.read(|| self.store.revision_tree(collection)).await?;
        let divergent = local.diff_leaves(&summary)?;
        metrics::record_divergent_ranges(collection, divergent.len());
        if divergent.is_empty() {
            debug!(count = summary.count, "Trees agree");
            return Ok(divergent);
        }
        debug!(
            ranges = divergent.len(),
            leader_count = summary.count,
            local_count = local.count(),
            "Trees diverge"
        );

        for group in divergent.chunks(self.config.ranges_per_request.max(1)) {
            if lease.keep_alive(self.leader).await? {
                stats.batch_extensions += 1;
            }
            let theirs = self
                .timed(stats, self.leader.range_revisions(collection, batch.id, group))
                .await?;
            stats.keys_requests += 1;
            let ours = self.circuit.read(|| self.store.range_revisions(collection, group)).await?;

            let plan = plan_repairs(&theirs, &ours);
            if plan.is_empty() {
                continue;
            }
            self.repair(collection, batch, plan, &mut lease, stats).await?;
        }
        Ok(divergent)
    }

    async fn repair(
        &self,
        collection: &str,
        batch: &BatchInfo,
        plan: RepairPlan,
        lease: &mut LeaseKeeper,
        stats: &mut SyncStats,
    ) -> Result<()> {
        if !plan.remove.is_empty() {
            let removed = plan.remove.len();
            let ops = plan.remove.into_iter().map(|key| LocalOp::Remove { key }).collect();
            apply_unit(self.store, self.circuit, collection, ops, 0, &ChunkWrites::new()).await?;
            stats.documents_removed += removed as u64;
        }

        for keys in plan.fetch.chunks(self.config.fetch_chunk_size.max(1)) {
            if lease.keep_alive(self.leader).await? {
                stats.batch_extensions += 1;
            }
            let documents = self
                .timed(stats, self.leader.fetch_documents(collection, batch.id, keys))
                .await?;
            stats.docs_requests += 1;

            let fetched = documents.len();
            let ops: Vec<LocalOp> = documents.into_iter().map(LocalOp::Put).collect();
            let report = apply_unit(self.store, self.circuit, collection, ops, 0, &ChunkWrites::new()).await?;
            stats.documents_inserted += fetched as u64;
            stats.conflicts_resolved += report.conflicts_resolved as u64;
        }
        Ok(())
    }

    /// Compare the local collection with a fresh leader snapshot without
    /// changing anything.
    ///
    /// The leader summary is requested in verification mode and checked
    /// against its own entries before it is trusted.
    #[instrument(skip(self), fields(leader = %self.leader.endpoint()))]
    pub async fn verify_consistency(&self, collection: &str) -> Result<ConsistencyReport> {
        if self
            .circuit
            .read(|| self.store.collection_spec(collection))
            .await?
            .is_none()
        {
            return Err(ReplicationError::collection_not_found(collection));
        }

        let batch = self.leader.create_batch(collection, self.config.batch_ttl()).await?;
        let summary = self.leader.tree_summary(collection, batch.id, true, true).await;
        self.release(&batch).await;
        let summary = summary?;
        check_summary(&summary)?;

        let local = self.circuit.read(|| self.store.revision_tree(collection)).await?;
        let divergent_ranges = local.diff_leaves(&summary)?;
        let consistent = divergent_ranges.is_empty();
        metrics::record_verification(collection, consistent);
        let root = local.root();
        info!(consistent, ranges = divergent_ranges.len(), "Consistency check complete");

        Ok(ConsistencyReport {
            collection: collection.to_string(),
            consistent,
            divergent_ranges,
            leader_tick: batch.tick,
            leader_count: summary.count,
            local_count: root.count,
            leader_hash: summary.hash,
            local_hash: root.hash,
        })
    }
}

/// Reject a verification-mode summary whose leaves disagree with the
/// entries attached to them.
fn check_summary(summary: &TreeSummary) -> Result<()> {
    let bad_leaves = summary.verify();
    if bad_leaves.is_empty() {
        return Ok(());
    }
    warn!(leaves = bad_leaves.len(), "Leader summary failed verification");
    let entries = summary
        .leaves
        .iter()
        .flat_map(|leaf| leaf.entries.iter().flatten())
        .map(|e| (e.key.as_str(), e.revision));
    let recomputed = RevisionTree::build(summary.config(), entries)?.root();
    Err(TreeError::Corrupt {
        declared_count: summary.count,
        declared_hash: summary.hash,
        computed_count: recomputed.count,
        computed_hash: recomputed.hash,
    }
    .into())
}

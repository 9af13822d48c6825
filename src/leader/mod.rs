// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The leader seam.
//!
//! Everything the follower needs from a leader goes through [`LeaderRef`]:
//! leased snapshots (batches), dumps, revision-tree summaries, range
//! listings, document fetches and log tailing. The wire protocol is out of
//! scope; [`InMemoryLeader`] implements the trait in-process and is what the
//! tests replicate from.
//!
//! Snapshot-bound calls take a `batch_id`. A batch that has expired yields
//! [`ReplicationError::BatchExpired`](crate::ReplicationError::BatchExpired);
//! an unknown collection yields
//! [`ReplicationError::CollectionNotFound`](crate::ReplicationError::CollectionNotFound).

mod memory;

pub use memory::{InMemoryLeader, LeaderTransaction};

use crate::batch::BatchInfo;
use crate::document::{CollectionSpec, Document, Tick};
use crate::oplog::TailChunk;
use crate::store::DumpCursor;
use crate::tree::{KeyRange, TreeEntry, TreeSummary};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by leader calls.
pub type LeaderFuture<'a, T> = Pin<Box<dyn Future<Output = crate::Result<T>> + Send + 'a>>;

/// One page of a dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpChunk {
    pub documents: Vec<Document>,
    /// Where to continue; `None` once the snapshot is exhausted.
    pub next: Option<DumpCursor>,
}

/// Operations a follower performs against its leader.
pub trait LeaderRef: Send + Sync + 'static {
    /// Identifies the leader in logs, errors and persisted progress.
    fn endpoint(&self) -> &str;

    /// Latest tick in the leader's log.
    fn current_tick(&self) -> LeaderFuture<'_, Tick>;

    fn collection_spec<'a>(&'a self, collection: &'a str) -> LeaderFuture<'a, CollectionSpec>;

    /// Pin a snapshot of the current state for synchronizing `collection`.
    ///
    /// The batch tick is one a follower can tail `collection` from: it lies
    /// before every transaction still open on that collection.
    fn create_batch<'a>(&'a self, collection: &'a str, ttl: Duration) -> LeaderFuture<'a, BatchInfo>;

    fn extend_batch(&self, batch_id: u64, ttl: Duration) -> LeaderFuture<'_, ()>;

    /// Release a batch. Unknown ids are ignored.
    fn destroy_batch(&self, batch_id: u64) -> LeaderFuture<'_, ()>;

    /// Documents of the snapshot after `after`, in key-position order.
    fn dump<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        after: Option<DumpCursor>,
        limit: usize,
    ) -> LeaderFuture<'a, DumpChunk>;

    /// Log entries for `collection` with tick greater than `after`.
    fn tail<'a>(&'a self, collection: &'a str, after: Tick, limit: usize) -> LeaderFuture<'a, TailChunk>;

    fn tree_summary<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        only_populated: bool,
        verification: bool,
    ) -> LeaderFuture<'a, TreeSummary>;

    fn range_revisions<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        ranges: &'a [KeyRange],
    ) -> LeaderFuture<'a, Vec<TreeEntry>>;

    /// Documents by key from the snapshot; missing keys are skipped.
    fn fetch_documents<'a>(
        &'a self,
        collection: &'a str,
        batch_id: u64,
        keys: &'a [String],
    ) -> LeaderFuture<'a, Vec<Document>>;
}
